mod agents;
mod cli;
mod config;
mod credentials;
mod paths;
mod resources;
mod sandbox;
mod util;
mod workspace;

use std::io::{Read, Seek, Write};
use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, ConfigAction, ProfileAction};
use crate::config::UserConfig;
use crate::sandbox::backends::driver_for;
use crate::sandbox::error::{Error, Result};
use crate::sandbox::manager::{Confirm, CreateRequest, Manager, ResetOptions};
use crate::sandbox::types::Status;
use crate::workspace::apply::{ApplyMode, DiffOptions};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("yoloai=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    // One cancellation context per invocation; SIGINT trips it and every
    // blocking call below notices.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match run(cli, cancel).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("yoloai: {err}");
            if let Error::Driver {
                stderr: Some(stderr),
                ..
            } = &err
            {
                eprintln!("{stderr}");
            }
            std::process::exit(err.exit_code());
        }
    }
}

/// Reads confirmations from the terminal; `--yes` skips it entirely.
struct TtyConfirm;

impl Confirm for TtyConfirm {
    fn confirm(&self, message: &str) -> bool {
        eprint!("{message} [y/N] ");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim(), "y" | "Y" | "yes")
    }
}

/// Positional sandbox name, with `YOLOAI_SANDBOX` as the fallback.
fn resolve_name(name: Option<String>) -> Result<String> {
    name.or_else(|| std::env::var("YOLOAI_SANDBOX").ok().filter(|s| !s.is_empty()))
        .ok_or_else(|| {
            Error::Usage("no sandbox name given (set YOLOAI_SANDBOX or pass one)".into())
        })
}

fn build_manager(profile: &str, cancel: &CancellationToken) -> Result<Manager> {
    let root = paths::data_root();
    let profile_dir = paths::profile_dir(&root, profile);
    resources::seed_profile(&profile_dir)?;
    let config = UserConfig::load(&profile_dir)?;
    let driver = driver_for(config.backend, &root, &config)?;
    Ok(Manager::new(
        root,
        profile.to_string(),
        config,
        driver,
        cancel.clone(),
        Box::new(TtyConfirm),
    ))
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<i32> {
    let root = paths::data_root();
    match cli.command {
        Command::Version => {
            println!("yoloai {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }

        Command::Config { action } => {
            let profile_dir = paths::profile_dir(&root, &cli.profile);
            resources::seed_profile(&profile_dir)?;
            let config = UserConfig::load(&profile_dir)?;
            match action {
                ConfigAction::Get { key } => {
                    println!("{}", config.get(&key)?);
                }
                ConfigAction::Set { key, value } => {
                    config.set(&key, &value)?.save(&profile_dir)?;
                }
                ConfigAction::Reset => {
                    UserConfig::default().save(&profile_dir)?;
                }
            }
            Ok(0)
        }

        Command::Profile { action } => {
            match action {
                ProfileAction::Create { name } => {
                    sandbox::manager::validate_name(&name)?;
                    let dir = paths::profile_dir(&root, &name);
                    if dir.exists() {
                        return Err(Error::Usage(format!("profile '{name}' already exists")));
                    }
                    resources::seed_profile(&dir)?;
                    UserConfig::default().save(&dir)?;
                }
                ProfileAction::List => {
                    if let Ok(entries) = std::fs::read_dir(paths::profiles_dir(&root)) {
                        let mut names: Vec<String> = entries
                            .flatten()
                            .filter(|e| e.path().is_dir())
                            .map(|e| e.file_name().to_string_lossy().into_owned())
                            .collect();
                        names.sort();
                        for name in names {
                            println!("{name}");
                        }
                    }
                }
                ProfileAction::Delete { name } => {
                    if name == "base" {
                        return Err(Error::Usage("the base profile cannot be deleted".into()));
                    }
                    let dir = paths::profile_dir(&root, &name);
                    if !dir.exists() {
                        return Err(Error::Usage(format!("no profile named '{name}'")));
                    }
                    std::fs::remove_dir_all(&dir)
                        .map_err(|e| Error::io("delete profile dir", e))?;
                }
            }
            Ok(0)
        }

        Command::Log { name, follow } => {
            let name = resolve_name(name)?;
            let log = paths::SandboxPaths::new(&root, &name).log_file();
            if !log.exists() {
                return Err(Error::Usage(format!("no log for sandbox '{name}'")));
            }
            print_log(&log, follow, &cancel).await?;
            Ok(0)
        }

        Command::New {
            name,
            workdir,
            agent,
            model,
            dirs,
            network,
            network_allow,
            ports,
            prompt,
            replace,
            no_start,
            yes,
            force_paths,
        } => {
            let manager = build_manager(&cli.profile, &cancel)?;
            // The image must exist before the first instance does.
            let mut err_out = std::io::stderr();
            manager.build_image(false, &mut err_out).await?;
            let req = CreateRequest {
                name: name.clone(),
                agent,
                model,
                workdir,
                dirs,
                network,
                network_allow,
                ports,
                prompt,
                replace,
                no_start,
                yes,
                force_paths,
            };
            manager.create(&req).await?;
            eprintln!("sandbox '{name}' created");
            manager.close().await;
            Ok(0)
        }

        Command::Attach { name } => {
            let name = resolve_name(name)?;
            let manager = build_manager(&cli.profile, &cancel)?;
            let code = manager.attach(&name).await?;
            manager.close().await;
            Ok(code)
        }

        Command::Show { name, json } => {
            let name = resolve_name(name)?;
            let manager = build_manager(&cli.profile, &cancel)?;
            let result = show(&manager, &name, json).await;
            manager.close().await;
            render_json_error(result, json)
        }

        Command::Diff { name, stat, paths } => {
            let name = resolve_name(name)?;
            let manager = build_manager(&cli.profile, &cancel)?;
            let opts = DiffOptions { stat, paths };
            let diff = manager.diff(&name, &opts).await?;
            print!("{diff}");
            manager.close().await;
            Ok(0)
        }

        Command::Apply {
            name,
            squash,
            export,
            no_wip,
            force,
            paths,
        } => {
            let name = resolve_name(name)?;
            let manager = build_manager(&cli.profile, &cancel)?;
            let mode = if let Some(dir) = export {
                ApplyMode::Export(dir)
            } else if squash {
                ApplyMode::Squash
            } else {
                ApplyMode::CommitPreserving { keep_wip: !no_wip }
            };
            let report = manager.apply(&name, &mode, &paths, force).await?;
            if report.nothing_to_apply() {
                eprintln!("nothing to apply");
            } else if !report.exported.is_empty() {
                for patch in &report.exported {
                    println!("{}", patch.display());
                }
            } else {
                eprintln!(
                    "applied {} commit(s){}",
                    report.commits_applied,
                    if report.wip_applied {
                        " plus uncommitted work"
                    } else {
                        ""
                    }
                );
            }
            manager.close().await;
            Ok(0)
        }

        Command::List { json } => {
            let manager = build_manager(&cli.profile, &cancel)?;
            let result = list(&manager, json).await;
            manager.close().await;
            render_json_error(result, json)
        }

        Command::Exec {
            name,
            interactive,
            argv,
        } => {
            let name = resolve_name(name)?;
            let manager = build_manager(&cli.profile, &cancel)?;
            let code = manager.exec(&name, &argv, interactive).await?;
            manager.close().await;
            Ok(code as i32)
        }

        Command::Stop { name } => {
            let name = resolve_name(name)?;
            let manager = build_manager(&cli.profile, &cancel)?;
            manager.stop(&name).await?;
            manager.close().await;
            Ok(0)
        }

        Command::Start { name } => {
            let name = resolve_name(name)?;
            let manager = build_manager(&cli.profile, &cancel)?;
            manager.start(&name).await?;
            manager.close().await;
            Ok(0)
        }

        Command::Restart { name } => {
            let name = resolve_name(name)?;
            let manager = build_manager(&cli.profile, &cancel)?;
            manager.restart(&name).await?;
            manager.close().await;
            Ok(0)
        }

        Command::Destroy { name, yes } => {
            let name = resolve_name(name)?;
            let manager = build_manager(&cli.profile, &cancel)?;
            manager.destroy(&name, yes).await?;
            manager.close().await;
            Ok(0)
        }

        Command::Reset {
            name,
            no_restart,
            clean,
            reprompt,
        } => {
            let name = resolve_name(name)?;
            let manager = build_manager(&cli.profile, &cancel)?;
            manager
                .reset(
                    &name,
                    &ResetOptions {
                        in_place: no_restart,
                        clean,
                        reprompt,
                    },
                )
                .await?;
            manager.close().await;
            Ok(0)
        }

        Command::Build { force } => {
            let manager = build_manager(&cli.profile, &cancel)?;
            let mut err_out = std::io::stderr();
            manager.build_image(force, &mut err_out).await?;
            manager.close().await;
            Ok(0)
        }

        Command::Prune { dry_run } => {
            let manager = build_manager(&cli.profile, &cancel)?;
            let mut err_out = std::io::stderr();
            let orphans = manager.prune(dry_run, &mut err_out).await?;
            if orphans.is_empty() {
                eprintln!("nothing to prune");
            }
            manager.close().await;
            Ok(0)
        }

        Command::NetworkAllow { name, domains } => {
            let name = resolve_name(name)?;
            let manager = build_manager(&cli.profile, &cancel)?;
            manager.network_allow(&name, &domains).await?;
            manager.close().await;
            Ok(0)
        }
    }
}

fn render_json_error(result: Result<i32>, json: bool) -> Result<i32> {
    match result {
        Err(err) if json => {
            eprintln!("{}", serde_json::json!({ "error": err.to_string() }));
            Ok(err.exit_code())
        }
        other => other,
    }
}

async fn show(manager: &Manager, name: &str, json: bool) -> Result<i32> {
    let (meta, status) = manager.status(name).await?;
    let paths = manager.paths(name);
    let disk = util::fs::dir_size(paths.dir());

    let Some(meta) = meta else {
        if json {
            println!(
                "{}",
                serde_json::json!({ "name": name, "status": Status::Broken })
            );
        } else {
            println!("{name}: broken (meta.json unreadable); `yoloai destroy {name}` to clean up");
        }
        return Ok(0);
    };

    if json {
        let mut value = serde_json::to_value(&meta)
            .map_err(|e| Error::Other(format!("serialize meta: {e}")))?;
        value["status"] = serde_json::to_value(status).unwrap_or_default();
        value["disk_bytes"] = serde_json::json!(disk);
        println!("{value}");
        return Ok(0);
    }

    println!("name:     {}", meta.name);
    println!("status:   {status}");
    println!("agent:    {}{}", meta.agent, match &meta.model {
        Some(model) => format!(" ({model})"),
        None => String::new(),
    });
    println!("backend:  {} ({})", meta.backend, meta.image_ref);
    println!("created:  {}", meta.created_at.to_rfc3339());
    println!(
        "workdir:  {} [{}]",
        meta.workdir.host_path.display(),
        meta.workdir.mode
    );
    for dir in &meta.directories {
        println!("dir:      {} [{}]", dir.host_path.display(), dir.mode);
    }
    if meta.network_mode != sandbox::types::NetworkMode::Default {
        println!(
            "network:  {}",
            serde_json::to_value(meta.network_mode)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default()
        );
        for domain in &meta.network_allow {
            println!("allow:    {domain}");
        }
    }
    for port in &meta.ports {
        println!("port:     {}:{}/{}", port.host, port.instance, port.protocol);
    }
    if meta.has_prompt {
        println!("prompt:   {}", paths.prompt_file().display());
    }
    println!("disk:     {}", util::fs::human_size(disk));
    println!("log:      {}", paths.log_file().display());
    Ok(0)
}

async fn list(manager: &Manager, json: bool) -> Result<i32> {
    let entries = manager.list().await?;
    if json {
        let value: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "name": e.name,
                    "status": e.status,
                    "agent": e.agent,
                    "backend": e.backend,
                    "created_at": e.created_at,
                    "disk_bytes": e.disk_bytes,
                    "has_changes": e.has_changes,
                })
            })
            .collect();
        println!("{}", serde_json::Value::Array(value));
        return Ok(0);
    }
    if entries.is_empty() {
        eprintln!("no sandboxes");
        return Ok(0);
    }
    println!(
        "{:<20} {:<9} {:<10} {:<9} {:>9}  {}",
        "NAME", "STATUS", "AGENT", "CHANGES", "DISK", "CREATED"
    );
    for e in entries {
        println!(
            "{:<20} {:<9} {:<10} {:<9} {:>9}  {}",
            e.name,
            e.status.to_string(),
            e.agent,
            if e.has_changes { "yes" } else { "-" },
            util::fs::human_size(e.disk_bytes),
            e.created_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".into()),
        );
    }
    Ok(0)
}

/// Print the session log; with `follow`, poll for growth until interrupted.
async fn print_log(path: &PathBuf, follow: bool, cancel: &CancellationToken) -> Result<()> {
    let mut file = std::fs::File::open(path).map_err(|e| Error::io("open log", e))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)
        .map_err(|e| Error::io("read log", e))?;
    print!("{buf}");
    let _ = std::io::stdout().flush();
    if !follow {
        return Ok(());
    }
    let mut offset = file
        .stream_position()
        .map_err(|e| Error::io("seek log", e))?;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }
        let len = std::fs::metadata(path)
            .map_err(|e| Error::io("stat log", e))?
            .len();
        if len > offset {
            file.seek(std::io::SeekFrom::Start(offset))
                .map_err(|e| Error::io("seek log", e))?;
            let mut chunk = String::new();
            file.read_to_string(&mut chunk)
                .map_err(|e| Error::io("read log", e))?;
            print!("{chunk}");
            let _ = std::io::stdout().flush();
            offset = len;
        }
    }
}
