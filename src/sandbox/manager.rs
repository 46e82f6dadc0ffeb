use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::backends::{Driver, Output};
use super::error::{Error, Result};
use super::launcher::{self, LauncherConfig};
use super::meta::Meta;
use super::types::{
    parse_dir_arg, DirMode, DirSpec, InstanceConfig, Mount, NetworkMode, PortMap, Status,
};
use crate::agents::{find_agent, AgentDef};
use crate::config::{CopyStrategy, UserConfig};
use crate::credentials::{self, Keychain, StagedSecrets};
use crate::paths::{SandboxPaths, BASE_IMAGE, GUEST_DIR, GUEST_SECRETS_DIR};
use crate::resources;
use crate::util::fs::{atomic_write, dir_size};
use crate::workspace::{self, apply::ApplyMode, apply::ApplyReport, apply::DiffOptions};

/// In-instance home the container image ships; state-dir mounts land here.
const GUEST_HOME: &str = "/home/agent";

/// Asks the user before destructive steps. The CLI reads the TTY; tests
/// script answers.
pub trait Confirm: Send + Sync {
    fn confirm(&self, message: &str) -> bool;
}

pub struct AlwaysYes;

impl Confirm for AlwaysYes {
    fn confirm(&self, _message: &str) -> bool {
        true
    }
}

/// Request to create a sandbox, as parsed from the CLI.
#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub name: String,
    pub agent: String,
    pub model: Option<String>,
    /// `PATH[:ro|rw|copy]`; mode defaults to copy.
    pub workdir: String,
    /// Auxiliary directories, same syntax.
    pub dirs: Vec<String>,
    pub network: Option<String>,
    pub network_allow: Vec<String>,
    pub ports: Vec<String>,
    pub prompt: Option<String>,
    pub replace: bool,
    pub no_start: bool,
    /// Skip confirmations.
    pub yes: bool,
    /// Override overlap and dangerous-target validation.
    pub force_paths: bool,
}

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub name: String,
    pub status: Status,
    pub agent: String,
    pub backend: String,
    pub created_at: Option<chrono::DateTime<Utc>>,
    pub disk_bytes: u64,
    pub has_changes: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResetOptions {
    /// In-place: resync while the agent keeps running.
    pub in_place: bool,
    /// Wipe agent-state (restart variant only).
    pub clean: bool,
    /// Re-deliver the original prompt.
    pub reprompt: bool,
}

/// Orchestrates the sandbox lifecycle over one backend driver.
pub struct Manager {
    root: PathBuf,
    profile: String,
    config: UserConfig,
    driver: Box<dyn Driver>,
    cancel: CancellationToken,
    confirm: Box<dyn Confirm>,
    env: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
    keychain: Box<dyn Keychain>,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        profile: String,
        config: UserConfig,
        driver: Box<dyn Driver>,
        cancel: CancellationToken,
        confirm: Box<dyn Confirm>,
    ) -> Self {
        Self {
            root,
            profile,
            config,
            driver,
            cancel,
            confirm,
            env: Box::new(|key| std::env::var(key).ok()),
            keychain: Box::new(credentials::SecurityCliKeychain),
        }
    }

    #[cfg(test)]
    pub fn with_env(
        mut self,
        env: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env = Box::new(env);
        self
    }

    pub fn paths(&self, name: &str) -> SandboxPaths {
        SandboxPaths::new(&self.root, name)
    }

    pub fn profile_dir(&self) -> PathBuf {
        crate::paths::profile_dir(&self.root, &self.profile)
    }

    fn image_ref(&self) -> String {
        self.config
            .image
            .clone()
            .unwrap_or_else(|| BASE_IMAGE.to_string())
    }

    // ── Create ──────────────────────────────────────────────────────

    pub async fn create(&self, req: &CreateRequest) -> Result<()> {
        // Step 1: validation. Nothing touches disk until all of it passes.
        validate_name(&req.name)?;
        let agent = find_agent(&req.agent).ok_or_else(|| {
            Error::Usage(format!(
                "unknown agent '{}' (available: {})",
                req.agent,
                crate::agents::agent_names().join(", ")
            ))
        })?;
        if matches!(self.config.copy_strategy, CopyStrategy::Overlay) {
            return Err(Error::Config(
                "copy_strategy 'overlay' is not supported yet; use 'full' or 'auto'".into(),
            ));
        }

        let mut workdir = parse_dir_arg(&req.workdir, DirMode::Copy)?;
        let mut directories = Vec::new();
        for arg in &req.dirs {
            directories.push(parse_dir_arg(arg, DirMode::Copy)?);
        }
        validate_dirs(&mut workdir, &mut directories, req.force_paths)?;

        let network_mode: NetworkMode = req
            .network
            .as_deref()
            .unwrap_or("")
            .parse()?;
        let mut ports = Vec::new();
        for arg in &req.ports {
            ports.push(arg.parse::<PortMap>()?);
        }

        // Required credentials, collected before anything exists on disk.
        let plan = credentials::collect(&agent, &self.env, self.keychain.as_ref())?;

        // Dirty live/copy source repos lose uncommitted work silently when
        // the agent's changes land later; make the user acknowledge it.
        if !req.yes {
            for dir in std::iter::once(&workdir).chain(directories.iter()) {
                if matches!(dir.mode, DirMode::Rw | DirMode::Copy)
                    && dir.host_path.join(".git").exists()
                    && workspace::has_changes(&dir.host_path, &self.cancel).await
                {
                    let message = format!(
                        "{} has uncommitted changes; continue?",
                        dir.host_path.display()
                    );
                    if !self.confirm.confirm(&message) {
                        return Err(Error::Usage("aborted".into()));
                    }
                }
            }
        }

        // Step 2: replace semantics.
        let final_paths = self.paths(&req.name);
        if final_paths.dir().exists() {
            if !req.replace {
                return Err(Error::Usage(format!(
                    "sandbox '{}' already exists (use --replace)",
                    req.name
                )));
            }
            self.destroy(&req.name, req.yes).await?;
        }

        // Step 3: atomic allocation. Populate under a temp name, rename at
        // the end; the guard removes whatever exists if anything fails.
        let sandboxes = crate::paths::sandboxes_dir(&self.root);
        std::fs::create_dir_all(&sandboxes).map_err(|e| Error::io("create sandboxes dir", e))?;
        let tmp_dir = sandboxes.join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir(&tmp_dir).map_err(|e| Error::io("allocate sandbox dir", e))?;
        let mut guard = DirGuard::new(tmp_dir.clone());
        let build_paths = SandboxPaths::from_dir(tmp_dir.clone());

        let result = self
            .create_inner(
                req,
                &agent,
                workdir,
                directories,
                network_mode,
                ports,
                plan,
                &build_paths,
                &final_paths,
                &mut guard,
            )
            .await;
        match result {
            Ok(()) => {
                guard.disarm();
                Ok(())
            }
            Err(e) => {
                // The guard removes the directory; a half-created backend
                // instance is cleaned up best-effort as well.
                let _ = self
                    .driver
                    .remove(&final_paths.instance(), &self.cancel)
                    .await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_inner(
        &self,
        req: &CreateRequest,
        agent: &AgentDef,
        mut workdir: DirSpec,
        mut directories: Vec<DirSpec>,
        network_mode: NetworkMode,
        ports: Vec<PortMap>,
        plan: credentials::CredentialPlan,
        build_paths: &SandboxPaths,
        final_paths: &SandboxPaths,
        guard: &mut DirGuard,
    ) -> Result<()> {
        // Step 4: workspace materialization and baselines.
        workspace::prepare_dir(&mut workdir, build_paths, &self.cancel).await?;
        for dir in directories.iter_mut() {
            workspace::prepare_dir(dir, build_paths, &self.cancel).await?;
        }

        // Step 5: seeds into the sandbox, API keys into the staging dir.
        std::fs::create_dir_all(build_paths.agent_state_dir())
            .map_err(|e| Error::io("create agent-state dir", e))?;
        std::fs::create_dir_all(build_paths.home_seed_dir())
            .map_err(|e| Error::io("create home-seed dir", e))?;
        credentials::write_seeds(&plan, build_paths)?;
        let mut staged = credentials::stage_secrets(&plan)?;

        // Step 6: launcher config, prompt, and instance-config files.
        let mut network_allow = agent.network_allow.clone();
        for host in &req.network_allow {
            if !network_allow.contains(host) {
                network_allow.push(host.clone());
            }
        }
        let launch = launcher::compose(
            agent,
            req.model.as_deref(),
            req.prompt.as_deref(),
            &workdir.mount_path,
            self.config.tmux_conf,
            Some(launcher::host_identity()),
            self.config.debug,
            if network_mode == NetworkMode::Isolated {
                network_allow.clone()
            } else {
                Vec::new()
            },
        );
        launch.config.save(&build_paths.config_file())?;

        let paste_prompt = launch.paste_prompt;
        if let Some(prompt) = &req.prompt {
            atomic_write(&build_paths.prompt_file(), prompt.as_bytes())
                .map_err(|e| Error::io("write prompt.txt", e))?;
        }
        self.write_instance_files(build_paths)?;

        // Step 7: move into place; from here the guard owns the final dir.
        std::fs::rename(build_paths.dir(), final_paths.dir())
            .map_err(|e| Error::io("activate sandbox dir", e))?;
        guard.retarget(final_paths.dir().to_path_buf());

        let meta = Meta {
            name: req.name.clone(),
            created_at: Utc::now(),
            yoloai_version: env!("CARGO_PKG_VERSION").to_string(),
            agent: agent.name.clone(),
            model: req.model.clone(),
            backend: self.driver.name().to_string(),
            image_ref: self.image_ref(),
            profile: Some(self.profile.clone()),
            workdir,
            directories,
            network_mode,
            network_allow,
            ports,
            resources: crate::sandbox::types::Resources {
                cpus: self.config.cpus,
                memory: self.config.memory.clone(),
            },
            has_prompt: req.prompt.is_some(),
        };

        // Step 8: instance creation (and start unless deferred).
        let instance = self.instance_config(&meta, final_paths, staged.as_ref(), paste_prompt);
        self.driver.create(&instance, &self.cancel).await?;
        if !req.no_start {
            self.driver.start(&instance.name, &self.cancel).await?;
            self.verify_liveness(&instance.name).await?;
            // Step 9 happens when `staged` drops: the staged credential
            // files are gone the moment this invocation ends.
        } else if let Some(staged) = staged.as_mut() {
            // Deferred start still needs the staged files on disk.
            staged.persist();
        }

        // Step 10: durable metadata, atomically.
        meta.save(&final_paths.meta_file())?;
        Ok(())
    }

    /// Copy the profile's (user-editable) entrypoint and tmux config next to
    /// the sandbox, and create an empty session log.
    fn write_instance_files(&self, paths: &SandboxPaths) -> Result<()> {
        let profile_dir = self.profile_dir();
        resources::seed_profile(&profile_dir)?;
        for (name, dst) in [
            ("entrypoint.sh", paths.entrypoint_file()),
            ("tmux.conf", paths.tmux_conf_file()),
            ("vm-setup.sh", paths.setup_script()),
        ] {
            std::fs::copy(profile_dir.join(name), &dst)
                .map_err(|e| Error::io("copy instance file", e))?;
        }
        std::fs::write(paths.log_file(), b"").map_err(|e| Error::io("create log.txt", e))?;
        Ok(())
    }

    /// Compose the backend instance config from durable state.
    fn instance_config(
        &self,
        meta: &Meta,
        paths: &SandboxPaths,
        staged: Option<&StagedSecrets>,
        mount_prompt: bool,
    ) -> InstanceConfig {
        let mut mounts = Vec::new();
        for dir in meta.all_dirs() {
            let mount = match dir.mode {
                DirMode::Ro => Mount::ro(&dir.host_path, &dir.mount_path),
                DirMode::Rw => Mount::rw(&dir.host_path, &dir.mount_path),
                DirMode::Copy => {
                    Mount::rw(workspace::work_copy_path(paths, dir), &dir.mount_path)
                }
            };
            mounts.push(mount);
        }

        let guest = Path::new(GUEST_DIR);
        mounts.push(Mount::ro(paths.config_file(), guest.join("config.json")));
        mounts.push(Mount::ro(
            paths.entrypoint_file(),
            guest.join("entrypoint.sh"),
        ));
        mounts.push(Mount::ro(paths.tmux_conf_file(), guest.join("tmux.conf")));
        mounts.push(Mount::rw(paths.log_file(), guest.join("log.txt")));
        if mount_prompt && paths.prompt_file().exists() {
            mounts.push(Mount::ro(paths.prompt_file(), guest.join("prompt.txt")));
        }
        mounts.push(Mount::ro(paths.home_seed_dir(), guest.join("home-seed")));

        if let Some(agent) = find_agent(&meta.agent) {
            if let Some(state_dir) = &agent.state_dir {
                mounts.push(Mount::rw(
                    paths.agent_state_dir(),
                    Path::new(GUEST_HOME).join(state_dir),
                ));
            }
        }

        if let Some(staged) = staged {
            mounts.push(Mount::ro(&staged.dir, GUEST_SECRETS_DIR));
        }

        InstanceConfig {
            name: paths.instance(),
            image_ref: meta.image_ref.clone(),
            working_dir: meta.workdir.mount_path.clone(),
            mounts,
            ports: meta.ports.clone(),
            network_mode: meta.network_mode,
            network_allow: meta.network_allow.clone(),
            cap_add: if meta.network_mode == NetworkMode::Isolated {
                // The allowlist enforcer needs to program the firewall.
                vec!["NET_ADMIN".to_string()]
            } else {
                Vec::new()
            },
            use_init: true,
            resources: meta.resources.clone(),
        }
    }

    /// The instance may die at the entrypoint; catch that within ~1s and
    /// surface its exit code plus a pointer at the right log.
    async fn verify_liveness(&self, instance: &str) -> Result<()> {
        super::backends::with_cancel(&self.cancel, tokio::time::sleep(Duration::from_secs(1)))
            .await?;
        let inspect = self.driver.inspect(instance, &self.cancel).await?;
        if inspect.running {
            Ok(())
        } else {
            let exit = match inspect.exit_code {
                Some(code) => format!("with exit code {code}"),
                None => "with unknown exit code".to_string(),
            };
            Err(Error::driver(format!(
                "instance {instance} exited right after start {exit}; {}",
                self.driver.diagnostic_hint(instance)
            )))
        }
    }

    // ── Status ──────────────────────────────────────────────────────

    pub async fn status(&self, name: &str) -> Result<(Option<Meta>, Status)> {
        let paths = self.paths(name);
        if !paths.dir().exists() {
            return Err(Error::Usage(format!("no sandbox named '{name}'")));
        }
        let meta = match Meta::load(&paths.meta_file()) {
            Ok(meta) => meta,
            Err(_) => return Ok((None, Status::Broken)),
        };
        let status = self.derive_status(&paths).await?;
        Ok((Some(meta), status))
    }

    async fn derive_status(&self, paths: &SandboxPaths) -> Result<Status> {
        let instance = paths.instance();
        match self.driver.inspect(&instance, &self.cancel).await {
            Err(Error::NotFound(_)) => Ok(Status::Removed),
            Err(e) => Err(e),
            Ok(inspect) if !inspect.running => Ok(Status::Stopped),
            Ok(_) => {
                // Instance is up; the agent's pane decides the rest.
                let argv = vec![
                    "tmux".to_string(),
                    "display-message".to_string(),
                    "-p".to_string(),
                    "-t".to_string(),
                    "main".to_string(),
                    "#{pane_dead} #{pane_dead_status}".to_string(),
                ];
                match self.driver.exec(&instance, &argv, None, &self.cancel).await {
                    Ok(out) if out.success() => Ok(parse_pane_status(&out.stdout)),
                    _ => Ok(Status::Running),
                }
            }
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub async fn start(&self, name: &str) -> Result<Status> {
        let (meta, status) = self.status(name).await?;
        let paths = self.paths(name);
        let instance = paths.instance();
        match status {
            Status::Running => Ok(Status::Running),
            Status::Stopped => {
                self.driver.start(&instance, &self.cancel).await?;
                self.verify_liveness(&instance).await?;
                Ok(Status::Running)
            }
            Status::Removed => {
                let meta = meta.expect("status != broken implies meta");
                // Workspace, seeds, and baseline survive on disk; only the
                // backend object needs rebuilding (plus fresh key staging,
                // since the old temp files are long gone).
                let agent = find_agent(&meta.agent).ok_or_else(|| {
                    Error::Config(format!("meta references unknown agent '{}'", meta.agent))
                })?;
                let plan = credentials::collect(&agent, &self.env, self.keychain.as_ref())?;
                let staged = credentials::stage_secrets(&plan)?;
                let instance_config = self.instance_config(
                    &meta,
                    &paths,
                    staged.as_ref(),
                    meta.has_prompt,
                );
                self.driver.create(&instance_config, &self.cancel).await?;
                self.driver.start(&instance, &self.cancel).await?;
                self.verify_liveness(&instance).await?;
                drop(staged);
                Ok(Status::Running)
            }
            Status::Done | Status::Failed => {
                // Same instance, same tmux session: bring the pane back and
                // relaunch the agent command.
                let launcher: LauncherConfig =
                    serde_json::from_slice(&std::fs::read(paths.config_file()).map_err(
                        |e| Error::io("read config.json", e),
                    )?)
                    .map_err(|e| Error::Config(format!("parse config.json: {e}")))?;
                self.tmux(&instance, &["respawn-pane", "-k", "-t", "main"])
                    .await?;
                self.tmux(
                    &instance,
                    &["send-keys", "-t", "main", &launcher.agent_command, "Enter"],
                )
                .await?;
                Ok(Status::Running)
            }
            Status::Broken => Err(Error::Config(format!(
                "sandbox '{name}' is broken (unreadable meta); run `yoloai destroy {name}`"
            ))),
        }
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let paths = self.paths(name);
        if !paths.dir().exists() {
            return Err(Error::Usage(format!("no sandbox named '{name}'")));
        }
        match self.driver.stop(&paths.instance(), &self.cancel).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn restart(&self, name: &str) -> Result<Status> {
        self.stop(name).await?;
        self.start(name).await
    }

    pub async fn destroy(&self, name: &str, yes: bool) -> Result<()> {
        let paths = self.paths(name);
        if !paths.dir().exists() {
            return Err(Error::Usage(format!("no sandbox named '{name}'")));
        }

        if !yes {
            let needs_confirmation = match self.status(name).await {
                Ok((meta, status)) => {
                    let running = matches!(status, Status::Running);
                    let dirty = match &meta {
                        Some(meta) => self.any_copy_dirty(meta, &paths).await,
                        None => false,
                    };
                    running || dirty
                }
                Err(_) => false,
            };
            if needs_confirmation {
                let message =
                    format!("sandbox '{name}' is running or has unapplied changes; destroy?");
                if !self.confirm.confirm(&message) {
                    return Err(Error::Usage("aborted".into()));
                }
            }
        }

        // Best effort: collect errors, swallow not-found, always try every
        // step so a half-dead instance still gets cleaned up.
        let instance = paths.instance();
        let mut errors = Vec::new();
        if let Err(e) = self.driver.stop(&instance, &self.cancel).await {
            if !e.is_not_found() && !e.is_not_running() {
                errors.push(format!("stop: {e}"));
            }
        }
        if let Err(e) = self.driver.remove(&instance, &self.cancel).await {
            if !e.is_not_found() {
                errors.push(format!("remove: {e}"));
            }
        }
        if let Err(e) = std::fs::remove_dir_all(paths.dir()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                errors.push(format!("delete sandbox dir: {e}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "destroy '{name}' hit errors: {}",
                errors.join("; ")
            )))
        }
    }

    async fn any_copy_dirty(&self, meta: &Meta, paths: &SandboxPaths) -> bool {
        for dir in meta.all_dirs() {
            if dir.mode == DirMode::Copy {
                let work = workspace::work_copy_path(paths, dir);
                if workspace::has_changes(&work, &self.cancel).await {
                    return true;
                }
            }
        }
        false
    }

    // ── Diff / apply / reset ────────────────────────────────────────

    pub async fn diff(&self, name: &str, opts: &DiffOptions) -> Result<String> {
        let (meta, _status) = self.status(name).await?;
        let meta = meta.ok_or_else(|| broken(name))?;
        let paths = self.paths(name);
        let mut combined = String::new();
        for dir in meta.all_dirs() {
            if let Some(diff) =
                workspace::apply::diff_dir(dir, &paths, opts, &self.cancel).await?
            {
                combined.push_str(&diff);
            }
        }
        Ok(combined)
    }

    pub async fn apply(
        &self,
        name: &str,
        mode: &ApplyMode,
        scope: &[String],
        force: bool,
    ) -> Result<ApplyReport> {
        let (meta, status) = self.status(name).await?;
        let meta = meta.ok_or_else(|| broken(name))?;
        if status == Status::Running {
            tracing::warn!(
                sandbox = name,
                "agent is still running; applying a moving target"
            );
        }
        let paths = self.paths(name);
        workspace::apply::apply_dir(&meta.workdir, &paths, mode, scope, force, &self.cancel)
            .await
    }

    pub async fn reset(&self, name: &str, opts: &ResetOptions) -> Result<()> {
        let (meta, status) = self.status(name).await?;
        let mut meta = meta.ok_or_else(|| broken(name))?;
        let paths = self.paths(name);

        if opts.in_place {
            if status != Status::Running {
                return Err(Error::Usage(
                    "in-place reset needs a running agent; use a plain reset instead".into(),
                ));
            }
            if opts.clean {
                return Err(Error::Usage(
                    "cannot wipe agent state while the agent is running".into(),
                ));
            }
            for dir in meta.all_dirs_mut() {
                workspace::apply::resync_dir(dir, &paths, &self.cancel).await?;
            }
            meta.save(&paths.meta_file())?;

            let instance = paths.instance();
            let note = "[yoloai] the working directory was reset to match the host; \
                        re-read any files you had open";
            self.paste_text(&instance, note).await?;
            if opts.reprompt && meta.has_prompt {
                let prompt = std::fs::read_to_string(paths.prompt_file())
                    .map_err(|e| Error::io("read prompt.txt", e))?;
                self.paste_text(&instance, &prompt).await?;
            }
            return Ok(());
        }

        // Restart variant: stop, rebuild the work copies, optionally wipe
        // agent state, start again (the entrypoint re-delivers the prompt).
        self.stop(name).await?;
        for dir in meta.all_dirs_mut() {
            workspace::apply::recopy_dir(dir, &paths, &self.cancel).await?;
        }
        if opts.clean {
            let state = paths.agent_state_dir();
            if state.exists() {
                std::fs::remove_dir_all(&state).map_err(|e| Error::io("wipe agent state", e))?;
                std::fs::create_dir_all(&state)
                    .map_err(|e| Error::io("recreate agent state", e))?;
            }
        }
        if !opts.reprompt && meta.has_prompt {
            let _ = std::fs::remove_file(paths.prompt_file());
            meta.has_prompt = false;
        }
        meta.save(&paths.meta_file())?;
        self.start(name).await?;
        Ok(())
    }

    /// Paste text into the agent's tmux session and submit it.
    async fn paste_text(&self, instance: &str, text: &str) -> Result<()> {
        self.tmux(instance, &["set-buffer", text]).await?;
        self.tmux(instance, &["paste-buffer", "-t", "main"]).await?;
        super::backends::with_cancel(&self.cancel, tokio::time::sleep(Duration::from_millis(500)))
            .await?;
        self.tmux(instance, &["send-keys", "-t", "main", "Enter"])
            .await?;
        Ok(())
    }

    async fn tmux(&self, instance: &str, args: &[&str]) -> Result<()> {
        let mut argv = vec!["tmux".to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        let out = self.driver.exec(instance, &argv, None, &self.cancel).await?;
        if out.success() {
            Ok(())
        } else {
            Err(Error::driver(format!(
                "tmux {} exited with {}",
                args.first().copied().unwrap_or(""),
                out.exit_code
            )))
        }
    }

    // ── List / prune / misc ─────────────────────────────────────────

    pub async fn list(&self) -> Result<Vec<ListEntry>> {
        let sandboxes = crate::paths::sandboxes_dir(&self.root);
        let Ok(entries) = std::fs::read_dir(&sandboxes) else {
            return Ok(Vec::new());
        };
        let mut list = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            let paths = SandboxPaths::from_dir(entry.path());
            let disk_bytes = dir_size(paths.dir());
            match Meta::load(&paths.meta_file()) {
                Err(_) => list.push(ListEntry {
                    name: file_name,
                    status: Status::Broken,
                    agent: String::new(),
                    backend: String::new(),
                    created_at: None,
                    disk_bytes,
                    has_changes: false,
                }),
                Ok(meta) => {
                    let status = self.derive_status(&paths).await?;
                    let has_changes = self.any_copy_dirty(&meta, &paths).await;
                    list.push(ListEntry {
                        name: meta.name.clone(),
                        status,
                        agent: meta.agent.clone(),
                        backend: meta.backend.clone(),
                        created_at: Some(meta.created_at),
                        disk_bytes,
                        has_changes,
                    });
                }
            }
        }
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    pub async fn prune(&self, dry_run: bool, out: &mut Output) -> Result<Vec<String>> {
        let mut known = BTreeSet::new();
        let mut broken = Vec::new();
        for entry in self.list().await? {
            if entry.status == Status::Broken {
                broken.push(entry.name);
            } else {
                known.insert(crate::paths::instance_name(&entry.name));
            }
        }
        let known: Vec<String> = known.into_iter().collect();
        let orphans = self.driver.prune(&known, dry_run, out, &self.cancel).await?;

        if !dry_run {
            for dir in credentials::prune_stale_staging() {
                let _ = writeln!(out, "removed stale staging dir {}", dir.display());
            }
        }
        // Broken sandboxes may hold recoverable work; report, never delete.
        for name in &broken {
            let _ = writeln!(out, "broken sandbox kept: {name} (inspect or destroy by hand)");
        }
        Ok(orphans)
    }

    pub async fn exec(&self, name: &str, argv: &[String], interactive: bool) -> Result<i64> {
        let paths = self.paths(name);
        if !paths.dir().exists() {
            return Err(Error::Usage(format!("no sandbox named '{name}'")));
        }
        let instance = paths.instance();
        if interactive {
            let code = self
                .driver
                .interactive_exec(&instance, argv, Some("agent"), &self.cancel)
                .await?;
            Ok(code as i64)
        } else {
            let out = self
                .driver
                .exec(&instance, argv, Some("agent"), &self.cancel)
                .await?;
            print!("{}", out.stdout);
            Ok(out.exit_code)
        }
    }

    pub async fn attach(&self, name: &str) -> Result<i32> {
        let paths = self.paths(name);
        let instance = paths.instance();
        let argv = vec![
            "tmux".to_string(),
            "attach".to_string(),
            "-t".to_string(),
            "main".to_string(),
        ];
        self.driver
            .interactive_exec(&instance, &argv, Some("agent"), &self.cancel)
            .await
    }

    /// Add domains to the sandbox's network allowlist and persist them.
    ///
    /// The running container's filter is patched once the container driver
    /// grows its allowlist enforcer; until then this records intent.
    pub async fn network_allow(&self, name: &str, domains: &[String]) -> Result<()> {
        let (meta, _status) = self.status(name).await?;
        let mut meta = meta.ok_or_else(|| broken(name))?;
        let paths = self.paths(name);
        for domain in domains {
            if !meta.network_allow.contains(domain) {
                meta.network_allow.push(domain.clone());
            }
        }
        meta.save(&paths.meta_file())?;

        // Keep the in-instance view in sync as well.
        if let Ok(bytes) = std::fs::read(paths.config_file()) {
            if let Ok(mut launcher) = serde_json::from_slice::<LauncherConfig>(&bytes) {
                launcher.allowed_domains = meta.network_allow.clone();
                launcher.save(&paths.config_file())?;
            }
        }
        Ok(())
    }

    pub async fn build_image(&self, force: bool, out: &mut Output) -> Result<()> {
        let profile_dir = self.profile_dir();
        resources::seed_profile(&profile_dir)?;
        self.driver
            .ensure_image(&profile_dir, force, out, &self.cancel)
            .await
    }

    pub async fn close(&self) {
        self.driver.close().await;
    }
}

fn broken(name: &str) -> Error {
    Error::Config(format!(
        "sandbox '{name}' is broken (unreadable meta); run `yoloai destroy {name}`"
    ))
}

/// `1 <code>` means the pane died with that exit status; `0 ...` means the
/// agent is still attached to a live pane.
fn parse_pane_status(output: &str) -> Status {
    let mut parts = output.split_whitespace();
    match parts.next() {
        Some("1") => match parts.next().and_then(|c| c.parse::<i32>().ok()) {
            Some(0) => Status::Done,
            Some(_) => Status::Failed,
            None => Status::Done,
        },
        _ => Status::Running,
    }
}

/// Sandbox name shape: `^[A-Za-z0-9][A-Za-z0-9_.-]*$`, at most 56 chars.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 56
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::Usage(format!(
            "invalid sandbox name '{name}' (letters, digits, '_', '.', '-'; \
             must start alphanumeric; at most 56 chars)"
        )))
    }
}

/// Host directories must exist; resolved targets must be distinct,
/// non-nested, and nowhere dangerous (unless overridden).
fn validate_dirs(
    workdir: &mut DirSpec,
    directories: &mut [DirSpec],
    force_paths: bool,
) -> Result<()> {
    let mut targets: Vec<PathBuf> = Vec::new();
    let mut sources: Vec<PathBuf> = Vec::new();

    for dir in std::iter::once(&mut *workdir).chain(directories.iter_mut()) {
        let resolved = dir.host_path.canonicalize().map_err(|_| {
            Error::Usage(format!(
                "directory {} does not exist",
                dir.host_path.display()
            ))
        })?;
        if !resolved.is_dir() {
            return Err(Error::Usage(format!(
                "{} is not a directory",
                dir.host_path.display()
            )));
        }
        // Mount path follows the resolved host path unless explicitly set.
        if dir.mount_path == dir.host_path {
            dir.mount_path = resolved.clone();
        }
        dir.host_path = resolved.clone();

        if !force_paths {
            check_dangerous_target(&dir.mount_path)?;
        }
        targets.push(dir.mount_path.clone());
        sources.push(resolved);
    }

    for (i, a) in targets.iter().enumerate() {
        for b in targets.iter().skip(i + 1) {
            if a == b {
                return Err(Error::Usage(format!(
                    "mount targets collide: {} and {}",
                    a.display(),
                    b.display()
                )));
            }
        }
    }
    if !force_paths {
        for (i, a) in sources.iter().enumerate() {
            for (j, b) in sources.iter().enumerate() {
                if i != j && b.starts_with(a) {
                    return Err(Error::Usage(format!(
                        "directories overlap: {} contains {}",
                        a.display(),
                        b.display()
                    )));
                }
            }
        }
    }
    Ok(())
}

fn check_dangerous_target(target: &Path) -> Result<()> {
    let dangerous = target == Path::new("/")
        || Some(target.to_path_buf()) == dirs::home_dir()
        || matches!(
            target.to_string_lossy().as_ref(),
            "/usr" | "/etc" | "/bin" | "/sbin" | "/var" | "/lib" | "/opt" | "/System" | "/Library"
        );
    if dangerous {
        Err(Error::Usage(format!(
            "refusing dangerous mount target {} (override with --force-paths)",
            target.display()
        )))
    } else {
        Ok(())
    }
}

/// Removes the sandbox directory on failure; disarmed once create succeeds.
struct DirGuard {
    dir: Option<PathBuf>,
}

impl DirGuard {
    fn new(dir: PathBuf) -> Self {
        Self { dir: Some(dir) }
    }

    fn retarget(&mut self, dir: PathBuf) {
        self.dir = Some(dir);
    }

    fn disarm(&mut self) {
        self.dir = None;
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if let Some(dir) = &self.dir {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

use std::io::Write;
