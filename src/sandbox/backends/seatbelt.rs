//! macOS process-sandbox driver (`sandbox-exec` / seatbelt).
//!
//! No image, no VM: the "instance" is the entrypoint running under a
//! generated deny-default SBPL profile in its own process group. tmux runs
//! on a per-sandbox UNIX socket so host-side commands can target exactly
//! one instance without a shared server.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Driver, Output};
use crate::paths::{SandboxPaths, GUEST_SECRETS_DIR, INSTANCE_PREFIX};
use crate::sandbox::error::{Error, Result};
use crate::sandbox::types::{ExecOutput, Inspect, InstanceConfig, Mount, NetworkMode};
use crate::util::cmd::{which, Cmd};
use crate::util::fs::{atomic_write, create_dir_with_mode, write_secret_file};

/// Only trust the system copy; a PATH-injected sandbox-exec defeats the
/// whole point.
const SANDBOX_EXEC: &str = "/usr/bin/sandbox-exec";

/// Symlinks created for source != target mounts, recorded for cleanup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LinkManifest {
    links: Vec<PathBuf>,
}

pub struct SeatbeltDriver {
    data_root: PathBuf,
}

impl SeatbeltDriver {
    pub fn new(data_root: PathBuf) -> Self {
        Self { data_root }
    }

    fn paths_for(&self, instance: &str) -> Result<SandboxPaths> {
        let sandbox = instance
            .strip_prefix(&format!("{INSTANCE_PREFIX}-"))
            .ok_or_else(|| Error::driver(format!("unexpected instance name '{instance}'")))?;
        Ok(SandboxPaths::new(&self.data_root, sandbox))
    }

    fn read_pid(paths: &SandboxPaths) -> Option<i32> {
        std::fs::read_to_string(paths.seatbelt_pid_file())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn pid_alive(pid: i32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    async fn kill_tmux(&self, paths: &SandboxPaths, cancel: &CancellationToken) {
        let socket = paths.tmux_socket();
        if socket.exists() {
            let socket = socket.to_string_lossy().into_owned();
            let _ = Cmd::new("tmux")
                .args(["-S", &socket, "kill-server"])
                .output(cancel)
                .await;
        }
    }
}

/// Generate the deny-default SBPL profile plus the `-D` parameters that
/// substitute canonicalized paths into it.
fn generate_profile(
    mounts: &[Mount],
    network_mode: NetworkMode,
    sandbox_dir: &Path,
) -> (String, Vec<(String, PathBuf)>) {
    let mut params: Vec<(String, PathBuf)> = Vec::new();
    let mut push_param = |prefix: &str, index: usize, path: &Path| -> String {
        let name = format!("{prefix}_{index}");
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        params.push((name.clone(), canonical));
        name
    };

    let mut profile = String::from(
        "(version 1)\n\
         (deny default)\n\
         \n\
         ; process bookkeeping every toolchain needs\n\
         (allow process-exec*)\n\
         (allow process-fork)\n\
         (allow signal (target same-sandbox))\n\
         (allow sysctl-read)\n\
         (allow mach-lookup)\n\
         (allow ipc-posix*)\n\
         (allow system-socket)\n\
         \n\
         ; read-only system surface\n\
         (allow file-read-metadata)\n\
         (allow file-read*\n\
         \x20    (subpath \"/usr\")\n\
         \x20    (subpath \"/bin\")\n\
         \x20    (subpath \"/sbin\")\n\
         \x20    (subpath \"/System\")\n\
         \x20    (subpath \"/Library\")\n\
         \x20    (subpath \"/opt\")\n\
         \x20    (subpath \"/private/etc\")\n\
         \x20    (subpath \"/private/var/db\")\n\
         \x20    (subpath \"/dev\"))\n\
         (allow file-write-data (literal \"/dev/null\") (literal \"/dev/tty\"))\n\
         (allow file-write* (subpath \"/private/tmp\") (subpath \"/private/var/folders\"))\n\
         \n",
    );

    // Home is readable so toolchains find their dotfiles; writes stay
    // confined to the mounts below.
    if let Some(home) = dirs::home_dir() {
        let name = push_param("HOME_RO", 0, &home);
        profile.push_str(&format!("(allow file-read* (subpath (param \"{name}\")))\n"));
    }

    // The sandbox dir itself (log, tmux socket, state) is fully writable.
    let name = push_param("SANDBOX", 0, sandbox_dir);
    profile.push_str(&format!(
        "(allow file-read* file-write* (subpath (param \"{name}\")))\n"
    ));

    for (i, mount) in mounts.iter().enumerate() {
        let name = push_param("MOUNT", i, &mount.source);
        if mount.read_only {
            profile.push_str(&format!(
                "(allow file-read* (subpath (param \"{name}\")))\n"
            ));
        } else {
            profile.push_str(&format!(
                "(allow file-read* file-write* (subpath (param \"{name}\")))\n"
            ));
        }
    }

    profile.push('\n');
    match network_mode {
        NetworkMode::Default => {
            profile.push_str("(allow network-outbound)\n(allow network-inbound)\n(allow network-bind)\n");
        }
        // Isolated degrades to no-network here; the allowlist needs a
        // packet-level enforcer this backend does not have.
        NetworkMode::None | NetworkMode::Isolated => {
            profile.push_str("(allow network-outbound (remote unix-socket))\n");
        }
    }

    (profile, params)
}

#[async_trait]
impl Driver for SeatbeltDriver {
    fn name(&self) -> &'static str {
        "seatbelt"
    }

    async fn create(&self, config: &InstanceConfig, cancel: &CancellationToken) -> Result<()> {
        self.remove(&config.name, cancel).await?;
        let paths = self.paths_for(&config.name)?;

        // Secrets staged in the transient host dir are copied into the
        // sandbox's own secrets dir: the staging dir is cleaned right after
        // start, but this instance reads them at every (re)start.
        let mut mounts: Vec<Mount> = Vec::new();
        for mount in &config.mounts {
            if mount.target == Path::new(GUEST_SECRETS_DIR) {
                let dst = paths.secrets_dir();
                create_dir_with_mode(&dst, 0o700)
                    .map_err(|e| Error::io("create secrets dir", e))?;
                for entry in std::fs::read_dir(&mount.source)
                    .map_err(|e| Error::io("read staged secrets", e))?
                    .flatten()
                {
                    let bytes = std::fs::read(entry.path())
                        .map_err(|e| Error::io("read staged secret", e))?;
                    write_secret_file(&dst.join(entry.file_name()), &bytes)
                        .map_err(|e| Error::io("copy secret", e))?;
                }
            } else {
                mounts.push(mount.clone());
            }
        }

        // Mounts whose target differs from the source get a symlink when the
        // target location is free; existing paths are left untouched.
        let mut manifest = LinkManifest::default();
        for mount in &mounts {
            if mount.source == mount.target || mount.target.exists() {
                continue;
            }
            if let Some(parent) = mount.target.parent() {
                if std::fs::create_dir_all(parent).is_err() {
                    tracing::warn!(target = %mount.target.display(), "cannot create link parent, skipping");
                    continue;
                }
            }
            match std::os::unix::fs::symlink(&mount.source, &mount.target) {
                Ok(()) => manifest.links.push(mount.target.clone()),
                Err(e) => {
                    tracing::warn!(target = %mount.target.display(), error = %e, "cannot link mount target");
                }
            }
        }
        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::Other(format!("serialize link manifest: {e}")))?;
        atomic_write(&paths.links_manifest(), &manifest_json)
            .map_err(|e| Error::io("write link manifest", e))?;

        let (profile, params) = generate_profile(&mounts, config.network_mode, paths.dir());
        atomic_write(&paths.seatbelt_profile(), profile.as_bytes())
            .map_err(|e| Error::io("write seatbelt profile", e))?;
        let params_json = serde_json::to_vec_pretty(
            &params
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string_lossy().into_owned()))
                .collect::<Vec<_>>(),
        )
        .map_err(|e| Error::Other(format!("serialize profile params: {e}")))?;
        atomic_write(&paths.dir().join("profile-params.json"), &params_json)
            .map_err(|e| Error::io("write profile params", e))?;

        tracing::info!(instance = %config.name, "seatbelt profile generated");
        Ok(())
    }

    async fn start(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
        let paths = self.paths_for(name)?;
        if !paths.seatbelt_profile().exists() {
            return Err(Error::NotFound(name.to_string()));
        }
        if let Some(pid) = Self::read_pid(&paths) {
            if Self::pid_alive(pid) {
                return Ok(());
            }
        }

        let params: Vec<(String, String)> =
            std::fs::read(paths.dir().join("profile-params.json"))
                .ok()
                .and_then(|b| serde_json::from_slice(&b).ok())
                .unwrap_or_default();

        let mut cmd = Cmd::new(SANDBOX_EXEC).args([
            "-f",
            &paths.seatbelt_profile().to_string_lossy().into_owned(),
        ]);
        for (key, value) in &params {
            cmd = cmd.args(["-D", &format!("{key}={value}")]);
        }
        cmd = cmd
            .args([
                "bash",
                &paths.entrypoint_file().to_string_lossy().into_owned(),
                &paths.dir().to_string_lossy().into_owned(),
            ])
            .env("YOLOAI_TMUX_SOCKET", paths.tmux_socket().to_string_lossy())
            .env("YOLOAI_SECRETS_DIR", paths.secrets_dir().to_string_lossy());

        let pid = cmd.spawn_detached(&paths.dir().join("sandbox.log"))?;
        atomic_write(&paths.seatbelt_pid_file(), format!("{pid}\n").as_bytes())
            .map_err(|e| Error::io("write pid file", e))?;

        tracing::info!(instance = name, pid, "seatbelt instance started");
        Ok(())
    }

    async fn stop(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let Ok(paths) = self.paths_for(name) else {
            return Ok(());
        };
        self.kill_tmux(&paths, cancel).await;
        if let Some(pid) = Self::read_pid(&paths) {
            if Self::pid_alive(pid) {
                let _ = nix::sys::signal::killpg(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
            let _ = std::fs::remove_file(paths.seatbelt_pid_file());
        }
        Ok(())
    }

    async fn remove(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let paths = self.paths_for(name)?;
        self.stop(name, cancel).await?;

        if let Ok(bytes) = std::fs::read(paths.links_manifest()) {
            if let Ok(manifest) = serde_json::from_slice::<LinkManifest>(&bytes) {
                for link in manifest.links {
                    if link.is_symlink() {
                        let _ = std::fs::remove_file(&link);
                    }
                }
            }
            let _ = std::fs::remove_file(paths.links_manifest());
        }
        for artifact in [
            paths.seatbelt_profile(),
            paths.seatbelt_pid_file(),
            paths.dir().join("profile-params.json"),
            paths.tmux_socket(),
        ] {
            let _ = std::fs::remove_file(artifact);
        }
        Ok(())
    }

    async fn inspect(&self, name: &str, _cancel: &CancellationToken) -> Result<Inspect> {
        let paths = self.paths_for(name)?;
        if !paths.seatbelt_profile().exists() {
            return Err(Error::NotFound(name.to_string()));
        }
        let running = Self::read_pid(&paths).map(Self::pid_alive).unwrap_or(false);
        if running {
            Ok(Inspect::running())
        } else {
            // A dead detached process group leaves no waitable status behind.
            Ok(Inspect::stopped(None))
        }
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        _user: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        let paths = self.paths_for(name)?;
        let inspect = self.inspect(name, cancel).await?;
        if !inspect.running {
            return Err(Error::NotRunning(name.to_string()));
        }

        // tmux invocations are rewritten onto this instance's socket; other
        // commands run in the sandbox dir. The seatbelt boundary applies to
        // the instance process tree, not to these host-side helpers.
        let rewritten = rewrite_tmux_argv(argv, &paths.tmux_socket());
        let (program, rest) = rewritten
            .split_first()
            .ok_or_else(|| Error::driver("empty exec argv"))?;
        let out = Cmd::new(program)
            .args(rest.iter().cloned())
            .cwd(paths.dir())
            .output(cancel)
            .await?;
        Ok(ExecOutput {
            stdout: out.stdout,
            exit_code: out.code as i64,
        })
    }

    async fn interactive_exec(
        &self,
        name: &str,
        argv: &[String],
        _user: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        let paths = self.paths_for(name)?;
        let rewritten = rewrite_tmux_argv(argv, &paths.tmux_socket());
        let (program, rest) = rewritten
            .split_first()
            .ok_or_else(|| Error::driver("empty exec argv"))?;
        Cmd::new(program)
            .args(rest.iter().cloned())
            .cwd(paths.dir())
            .interactive(cancel)
            .await
    }

    async fn ensure_image(
        &self,
        _profile_dir: &Path,
        _force: bool,
        _out: &mut Output,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        // Nothing to build; just verify the prerequisites exist.
        let missing: Vec<&str> = [("sandbox-exec"), ("tmux"), ("jq")]
            .into_iter()
            .filter(|bin| which(bin).is_none())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::driver(format!(
                "missing prerequisites on PATH: {}",
                missing.join(", ")
            )))
        }
    }

    async fn image_exists(&self, _reference: &str, _cancel: &CancellationToken) -> Result<bool> {
        Ok(which("sandbox-exec").is_some())
    }

    async fn prune(
        &self,
        known: &[String],
        dry_run: bool,
        out: &mut Output,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let sandboxes = crate::paths::sandboxes_dir(&self.data_root);
        let Ok(entries) = std::fs::read_dir(&sandboxes) else {
            return Ok(Vec::new());
        };
        let mut orphans = Vec::new();
        for entry in entries.flatten() {
            let sandbox = entry.file_name().to_string_lossy().into_owned();
            let instance = crate::paths::instance_name(&sandbox);
            let paths = SandboxPaths::new(&self.data_root, &sandbox);
            if !paths.seatbelt_profile().exists() || known.contains(&instance) {
                continue;
            }
            if dry_run {
                let _ = writeln!(out, "would remove {instance}");
            } else {
                let _ = writeln!(out, "removing {instance}");
                self.remove(&instance, cancel).await?;
            }
            orphans.push(instance);
        }
        Ok(orphans)
    }

    fn diagnostic_hint(&self, name: &str) -> String {
        match self.paths_for(name) {
            Ok(paths) => format!("see the session log at {}", paths.log_file().display()),
            Err(_) => format!("no sandbox directory for {name}"),
        }
    }

    async fn close(&self) {}
}

/// Insert `-S <socket>` after `tmux` so commands target this instance's
/// private server.
fn rewrite_tmux_argv(argv: &[String], socket: &Path) -> Vec<String> {
    match argv.first().map(String::as_str) {
        Some("tmux") => {
            let mut out = vec![
                "tmux".to_string(),
                "-S".to_string(),
                socket.to_string_lossy().into_owned(),
            ];
            out.extend(argv[1..].iter().cloned());
            out
        }
        _ => argv.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_denies_by_default_and_allows_mounts() {
        let mounts = vec![
            Mount::rw("/data/work/p", "/data/work/p"),
            Mount::ro("/src/lib", "/src/lib"),
        ];
        let (profile, params) =
            generate_profile(&mounts, NetworkMode::Default, Path::new("/data/sb/demo"));

        assert!(profile.starts_with("(version 1)\n(deny default)"));
        assert!(profile.contains("(allow file-read* file-write* (subpath (param \"MOUNT_0\")))"));
        assert!(profile.contains("(allow file-read* (subpath (param \"MOUNT_1\")))"));
        assert!(profile.contains("(allow network-outbound)"));

        let names: Vec<&str> = params.iter().map(|(k, _)| k.as_str()).collect();
        assert!(names.contains(&"SANDBOX_0"));
        assert!(names.contains(&"MOUNT_0"));
        assert!(names.contains(&"MOUNT_1"));
    }

    #[test]
    fn no_network_profile_omits_outbound() {
        let (profile, _) =
            generate_profile(&[], NetworkMode::None, Path::new("/data/sb/demo"));
        assert!(!profile.contains("(allow network-outbound)\n(allow network-inbound)"));
        assert!(profile.contains("unix-socket"));
    }

    #[test]
    fn isolated_degrades_to_no_network() {
        let (isolated, _) =
            generate_profile(&[], NetworkMode::Isolated, Path::new("/d"));
        let (none, _) = generate_profile(&[], NetworkMode::None, Path::new("/d"));
        assert_eq!(isolated, none);
    }

    #[test]
    fn tmux_argv_gets_socket() {
        let argv = vec!["tmux".to_string(), "kill-server".to_string()];
        let out = rewrite_tmux_argv(&argv, Path::new("/sb/tmux.sock"));
        assert_eq!(out, vec!["tmux", "-S", "/sb/tmux.sock", "kill-server"]);

        let other = vec!["ls".to_string()];
        assert_eq!(rewrite_tmux_argv(&other, Path::new("/s")), other);
    }

    #[tokio::test]
    async fn inspect_without_profile_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let driver = SeatbeltDriver::new(tmp.path().to_path_buf());
        let cancel = CancellationToken::new();
        let err = driver.inspect("yoloai-ghost", &cancel).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn create_copies_staged_secrets_into_sandbox() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        std::fs::write(staging.path().join("MY_KEY"), "sk-1").unwrap();

        let driver = SeatbeltDriver::new(tmp.path().to_path_buf());
        let paths = SandboxPaths::new(tmp.path(), "demo");
        std::fs::create_dir_all(paths.dir()).unwrap();

        let config = InstanceConfig {
            name: "yoloai-demo".into(),
            image_ref: String::new(),
            working_dir: PathBuf::from("/w"),
            mounts: vec![Mount::ro(
                staging.path().to_path_buf(),
                PathBuf::from(GUEST_SECRETS_DIR),
            )],
            ports: vec![],
            network_mode: NetworkMode::Default,
            network_allow: vec![],
            cap_add: vec![],
            use_init: false,
            resources: Default::default(),
        };
        let cancel = CancellationToken::new();
        driver.create(&config, &cancel).await.unwrap();

        let copied = paths.secrets_dir().join("MY_KEY");
        assert_eq!(std::fs::read_to_string(&copied).unwrap(), "sk-1");
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&copied).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(paths.seatbelt_profile().exists());
    }

    #[tokio::test]
    async fn remove_cleans_recorded_links() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        let target = tmp.path().join("linked-target");

        let driver = SeatbeltDriver::new(tmp.path().to_path_buf());
        let paths = SandboxPaths::new(tmp.path(), "demo");
        std::fs::create_dir_all(paths.dir()).unwrap();

        let config = InstanceConfig {
            name: "yoloai-demo".into(),
            image_ref: String::new(),
            working_dir: PathBuf::from("/w"),
            mounts: vec![Mount::rw(source.path().to_path_buf(), target.clone())],
            ports: vec![],
            network_mode: NetworkMode::Default,
            network_allow: vec![],
            cap_add: vec![],
            use_init: false,
            resources: Default::default(),
        };
        let cancel = CancellationToken::new();
        driver.create(&config, &cancel).await.unwrap();
        assert!(target.is_symlink());

        driver.remove("yoloai-demo", &cancel).await.unwrap();
        assert!(!target.exists());
        assert!(!paths.seatbelt_profile().exists());
    }
}
