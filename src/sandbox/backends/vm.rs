//! macOS VM driver (Apple Silicon).
//!
//! Shells out to a `tart`-style VM CLI. The base VM `yoloai-base` is cloned
//! per sandbox; `start` launches `run --no-graphics` as a detached process
//! group with a pid file, waits for the guest agent, then launches the
//! per-sandbox entrypoint through the VirtioFS shared directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{with_cancel, Driver, Output};
use crate::paths::{SandboxPaths, BASE_IMAGE, INSTANCE_PREFIX};
use crate::sandbox::error::{Error, Result};
use crate::sandbox::types::{ExecOutput, Inspect, InstanceConfig, NetworkMode, PortMap};
use crate::util::cmd::Cmd;
use crate::util::fs::atomic_write;

/// Upstream image the base VM is cloned from before provisioning.
const UPSTREAM_IMAGE: &str = "ghcr.io/cirruslabs/macos-sequoia-base:latest";

/// Where VirtioFS shared directories surface inside the guest.
const GUEST_SHARE_ROOT: &str = "/Volumes/My Shared Files";

/// Seconds to wait for the guest agent after `run`.
const BOOT_DEADLINE_SECS: u64 = 60;

/// Run-time arguments persisted at create so `start` can rebuild them.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VmRunSpec {
    shares: Vec<VmShare>,
    network_mode: NetworkMode,
    ports: Vec<PortMap>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VmShare {
    tag: String,
    source: PathBuf,
    /// Guest path the share is symlinked to before the agent starts.
    target: PathBuf,
    read_only: bool,
}

pub struct VmDriver {
    data_root: PathBuf,
    cli: String,
}

impl VmDriver {
    pub fn new(data_root: PathBuf, cli: String) -> Self {
        Self { data_root, cli }
    }

    fn paths_for(&self, instance: &str) -> Result<SandboxPaths> {
        let sandbox = instance
            .strip_prefix(&format!("{INSTANCE_PREFIX}-"))
            .ok_or_else(|| Error::driver(format!("unexpected instance name '{instance}'")))?;
        Ok(SandboxPaths::new(&self.data_root, sandbox))
    }

    fn cmd(&self, args: &[&str]) -> Cmd {
        Cmd::new(&self.cli).args(args.iter().copied())
    }

    async fn vm_state(&self, name: &str, cancel: &CancellationToken) -> Result<Option<String>> {
        let out = self
            .cmd(&["list", "--format", "json"])
            .checked("list VMs", cancel)
            .await?;
        Ok(find_vm_state(&out.stdout, name))
    }

    /// Probe the guest agent with a bounded per-attempt timeout.
    async fn guest_responds(&self, name: &str, cancel: &CancellationToken) -> bool {
        let cmd = self.cmd(&["exec", name, "true"]);
        let probe = cmd.output(cancel);
        matches!(
            tokio::time::timeout(Duration::from_secs(5), probe).await,
            Ok(Ok(out)) if out.success()
        )
    }

    async fn wait_for_boot(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(BOOT_DEADLINE_SECS);
        while tokio::time::Instant::now() < deadline {
            if self.guest_responds(name, cancel).await {
                return Ok(());
            }
            with_cancel(cancel, tokio::time::sleep(Duration::from_secs(1))).await?;
        }
        Err(Error::driver(format!(
            "VM {name} did not answer within {BOOT_DEADLINE_SECS}s"
        )))
    }

    fn read_pid(paths: &SandboxPaths) -> Option<i32> {
        std::fs::read_to_string(paths.pid_file())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn pid_alive(pid: i32) -> bool {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }
}

/// Parse `tart list --format json` output and return the VM's state.
fn find_vm_state(json: &str, name: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(json).ok()?;
    parsed.as_array()?.iter().find_map(|vm| {
        let vm_name = vm.get("Name").and_then(|v| v.as_str())?;
        if vm_name != name {
            return None;
        }
        vm.get("State")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    })
}

/// Share tags must be unique and filesystem-safe; index plus basename reads
/// well in `mount` output.
fn share_tag(index: usize, source: &Path) -> String {
    let base = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dir".to_string());
    let safe: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("d{index}-{safe}")
}

fn run_spec_for(config: &InstanceConfig, paths: &SandboxPaths) -> VmRunSpec {
    let mut shares = vec![VmShare {
        tag: "yoloai".to_string(),
        source: paths.dir().to_path_buf(),
        target: PathBuf::from(crate::paths::GUEST_DIR),
        read_only: false,
    }];
    for (i, mount) in config.mounts.iter().enumerate() {
        shares.push(VmShare {
            tag: share_tag(i, &mount.source),
            source: mount.source.clone(),
            target: mount.target.clone(),
            read_only: mount.read_only,
        });
    }
    VmRunSpec {
        shares,
        network_mode: config.network_mode,
        ports: config.ports.clone(),
    }
}

/// Arguments for `run --no-graphics`, including shared dirs and softnet
/// network policy.
fn run_args(name: &str, spec: &VmRunSpec) -> Vec<String> {
    let mut args = vec!["run".to_string(), name.to_string(), "--no-graphics".to_string()];
    for share in &spec.shares {
        let mut dir = format!("--dir={}:{}", share.tag, share.source.display());
        if share.read_only {
            dir.push_str(":ro");
        }
        args.push(dir);
    }
    match spec.network_mode {
        NetworkMode::Default => {}
        NetworkMode::None | NetworkMode::Isolated => {
            args.push("--net-softnet".to_string());
            args.push("--net-softnet-block=0.0.0.0/0".to_string());
            args.push("--net-softnet-block=::/0".to_string());
        }
    }
    for port in &spec.ports {
        args.push(format!(
            "--net-softnet-expose={}:{}",
            port.host, port.instance
        ));
    }
    args
}

/// Shell script run inside the guest to wire shared dirs to their intended
/// paths and launch the entrypoint detached.
fn guest_setup_script(spec: &VmRunSpec) -> String {
    let mut script = String::from("set -e\n");
    for share in &spec.shares {
        let guest_src = format!("{GUEST_SHARE_ROOT}/{}", share.tag);
        let target = share.target.display();
        script.push_str(&format!(
            "sudo mkdir -p \"$(dirname '{target}')\" && sudo ln -sfn '{guest_src}' '{target}'\n"
        ));
    }
    script.push_str(&format!(
        "nohup bash {guest}/entrypoint.sh {guest} >/dev/null 2>&1 &\n",
        guest = crate::paths::GUEST_DIR
    ));
    script
}

#[async_trait]
impl Driver for VmDriver {
    fn name(&self) -> &'static str {
        "vm"
    }

    async fn create(&self, config: &InstanceConfig, cancel: &CancellationToken) -> Result<()> {
        self.remove(&config.name, cancel).await?;

        self.cmd(&["clone", &config.image_ref, &config.name])
            .checked("clone base VM", cancel)
            .await?;

        let mut set_args: Vec<String> = vec!["set".into(), config.name.clone()];
        if let Some(cpus) = config.resources.cpus {
            set_args.push(format!("--cpu={}", cpus.round() as u64));
        }
        if let Some(memory) = &config.resources.memory {
            set_args.push(format!("--memory={memory}"));
        }
        if set_args.len() > 2 {
            Cmd::new(&self.cli)
                .args(set_args)
                .checked("size VM", cancel)
                .await?;
        }

        let paths = self.paths_for(&config.name)?;
        let spec = run_spec_for(config, &paths);
        let json = serde_json::to_vec_pretty(&spec)
            .map_err(|e| Error::Other(format!("serialize VM run spec: {e}")))?;
        atomic_write(&paths.dir().join("vm-args.json"), &json)
            .map_err(|e| Error::io("write vm-args.json", e))?;

        tracing::info!(instance = %config.name, "VM cloned");
        Ok(())
    }

    async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        match self.vm_state(name, cancel).await? {
            None => return Err(Error::NotFound(name.to_string())),
            Some(state) if state == "running" => return Ok(()),
            Some(_) => {}
        }

        let paths = self.paths_for(name)?;
        let spec: VmRunSpec = std::fs::read(paths.dir().join("vm-args.json"))
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok())
            .ok_or_else(|| Error::driver(format!("missing vm-args.json for {name}")))?;

        let pid = Cmd::new(&self.cli)
            .args(run_args(name, &spec))
            .spawn_detached(&paths.vm_log())?;
        atomic_write(&paths.pid_file(), format!("{pid}\n").as_bytes())
            .map_err(|e| Error::io("write pid file", e))?;

        self.wait_for_boot(name, cancel).await?;

        // Wire up shared dirs and launch the entrypoint inside the guest.
        let script = guest_setup_script(&spec);
        self.cmd(&["exec", name, "bash", "-c", &script])
            .checked("launch in-VM setup", cancel)
            .await?;

        tracing::info!(instance = name, pid, "VM started");
        Ok(())
    }

    async fn stop(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        match self.vm_state(name, cancel).await? {
            None => return Ok(()),
            Some(state) if state == "running" => {
                let out = self
                    .cmd(&["stop", "--timeout", "10", name])
                    .output(cancel)
                    .await?;
                if !out.success() {
                    tracing::warn!(instance = name, "graceful VM stop failed: {}", out.stderr.trim());
                }
            }
            Some(_) => {}
        }

        // SIGTERM any stragglers in the run process group.
        let paths = self.paths_for(name)?;
        if let Some(pid) = Self::read_pid(&paths) {
            if Self::pid_alive(pid) {
                let _ = nix::sys::signal::killpg(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
            let _ = std::fs::remove_file(paths.pid_file());
        }
        Ok(())
    }

    async fn remove(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        if self.vm_state(name, cancel).await?.is_none() {
            return Ok(());
        }
        self.stop(name, cancel).await?;
        self.cmd(&["delete", name])
            .checked("delete VM", cancel)
            .await?;
        Ok(())
    }

    async fn inspect(&self, name: &str, cancel: &CancellationToken) -> Result<Inspect> {
        match self.vm_state(name, cancel).await? {
            None => Err(Error::NotFound(name.to_string())),
            Some(state) if state == "running" => Ok(Inspect::running()),
            // The CLI does not retain an exit status for stopped VMs.
            Some(_) => Ok(Inspect::stopped(None)),
        }
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        _user: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        match self.vm_state(name, cancel).await? {
            None => return Err(Error::NotFound(name.to_string())),
            Some(state) if state != "running" => {
                return Err(Error::NotRunning(name.to_string()))
            }
            Some(_) => {}
        }
        let out = Cmd::new(&self.cli)
            .args(["exec", name])
            .args(argv.iter().cloned())
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
        Cmd::new(&self.cli)
            .args(["exec", "-t", name])
            .args(argv.iter().cloned())
            .interactive(cancel)
            .await
    }

    async fn ensure_image(
        &self,
        profile_dir: &Path,
        force: bool,
        out: &mut Output,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let exists = self.vm_state(BASE_IMAGE, cancel).await?.is_some();
        if exists && !force {
            return Ok(());
        }
        if exists {
            let _ = writeln!(out, "removing stale base VM {BASE_IMAGE}");
            self.stop(BASE_IMAGE, cancel).await.ok();
            self.cmd(&["delete", BASE_IMAGE])
                .checked("delete base VM", cancel)
                .await?;
        }

        let _ = writeln!(out, "cloning {UPSTREAM_IMAGE} as {BASE_IMAGE}");
        self.cmd(&["clone", UPSTREAM_IMAGE, BASE_IMAGE])
            .checked("clone upstream image", cancel)
            .await?;

        let _ = writeln!(out, "provisioning {BASE_IMAGE} (first boot)");
        let share = format!("--dir=provision:{}", profile_dir.display());
        let pid = Cmd::new(&self.cli)
            .args(["run", BASE_IMAGE, "--no-graphics", &share])
            .spawn_detached(&std::env::temp_dir().join("yoloai-provision.log"))?;
        self.wait_for_boot(BASE_IMAGE, cancel).await?;

        let setup = format!("bash '{GUEST_SHARE_ROOT}/provision/vm-setup.sh'");
        self.cmd(&["exec", BASE_IMAGE, "bash", "-c", &setup])
            .checked("provision base VM", cancel)
            .await?;

        // The sentinel is the provisioning marker; verify before stopping.
        let check = self
            .cmd(&["exec", BASE_IMAGE, "test", "-f", ".yoloai-provisioned"])
            .output(cancel)
            .await?;
        if !check.success() {
            return Err(Error::driver("base VM provisioning left no sentinel"));
        }

        self.cmd(&["stop", BASE_IMAGE]).output(cancel).await.ok();
        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        let _ = writeln!(out, "base VM ready");
        Ok(())
    }

    async fn image_exists(&self, reference: &str, cancel: &CancellationToken) -> Result<bool> {
        Ok(self.vm_state(reference, cancel).await?.is_some())
    }

    async fn prune(
        &self,
        known: &[String],
        dry_run: bool,
        out: &mut Output,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let listed = self
            .cmd(&["list", "--format", "json"])
            .checked("list VMs", cancel)
            .await?;
        let parsed: serde_json::Value = serde_json::from_str(&listed.stdout)
            .map_err(|e| Error::driver(format!("parse VM list: {e}")))?;

        let mut orphans = Vec::new();
        for vm in parsed.as_array().into_iter().flatten() {
            let Some(name) = vm.get("Name").and_then(|v| v.as_str()) else {
                continue;
            };
            if !name.starts_with(&format!("{INSTANCE_PREFIX}-")) || name == BASE_IMAGE {
                continue;
            }
            if known.iter().any(|k| k == name) {
                continue;
            }
            if dry_run {
                let _ = writeln!(out, "would remove {name}");
            } else {
                let _ = writeln!(out, "removing {name}");
                self.remove(name, cancel).await?;
            }
            orphans.push(name.to_string());
        }
        Ok(orphans)
    }

    fn diagnostic_hint(&self, name: &str) -> String {
        match self.paths_for(name) {
            Ok(paths) => format!("see the VM log at {}", paths.vm_log().display()),
            Err(_) => format!("check `{} list` for {name}", self.cli),
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::types::{Mount, Protocol, Resources};

    fn spec() -> VmRunSpec {
        VmRunSpec {
            shares: vec![
                VmShare {
                    tag: "yoloai".into(),
                    source: PathBuf::from("/data/sandboxes/demo"),
                    target: PathBuf::from("/yoloai"),
                    read_only: false,
                },
                VmShare {
                    tag: "d0-p".into(),
                    source: PathBuf::from("/data/work/p"),
                    target: PathBuf::from("/h/p"),
                    read_only: false,
                },
            ],
            network_mode: NetworkMode::None,
            ports: vec![PortMap {
                host: 8080,
                instance: 80,
                protocol: Protocol::Tcp,
            }],
        }
    }

    #[test]
    fn run_args_carry_shares_and_softnet() {
        let args = run_args("yoloai-demo", &spec());
        assert_eq!(args[0], "run");
        assert!(args.contains(&"--no-graphics".to_string()));
        assert!(args.contains(&"--dir=yoloai:/data/sandboxes/demo".to_string()));
        assert!(args.contains(&"--net-softnet-block=0.0.0.0/0".to_string()));
        assert!(args.contains(&"--net-softnet-block=::/0".to_string()));
        assert!(args.contains(&"--net-softnet-expose=8080:80".to_string()));
    }

    #[test]
    fn default_network_has_no_softnet_flags() {
        let mut s = spec();
        s.network_mode = NetworkMode::Default;
        s.ports.clear();
        let args = run_args("yoloai-demo", &s);
        assert!(!args.iter().any(|a| a.contains("softnet")));
    }

    #[test]
    fn guest_script_links_shares_then_launches() {
        let script = guest_setup_script(&spec());
        assert!(script.contains("ln -sfn '/Volumes/My Shared Files/d0-p' '/h/p'"));
        assert!(script.contains("nohup bash /yoloai/entrypoint.sh /yoloai"));
    }

    #[test]
    fn tart_list_state_parsing() {
        let json = r#"[
            {"Name": "yoloai-demo", "State": "running", "Source": "local"},
            {"Name": "yoloai-base", "State": "stopped", "Source": "local"}
        ]"#;
        assert_eq!(find_vm_state(json, "yoloai-demo").as_deref(), Some("running"));
        assert_eq!(find_vm_state(json, "yoloai-base").as_deref(), Some("stopped"));
        assert_eq!(find_vm_state(json, "missing"), None);
        assert_eq!(find_vm_state("not json", "x"), None);
    }

    #[test]
    fn share_tags_are_safe_and_distinct() {
        let a = share_tag(0, Path::new("/home/user/my app"));
        let b = share_tag(1, Path::new("/home/user/my app"));
        assert_eq!(a, "d0-my-app");
        assert_ne!(a, b);
    }

    #[test]
    fn run_spec_includes_sandbox_share_first() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SandboxPaths::new(tmp.path(), "demo");
        let config = InstanceConfig {
            name: "yoloai-demo".into(),
            image_ref: BASE_IMAGE.into(),
            working_dir: PathBuf::from("/h/p"),
            mounts: vec![Mount::rw("/data/work/p", "/h/p")],
            ports: vec![],
            network_mode: NetworkMode::Default,
            network_allow: vec![],
            cap_add: vec![],
            use_init: false,
            resources: Resources::default(),
        };
        let spec = run_spec_for(&config, &paths);
        assert_eq!(spec.shares[0].tag, "yoloai");
        assert_eq!(spec.shares[0].source, paths.dir());
        assert_eq!(spec.shares[1].target, PathBuf::from("/h/p"));
    }
}
