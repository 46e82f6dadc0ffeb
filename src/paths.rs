use std::path::{Path, PathBuf};

/// Prefix for every backend-managed instance and for the base image/VM.
pub const INSTANCE_PREFIX: &str = "yoloai";

/// Canonical base image / base VM name.
pub const BASE_IMAGE: &str = "yoloai-base";

/// In-instance directory where per-sandbox files are mounted.
pub const GUEST_DIR: &str = "/yoloai";

/// In-instance secrets directory read by the entrypoint.
pub const GUEST_SECRETS_DIR: &str = "/run/secrets";

/// Instance name is a pure function of the sandbox name.
pub fn instance_name(sandbox: &str) -> String {
    format!("{INSTANCE_PREFIX}-{sandbox}")
}

/// Root of all persistent state: `$YOLOAI_HOME`, or `~/.yoloai`.
pub fn data_root() -> PathBuf {
    if let Some(root) = std::env::var_os("YOLOAI_HOME") {
        return PathBuf::from(root);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".yoloai")
}

pub fn sandboxes_dir(root: &Path) -> PathBuf {
    root.join("sandboxes")
}

pub fn profiles_dir(root: &Path) -> PathBuf {
    root.join("profiles")
}

pub fn profile_dir(root: &Path, profile: &str) -> PathBuf {
    profiles_dir(root).join(profile)
}

/// All on-disk paths owned by one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    dir: PathBuf,
    name: String,
}

impl SandboxPaths {
    pub fn new(root: &Path, name: &str) -> Self {
        Self {
            dir: sandboxes_dir(root).join(name),
            name: name.to_string(),
        }
    }

    /// For a sandbox directory discovered by scanning `sandboxes/`.
    pub fn from_dir(dir: PathBuf) -> Self {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { dir, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn instance(&self) -> String {
        instance_name(&self.name)
    }

    pub fn meta_file(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    pub fn config_file(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.dir.join("work")
    }

    /// Work copy for one encoded host path.
    pub fn work_copy(&self, encoded: &str) -> PathBuf {
        self.work_dir().join(encoded)
    }

    pub fn agent_state_dir(&self) -> PathBuf {
        self.dir.join("agent-state")
    }

    pub fn home_seed_dir(&self) -> PathBuf {
        self.dir.join("home-seed")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.dir.join("secrets")
    }

    pub fn prompt_file(&self) -> PathBuf {
        self.dir.join("prompt.txt")
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join("log.txt")
    }

    // Backend-specific artifacts.

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("vm.pid")
    }

    pub fn vm_log(&self) -> PathBuf {
        self.dir.join("vm.log")
    }

    pub fn tmux_socket(&self) -> PathBuf {
        self.dir.join("tmux.sock")
    }

    pub fn seatbelt_profile(&self) -> PathBuf {
        self.dir.join("profile.sb")
    }

    pub fn seatbelt_pid_file(&self) -> PathBuf {
        self.dir.join("sandbox.pid")
    }

    pub fn links_manifest(&self) -> PathBuf {
        self.dir.join("links.json")
    }

    pub fn entrypoint_file(&self) -> PathBuf {
        self.dir.join("entrypoint.sh")
    }

    pub fn tmux_conf_file(&self) -> PathBuf {
        self.dir.join("tmux.conf")
    }

    pub fn setup_script(&self) -> PathBuf {
        self.dir.join("vm-setup.sh")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_is_prefixed() {
        assert_eq!(instance_name("demo"), "yoloai-demo");
    }

    #[test]
    fn sandbox_paths_layout() {
        let p = SandboxPaths::new(Path::new("/data"), "demo");
        assert_eq!(p.dir(), Path::new("/data/sandboxes/demo"));
        assert_eq!(p.meta_file(), Path::new("/data/sandboxes/demo/meta.json"));
        assert_eq!(p.work_copy("x"), Path::new("/data/sandboxes/demo/work/x"));
        assert_eq!(p.instance(), "yoloai-demo");
    }

    #[test]
    fn from_dir_recovers_name() {
        let p = SandboxPaths::from_dir(PathBuf::from("/data/sandboxes/foo"));
        assert_eq!(p.name(), "foo");
    }
}
