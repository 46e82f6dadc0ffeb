use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};

/// How a host directory is materialized inside the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirMode {
    /// Read-only bind of the host directory.
    Ro,
    /// Live read-write bind. Diff is advisory only.
    Rw,
    /// Isolated writable copy with a git baseline.
    Copy,
}

impl std::str::FromStr for DirMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ro" => Ok(DirMode::Ro),
            "rw" => Ok(DirMode::Rw),
            "copy" => Ok(DirMode::Copy),
            other => Err(Error::Usage(format!(
                "invalid directory mode '{other}' (expected ro, rw, or copy)"
            ))),
        }
    }
}

impl std::fmt::Display for DirMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DirMode::Ro => "ro",
            DirMode::Rw => "rw",
            DirMode::Copy => "copy",
        })
    }
}

/// One directory attached to a sandbox, as persisted in meta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirSpec {
    pub host_path: PathBuf,
    pub mount_path: PathBuf,
    pub mode: DirMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_sha: Option<String>,
}

/// Parse a CLI directory argument: `PATH[:ro|rw|copy]`. Mount path defaults
/// to the host path so in-instance tooling sees familiar locations.
pub fn parse_dir_arg(arg: &str, default_mode: DirMode) -> Result<DirSpec> {
    let (path, mode) = match arg.rsplit_once(':') {
        Some((path, suffix)) if matches!(suffix, "ro" | "rw" | "copy") => {
            (path, suffix.parse::<DirMode>()?)
        }
        _ => (arg, default_mode),
    };
    if path.is_empty() {
        return Err(Error::Usage(format!("invalid directory argument '{arg}'")));
    }
    let host_path = expand_tilde(path);
    Ok(DirSpec {
        mount_path: host_path.clone(),
        host_path,
        mode,
        baseline_sha: None,
    })
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Network policy for the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkMode {
    /// Backend default networking.
    #[default]
    #[serde(rename = "")]
    Default,
    /// Full network isolation.
    #[serde(rename = "none")]
    None,
    /// Domain allowlist enforced by the backend.
    #[serde(rename = "isolated")]
    Isolated,
}

impl std::str::FromStr for NetworkMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "default" => Ok(NetworkMode::Default),
            "none" => Ok(NetworkMode::None),
            "isolated" => Ok(NetworkMode::Isolated),
            other => Err(Error::Usage(format!(
                "invalid network mode '{other}' (expected none or isolated)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// A host:instance port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    pub host: u16,
    pub instance: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl std::str::FromStr for PortMap {
    type Err = Error;

    /// `HOST:INSTANCE[/tcp|/udp]`, or a single port mapped to itself.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Usage(format!("invalid port mapping '{s}'"));
        let (ports, protocol) = match s.rsplit_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some(_) => return Err(bad()),
            None => (s, Protocol::Tcp),
        };
        let (host, instance) = match ports.split_once(':') {
            Some((h, i)) => (
                h.parse::<u16>().map_err(|_| bad())?,
                i.parse::<u16>().map_err(|_| bad())?,
            ),
            None => {
                let p = ports.parse::<u16>().map_err(|_| bad())?;
                (p, p)
            }
        };
        Ok(PortMap {
            host,
            instance,
            protocol,
        })
    }
}

/// Optional cpu/memory hints passed through to the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// A bind mount in the instance config fed to a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl Mount {
    pub fn rw(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Mount {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn ro(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Mount {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }
}

/// Everything a driver needs to create an instance.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub image_ref: String,
    pub working_dir: PathBuf,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortMap>,
    pub network_mode: NetworkMode,
    pub network_allow: Vec<String>,
    pub cap_add: Vec<String>,
    pub use_init: bool,
    pub resources: Resources,
}

/// Result of `Driver::inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inspect {
    pub running: bool,
    /// Exit code of a stopped instance, where the backend retains one.
    pub exit_code: Option<i64>,
}

impl Inspect {
    pub fn running() -> Self {
        Inspect {
            running: true,
            exit_code: None,
        }
    }

    pub fn stopped(exit_code: Option<i64>) -> Self {
        Inspect {
            running: false,
            exit_code,
        }
    }
}

/// Result of a non-interactive `Driver::exec`.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Derived sandbox status. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    Stopped,
    /// Agent exited cleanly; instance still up.
    Done,
    /// Agent exited non-zero; instance still up.
    Failed,
    /// Instance gone, sandbox dir intact.
    Removed,
    /// Sandbox dir cannot load meta.
    Broken,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Done => "done",
            Status::Failed => "failed",
            Status::Removed => "removed",
            Status::Broken => "broken",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_arg_with_mode() {
        let d = parse_dir_arg("/src/app:rw", DirMode::Copy).unwrap();
        assert_eq!(d.host_path, PathBuf::from("/src/app"));
        assert_eq!(d.mount_path, PathBuf::from("/src/app"));
        assert_eq!(d.mode, DirMode::Rw);
    }

    #[test]
    fn dir_arg_default_mode() {
        let d = parse_dir_arg("/src/app", DirMode::Copy).unwrap();
        assert_eq!(d.mode, DirMode::Copy);
    }

    #[test]
    fn dir_arg_colon_in_path_is_not_a_mode() {
        let d = parse_dir_arg("/src/a:b", DirMode::Copy).unwrap();
        assert_eq!(d.host_path, PathBuf::from("/src/a:b"));
    }

    #[test]
    fn port_forms() {
        let p: PortMap = "8080:80".parse().unwrap();
        assert_eq!((p.host, p.instance, p.protocol), (8080, 80, Protocol::Tcp));

        let p: PortMap = "53:53/udp".parse().unwrap();
        assert_eq!(p.protocol, Protocol::Udp);

        let p: PortMap = "3000".parse().unwrap();
        assert_eq!((p.host, p.instance), (3000, 3000));

        assert!("nope".parse::<PortMap>().is_err());
        assert!("1:2/icmp".parse::<PortMap>().is_err());
    }

    #[test]
    fn network_mode_serde_strings() {
        assert_eq!(serde_json::to_string(&NetworkMode::Default).unwrap(), "\"\"");
        assert_eq!(
            serde_json::to_string(&NetworkMode::Isolated).unwrap(),
            "\"isolated\""
        );
        let m: NetworkMode = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(m, NetworkMode::None);
    }

    #[test]
    fn status_display() {
        assert_eq!(Status::Running.to_string(), "running");
        assert_eq!(Status::Removed.to_string(), "removed");
    }

    #[test]
    fn inspect_constructors() {
        assert!(Inspect::running().running);
        assert_eq!(Inspect::running().exit_code, None);
        let dead = Inspect::stopped(Some(137));
        assert!(!dead.running);
        assert_eq!(dead.exit_code, Some(137));
    }
}
