//! Container driver over the Docker daemon API.
//!
//! Lifecycle, inspection, and non-interactive exec go through the daemon
//! (`bollard`); interactive exec shells out to the `docker` CLI because an
//! attached PTY is required. The base image is built in-process from the
//! profile's Dockerfile with an in-memory tar context.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{with_cancel, Driver, Output};
use crate::paths::{BASE_IMAGE, INSTANCE_PREFIX};
use crate::sandbox::error::{Error, Result};
use crate::sandbox::types::{ExecOutput, Inspect, InstanceConfig, NetworkMode};
use crate::util::cmd::Cmd;

const MANAGED_LABEL: &str = "managed-by";
const MANAGED_VALUE: &str = "yoloai";

pub struct DockerDriver {
    docker: bollard::Docker,
}

impl DockerDriver {
    pub fn connect() -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            Error::driver(format!(
                "connect to Docker daemon: {e}. Is Docker running?"
            ))
        })?;
        Ok(Self { docker })
    }

    fn map_err(verb: &str, name: &str, e: bollard::errors::Error) -> Error {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => Error::NotFound(name.to_string()),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } if message.contains("not running") => Error::NotRunning(name.to_string()),
            other => Error::driver(format!("{verb} {name}: {other}")),
        }
    }
}

/// Translate mounts to Docker bind strings.
fn bind_strings(config: &InstanceConfig) -> Vec<String> {
    config
        .mounts
        .iter()
        .map(|m| {
            let mut bind = format!("{}:{}", m.source.display(), m.target.display());
            if m.read_only {
                bind.push_str(":ro");
            }
            bind
        })
        .collect()
}

/// Translate port mappings to the daemon's binding map plus exposed ports.
fn port_maps(
    config: &InstanceConfig,
) -> (
    HashMap<String, Option<Vec<PortBinding>>>,
    HashMap<String, HashMap<(), ()>>,
) {
    let mut bindings = HashMap::new();
    let mut exposed = HashMap::new();
    for port in &config.ports {
        let key = format!("{}/{}", port.instance, port.protocol);
        exposed.insert(key.clone(), HashMap::new());
        bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(port.host.to_string()),
            }]),
        );
    }
    (bindings, exposed)
}

/// Parse a memory hint like `512m` or `4g` into bytes.
fn parse_memory(hint: &str) -> Option<i64> {
    let hint = hint.trim().to_ascii_lowercase();
    let (digits, factor) = match hint.chars().last()? {
        'k' => (&hint[..hint.len() - 1], 1024i64),
        'm' => (&hint[..hint.len() - 1], 1024 * 1024),
        'g' => (&hint[..hint.len() - 1], 1024 * 1024 * 1024),
        _ => (hint.as_str(), 1),
    };
    digits.parse::<i64>().ok().map(|n| n * factor)
}

/// Tar the profile directory's regular files into an in-memory build
/// context. Dotfiles (the checksum manifest) are left out.
fn build_context(profile_dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in std::fs::read_dir(profile_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.file_type()?.is_file() {
            continue;
        }
        builder.append_path_with_name(entry.path(), &name)?;
    }
    builder.into_inner()
}

#[async_trait]
impl Driver for DockerDriver {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, config: &InstanceConfig, cancel: &CancellationToken) -> Result<()> {
        // Idempotent-with-replace: a pre-existing instance is removed first.
        self.remove(&config.name, cancel).await?;

        let (port_bindings, exposed_ports) = port_maps(config);
        let network_mode = match config.network_mode {
            // Allowlist enforcement is not wired up yet; the allowlist is
            // recorded in meta and config.json, and the instance gets the
            // blocked-by-default network until then.
            NetworkMode::None | NetworkMode::Isolated => Some("none".to_string()),
            NetworkMode::Default => None,
        };

        let host_config = HostConfig {
            binds: Some(bind_strings(config)),
            port_bindings: Some(port_bindings),
            network_mode,
            cap_add: if config.cap_add.is_empty() {
                None
            } else {
                Some(config.cap_add.clone())
            },
            init: Some(config.use_init),
            nano_cpus: config.resources.cpus.map(|c| (c * 1e9) as i64),
            memory: config.resources.memory.as_deref().and_then(parse_memory),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image_ref.clone()),
            working_dir: Some(config.working_dir.to_string_lossy().into_owned()),
            // Root with a placeholder uid; the entrypoint remaps to the host
            // identity and drops privileges.
            user: Some("root".to_string()),
            cmd: Some(vec![
                "bash".to_string(),
                "/yoloai/entrypoint.sh".to_string(),
            ]),
            exposed_ports: Some(exposed_ports),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                MANAGED_VALUE.to_string(),
            )])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.as_str(),
            platform: None,
        };
        with_cancel(
            cancel,
            self.docker
                .create_container(Some(options), container_config),
        )
        .await?
        .map_err(|e| Self::map_err("create container", &config.name, e))?;

        tracing::info!(instance = %config.name, image = %config.image_ref, "container created");
        Ok(())
    }

    async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        match with_cancel(cancel, self.docker.start_container::<String>(name, None)).await? {
            Ok(()) => Ok(()),
            // 304: already running.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(Self::map_err("start container", name, e)),
        }
    }

    async fn stop(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let options = Some(StopContainerOptions { t: 10 });
        match with_cancel(cancel, self.docker.stop_container(name, options)).await? {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(Self::map_err("stop container", name, e)),
        }
    }

    async fn remove(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        match with_cancel(cancel, self.docker.remove_container(name, options)).await? {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(Self::map_err("remove container", name, e)),
        }
    }

    async fn inspect(&self, name: &str, cancel: &CancellationToken) -> Result<Inspect> {
        let response = with_cancel(cancel, self.docker.inspect_container(name, None))
            .await?
            .map_err(|e| Self::map_err("inspect container", name, e))?;
        let state = response.state.unwrap_or_default();
        let running = state.running.unwrap_or(false);
        if running {
            Ok(Inspect::running())
        } else {
            Ok(Inspect::stopped(state.exit_code))
        }
    }

    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        user: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput> {
        let options = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            user: user.map(String::from),
            ..Default::default()
        };
        let exec = with_cancel(cancel, self.docker.create_exec(name, options))
            .await?
            .map_err(|e| Self::map_err("exec in container", name, e))?;

        let started = with_cancel(cancel, self.docker.start_exec(&exec.id, None))
            .await?
            .map_err(|e| Self::map_err("start exec", name, e))?;

        let mut stdout = String::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            loop {
                let item = with_cancel(cancel, output.next()).await?;
                match item {
                    Some(Ok(bollard::container::LogOutput::StdOut { message })) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Some(Ok(bollard::container::LogOutput::StdErr { message })) => {
                        tracing::debug!(instance = name, "exec stderr: {}", String::from_utf8_lossy(&message));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(Error::driver(format!("exec stream {name}: {e}")));
                    }
                    None => break,
                }
            }
        }

        let inspected = with_cancel(cancel, self.docker.inspect_exec(&exec.id))
            .await?
            .map_err(|e| Self::map_err("inspect exec", name, e))?;

        Ok(ExecOutput {
            stdout,
            exit_code: inspected.exit_code.unwrap_or(-1),
        })
    }

    async fn interactive_exec(
        &self,
        name: &str,
        argv: &[String],
        user: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        // The daemon API cannot allocate the caller's PTY; go through the CLI.
        let mut cmd = Cmd::new("docker").args(["exec", "-it"]);
        if let Some(user) = user {
            cmd = cmd.args(["-u", user]);
        }
        cmd = cmd.arg(name).args(argv.iter().cloned());
        cmd.interactive(cancel).await
    }

    async fn ensure_image(
        &self,
        profile_dir: &Path,
        force: bool,
        out: &mut Output,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !force && self.image_exists(BASE_IMAGE, cancel).await? {
            return Ok(());
        }

        let context =
            build_context(profile_dir).map_err(|e| Error::io("tar build context", e))?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: BASE_IMAGE.to_string(),
            rm: true,
            forcerm: true,
            nocache: force,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        loop {
            let item = with_cancel(cancel, stream.next()).await?;
            let Some(item) = item else { break };
            let info = item.map_err(|e| Error::driver(format!("build image: {e}")))?;
            if let Some(line) = info.stream {
                let _ = out.write_all(line.as_bytes());
            }
            if let Some(err) = info.error {
                return Err(Error::driver(format!("build image: {err}")));
            }
        }
        let _ = out.flush();
        Ok(())
    }

    async fn image_exists(&self, reference: &str, cancel: &CancellationToken) -> Result<bool> {
        match with_cancel(cancel, self.docker.inspect_image(reference)).await? {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(Error::driver(format!("inspect image {reference}: {e}"))),
        }
    }

    async fn prune(
        &self,
        known: &[String],
        dry_run: bool,
        out: &mut Output,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{MANAGED_LABEL}={MANAGED_VALUE}")],
            )]),
            ..Default::default()
        };
        let containers = with_cancel(cancel, self.docker.list_containers(Some(options)))
            .await?
            .map_err(|e| Error::driver(format!("list containers: {e}")))?;

        let mut orphans = Vec::new();
        for container in containers {
            let Some(name) = container
                .names
                .unwrap_or_default()
                .into_iter()
                .map(|n| n.trim_start_matches('/').to_string())
                .find(|n| n.starts_with(INSTANCE_PREFIX))
            else {
                continue;
            };
            if known.contains(&name) {
                continue;
            }
            if dry_run {
                let _ = writeln!(out, "would remove {name}");
            } else {
                let _ = writeln!(out, "removing {name}");
                self.stop(&name, cancel).await?;
                self.remove(&name, cancel).await?;
            }
            orphans.push(name);
        }
        Ok(orphans)
    }

    fn diagnostic_hint(&self, name: &str) -> String {
        format!("inspect the container log with `docker logs {name}`")
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::types::{Mount, PortMap, Protocol, Resources};
    use std::path::PathBuf;

    fn config() -> InstanceConfig {
        InstanceConfig {
            name: "yoloai-demo".into(),
            image_ref: BASE_IMAGE.into(),
            working_dir: PathBuf::from("/h/p"),
            mounts: vec![
                Mount::rw("/data/work", "/h/p"),
                Mount::ro("/data/secrets", "/run/secrets"),
            ],
            ports: vec![PortMap {
                host: 8080,
                instance: 80,
                protocol: Protocol::Tcp,
            }],
            network_mode: NetworkMode::Default,
            network_allow: vec![],
            cap_add: vec!["NET_ADMIN".into()],
            use_init: true,
            resources: Resources {
                cpus: Some(2.0),
                memory: Some("4g".into()),
            },
        }
    }

    #[test]
    fn binds_carry_ro_suffix() {
        let binds = bind_strings(&config());
        assert_eq!(binds[0], "/data/work:/h/p");
        assert_eq!(binds[1], "/data/secrets:/run/secrets:ro");
    }

    #[test]
    fn port_translation() {
        let (bindings, exposed) = port_maps(&config());
        assert!(exposed.contains_key("80/tcp"));
        let binding = bindings.get("80/tcp").unwrap().as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("8080"));
    }

    #[test]
    fn memory_hints() {
        assert_eq!(parse_memory("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory("4g"), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory("1024"), Some(1024));
        assert_eq!(parse_memory("lots"), None);
    }

    #[test]
    fn build_context_skips_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::write(dir.path().join(".checksums"), "{}\n").unwrap();

        let bytes = build_context(dir.path()).unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["Dockerfile"]);
    }
}
