pub mod docker;
pub mod seatbelt;
pub mod vm;

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::{Error, Result};
use super::types::{ExecOutput, Inspect, InstanceConfig};
use crate::config::{BackendKind, UserConfig};

/// Sink for best-effort progress lines (image builds, prune reports).
/// Output goes to stderr and is never required for correctness.
pub type Output = dyn std::io::Write + Send;

/// Capability set over one isolation mechanism.
///
/// One concrete driver per backend; the three backends differ in process
/// model (daemon API vs CLI vs direct subprocess), error surface, and
/// liveness semantics, so they share no code beyond the small translation
/// helpers in `types`.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Instance exists afterwards but is not running. Idempotent: a
    /// pre-existing instance of the same name is removed first.
    async fn create(&self, config: &InstanceConfig, cancel: &CancellationToken) -> Result<()>;

    /// Instance is running afterwards. No-op when already running.
    async fn start(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    /// Instance is not running afterwards. No-op when not running or gone.
    async fn stop(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    /// Instance does not exist afterwards. No-op when not found.
    async fn remove(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    /// `Err(NotFound)` when the instance does not exist.
    async fn inspect(&self, name: &str, cancel: &CancellationToken) -> Result<Inspect>;

    /// Run a command to completion inside the instance.
    async fn exec(
        &self,
        name: &str,
        argv: &[String],
        user: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput>;

    /// Run with the caller's stdio attached. Returns the exit code.
    async fn interactive_exec(
        &self,
        name: &str,
        argv: &[String],
        user: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<i32>;

    /// The canonical base image / VM / prerequisite set exists and is
    /// current afterwards. A no-op that writes nothing when already current.
    async fn ensure_image(
        &self,
        profile_dir: &Path,
        force: bool,
        out: &mut Output,
        cancel: &CancellationToken,
    ) -> Result<()>;

    async fn image_exists(&self, reference: &str, cancel: &CancellationToken) -> Result<bool>;

    /// Remove (or report, when dry-run) instances not in `known`.
    /// Returns the orphan names.
    async fn prune(
        &self,
        known: &[String],
        dry_run: bool,
        out: &mut Output,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>>;

    /// One human sentence pointing at the right logs for a dead instance.
    fn diagnostic_hint(&self, name: &str) -> String;

    /// Release resources held by the driver.
    async fn close(&self);
}

/// Await a future, racing the invocation's cancellation token.
pub(crate) async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        result = fut => Ok(result),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// Build the driver for the configured backend.
pub fn driver_for(
    kind: BackendKind,
    data_root: &Path,
    config: &UserConfig,
) -> Result<Box<dyn Driver>> {
    match kind.resolve() {
        BackendKind::Docker => Ok(Box::new(docker::DockerDriver::connect()?)),
        BackendKind::Vm => Ok(Box::new(vm::VmDriver::new(
            data_root.to_path_buf(),
            config.vm_cli.clone().unwrap_or_else(|| "tart".to_string()),
        ))),
        BackendKind::Seatbelt => Ok(Box::new(seatbelt::SeatbeltDriver::new(
            data_root.to_path_buf(),
        ))),
        BackendKind::Auto => Err(Error::Config("backend 'auto' did not resolve".into())),
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory driver for exercising the manager without an engine.

    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MockState {
        Created,
        Running,
        Stopped,
    }

    /// Clones share state, so a test can keep a handle while the manager
    /// owns the boxed driver.
    #[derive(Default, Clone)]
    pub struct MockDriver {
        pub instances: Arc<Mutex<BTreeMap<String, MockState>>>,
        /// Scripted responses for `exec`, matched by the first argv word.
        pub exec_responses: Arc<Mutex<Vec<(String, ExecOutput)>>>,
        pub calls: Arc<Mutex<Vec<String>>>,
        /// When set, `start` leaves the instance dead with this exit code.
        pub start_dies_with: Arc<Mutex<Option<i64>>>,
    }

    impl MockDriver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_exec(&self, prefix: &str, stdout: &str, exit_code: i64) {
            self.exec_responses.lock().unwrap().push((
                prefix.to_string(),
                ExecOutput {
                    stdout: stdout.to_string(),
                    exit_code,
                },
            ));
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl Driver for MockDriver {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn create(&self, config: &InstanceConfig, _cancel: &CancellationToken) -> Result<()> {
            self.record(format!("create {}", config.name));
            self.instances
                .lock()
                .unwrap()
                .insert(config.name.clone(), MockState::Created);
            Ok(())
        }

        async fn start(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
            self.record(format!("start {name}"));
            let dies = *self.start_dies_with.lock().unwrap();
            let mut map = self.instances.lock().unwrap();
            match map.get_mut(name) {
                Some(state) => {
                    *state = if dies.is_some() {
                        MockState::Stopped
                    } else {
                        MockState::Running
                    };
                    Ok(())
                }
                None => Err(Error::NotFound(name.to_string())),
            }
        }

        async fn stop(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
            self.record(format!("stop {name}"));
            if let Some(state) = self.instances.lock().unwrap().get_mut(name) {
                *state = MockState::Stopped;
            }
            Ok(())
        }

        async fn remove(&self, name: &str, _cancel: &CancellationToken) -> Result<()> {
            self.record(format!("remove {name}"));
            self.instances.lock().unwrap().remove(name);
            Ok(())
        }

        async fn inspect(&self, name: &str, _cancel: &CancellationToken) -> Result<Inspect> {
            match self.instances.lock().unwrap().get(name) {
                Some(MockState::Running) => Ok(Inspect::running()),
                Some(_) => Ok(Inspect::stopped(*self.start_dies_with.lock().unwrap())),
                None => Err(Error::NotFound(name.to_string())),
            }
        }

        async fn exec(
            &self,
            name: &str,
            argv: &[String],
            _user: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<ExecOutput> {
            self.record(format!("exec {name} {}", argv.join(" ")));
            match self.instances.lock().unwrap().get(name) {
                Some(MockState::Running) => {}
                Some(_) => return Err(Error::NotRunning(name.to_string())),
                None => return Err(Error::NotFound(name.to_string())),
            }
            let mut responses = self.exec_responses.lock().unwrap();
            if let Some(pos) = responses
                .iter()
                .position(|(prefix, _)| argv.join(" ").starts_with(prefix.as_str()))
            {
                let (_, out) = responses.remove(pos);
                return Ok(out);
            }
            Ok(ExecOutput {
                stdout: String::new(),
                exit_code: 0,
            })
        }

        async fn interactive_exec(
            &self,
            name: &str,
            argv: &[String],
            _user: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<i32> {
            self.record(format!("interactive {name} {}", argv.join(" ")));
            Ok(0)
        }

        async fn ensure_image(
            &self,
            _profile_dir: &Path,
            _force: bool,
            _out: &mut Output,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.record("ensure_image");
            Ok(())
        }

        async fn image_exists(
            &self,
            _reference: &str,
            _cancel: &CancellationToken,
        ) -> Result<bool> {
            Ok(true)
        }

        async fn prune(
            &self,
            known: &[String],
            dry_run: bool,
            _out: &mut Output,
            _cancel: &CancellationToken,
        ) -> Result<Vec<String>> {
            let mut map = self.instances.lock().unwrap();
            let orphans: Vec<String> = map
                .keys()
                .filter(|name| !known.contains(*name))
                .cloned()
                .collect();
            if !dry_run {
                for name in &orphans {
                    map.remove(name);
                }
            }
            Ok(orphans)
        }

        fn diagnostic_hint(&self, name: &str) -> String {
            format!("mock instance {name}")
        }

        async fn close(&self) {}
    }
}
