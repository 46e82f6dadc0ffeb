use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::sandbox::error::{Error, Result};

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// A host subprocess with cooperative cancellation.
///
/// Every blocking wait selects against the invocation's cancellation token;
/// cancellation kills the child and surfaces `Error::Cancelled`.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Cmd {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    fn build(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run to completion, capturing stdout and stderr.
    pub async fn output(&self, cancel: &CancellationToken) -> Result<CmdOutput> {
        let mut cmd = self.build();
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::driver(format!("spawn {}: {e}", self.program)))?;

        if let Some(input) = &self.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(input).await;
                drop(stdin);
            }
        }

        let output = tokio::select! {
            out = child.wait_with_output() => {
                out.map_err(|e| Error::driver(format!("wait for {}: {e}", self.program)))?
            }
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled);
            }
        };

        Ok(CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        })
    }

    /// Like `output`, but a non-zero exit becomes a driver error carrying a
    /// stderr excerpt.
    pub async fn checked(&self, verb: &str, cancel: &CancellationToken) -> Result<CmdOutput> {
        let out = self.output(cancel).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(Error::driver_with_stderr(
                format!("{verb}: `{}` exited with {}", self.describe(), out.code),
                out.stderr,
            ))
        }
    }

    /// Run with the caller's stdio attached (PTY passthrough).
    pub async fn interactive(&self, cancel: &CancellationToken) -> Result<i32> {
        let mut cmd = self.build();
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::driver(format!("spawn {}: {e}", self.program)))?;

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| Error::driver(format!("wait for {}: {e}", self.program)))?
            }
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled);
            }
        };
        Ok(status.code().unwrap_or(-1))
    }

    /// Spawn detached in its own process group, stdout+stderr appended to
    /// `log`. Returns the child pid (also the process-group id).
    pub fn spawn_detached(&self, log: &Path) -> Result<u32> {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .map_err(|e| Error::io("open log file", e))?;
        let err_file = log_file
            .try_clone()
            .map_err(|e| Error::io("clone log handle", e))?;

        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log_file));
        cmd.stderr(Stdio::from(err_file));
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

        let child = cmd
            .spawn()
            .map_err(|e| Error::driver(format!("spawn {}: {e}", self.program)))?;
        Ok(child.id())
    }
}

/// Minimal PATH lookup for prerequisite checks.
pub fn which(bin: &str) -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let full = dir.join(bin);
            if full.is_file() { Some(full) } else { None }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn output_captures_stdout() {
        let cancel = CancellationToken::new();
        let out = Cmd::new("echo")
            .arg("hello")
            .output(&cancel)
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn checked_reports_nonzero() {
        let cancel = CancellationToken::new();
        let err = Cmd::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .checked("run probe", &cancel)
            .await
            .unwrap_err();
        match err {
            Error::Driver { message, stderr } => {
                assert!(message.contains("exited with 3"));
                assert_eq!(stderr.as_deref(), Some("oops"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stdin_is_delivered() {
        let cancel = CancellationToken::new();
        let out = Cmd::new("cat")
            .stdin_bytes(&b"piped"[..])
            .output(&cancel)
            .await
            .unwrap();
        assert_eq!(out.stdout, "piped");
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Cmd::new("sleep")
            .arg("30")
            .output(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn which_finds_sh() {
        assert!(which("sh").is_some());
        assert!(which("definitely-not-a-binary-xyz").is_none());
    }
}
