/// Errors crossing the sandbox and driver boundaries.
///
/// Sentinel kinds (`NotFound`, `NotRunning`) are preserved through wrapping so
/// callers can treat them as success at the idempotency points (stop/remove).
/// Everything else carries a short verb-phrase message.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Bad arguments or sandbox name shape. Exit code 2.
    #[error("{0}")]
    Usage(String),

    /// Malformed configuration or metadata. Exit code 3.
    #[error("{0}")]
    Config(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("instance not running: {0}")]
    NotRunning(String),

    /// No API key and no auth-hint variable for the selected agent.
    #[error("agent '{agent}' needs credentials: set {}", vars.join(" or "))]
    CredentialMissing { agent: String, vars: Vec<String> },

    /// Apply/diff conflicts that need user action to resolve.
    #[error("{0}")]
    Workspace(String),

    /// Daemon unreachable, subprocess failure, or other backend trouble.
    #[error("{message}")]
    Driver {
        message: String,
        stderr: Option<String>,
    },

    /// SIGINT or cancellation context fired. Exit code 130.
    #[error("interrupted")]
    Cancelled,

    /// Host-side filesystem or subprocess failures outside the driver.
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn driver(message: impl Into<String>) -> Self {
        Error::Driver {
            message: message.into(),
            stderr: None,
        }
    }

    pub fn driver_with_stderr(message: impl Into<String>, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        let excerpt = stderr.lines().rev().take(8).collect::<Vec<_>>();
        let excerpt = excerpt.into_iter().rev().collect::<Vec<_>>().join("\n");
        Error::Driver {
            message: message.into(),
            stderr: if excerpt.is_empty() {
                None
            } else {
                Some(excerpt)
            },
        }
    }

    /// Wrap a host-side io failure with the verb phrase of what was attempted.
    pub fn io(verb: &str, err: std::io::Error) -> Self {
        Error::Other(format!("{verb}: {err}"))
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => 2,
            Error::Config(_) => 3,
            Error::Cancelled => 130,
            _ => 1,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_not_running(&self) -> bool {
        matches!(self, Error::NotRunning(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_kind() {
        assert_eq!(Error::Usage("bad name".into()).exit_code(), 2);
        assert_eq!(Error::Config("bad yaml".into()).exit_code(), 3);
        assert_eq!(Error::Cancelled.exit_code(), 130);
        assert_eq!(Error::NotFound("yoloai-x".into()).exit_code(), 1);
        assert_eq!(Error::driver("daemon unreachable").exit_code(), 1);
    }

    #[test]
    fn not_found_displays_instance() {
        let err = Error::NotFound("yoloai-demo".into());
        assert_eq!(err.to_string(), "instance not found: yoloai-demo");
        assert!(err.is_not_found());
    }

    #[test]
    fn credential_missing_names_vars() {
        let err = Error::CredentialMissing {
            agent: "claude".into(),
            vars: vec!["ANTHROPIC_API_KEY".into()],
        };
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
        assert!(err.to_string().contains("claude"));
    }

    #[test]
    fn stderr_excerpt_keeps_last_lines() {
        let long: String = (0..20).map(|i| format!("line{i}\n")).collect();
        let err = Error::driver_with_stderr("start vm", long);
        match err {
            Error::Driver {
                stderr: Some(excerpt),
                ..
            } => {
                assert!(excerpt.contains("line19"));
                assert!(!excerpt.contains("line0\n"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
