pub mod apply;

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::paths::SandboxPaths;
use crate::sandbox::error::{Error, Result};
use crate::sandbox::types::{DirMode, DirSpec, Mount};
use crate::util::cmd::{Cmd, CmdOutput};
use crate::util::fs::copy_dir_preserving;

/// Encode a host path into a single filesystem-safe component.
///
/// Every byte outside `[A-Za-z0-9._-]` becomes `^XX` (uppercase hex), the
/// caret included, so distinct host paths never collide and the mapping
/// reverses exactly.
pub fn encode_path(path: &Path) -> String {
    let mut out = String::new();
    for byte in path.to_string_lossy().bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("^{other:02X}")),
        }
    }
    out
}

/// Reverse of `encode_path`. Rejects malformed escapes.
pub fn decode_path(encoded: &str) -> Result<PathBuf> {
    let bad = || Error::Other(format!("malformed encoded path '{encoded}'"));
    let mut bytes = Vec::new();
    let mut chars = encoded.bytes();
    while let Some(b) = chars.next() {
        if b == b'^' {
            let hi = chars.next().ok_or_else(bad)?;
            let lo = chars.next().ok_or_else(bad)?;
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex).map_err(|_| bad())?;
            bytes.push(u8::from_str_radix(hex, 16).map_err(|_| bad())?);
        } else {
            bytes.push(b);
        }
    }
    let s = String::from_utf8(bytes).map_err(|_| bad())?;
    Ok(PathBuf::from(s))
}

/// Run git in `dir`. Commit-creating invocations carry a fallback identity
/// so sandboxed work copies never depend on the user's git config.
pub async fn git(dir: &Path, args: &[&str], cancel: &CancellationToken) -> Result<CmdOutput> {
    Cmd::new("git")
        .args(["-c", "user.name=yoloai", "-c", "user.email=yoloai@localhost"])
        .args(["-c", "commit.gpgsign=false"])
        .args(args.iter().copied())
        .cwd(dir)
        .output(cancel)
        .await
}

pub async fn git_checked(
    dir: &Path,
    args: &[&str],
    verb: &str,
    cancel: &CancellationToken,
) -> Result<CmdOutput> {
    let out = git(dir, args, cancel).await?;
    if out.success() {
        Ok(out)
    } else {
        Err(Error::driver_with_stderr(
            format!("{verb}: git {} exited with {}", args.join(" "), out.code),
            out.stderr,
        ))
    }
}

/// Ensure a git baseline commit exists in `work` and return its SHA.
///
/// A copied tree that already carries history keeps its HEAD; anything else
/// gets `git init` plus an initial commit of the whole tree.
pub async fn establish_baseline(work: &Path, cancel: &CancellationToken) -> Result<String> {
    if !work.join(".git").exists() {
        git_checked(work, &["init", "-q"], "init work copy", cancel).await?;
    }
    let head = git(work, &["rev-parse", "--verify", "HEAD"], cancel).await?;
    if head.success() {
        return Ok(head.stdout.trim().to_string());
    }
    // Fresh repo (or one with no commits yet): commit everything.
    git_checked(work, &["add", "-A"], "stage work copy", cancel).await?;
    git_checked(
        work,
        &["commit", "-q", "--allow-empty", "-m", "initial"],
        "commit baseline",
        cancel,
    )
    .await?;
    let head = git_checked(work, &["rev-parse", "HEAD"], "resolve baseline", cancel).await?;
    Ok(head.stdout.trim().to_string())
}

/// Location of the work copy for a copy-mode directory.
pub fn work_copy_path(paths: &SandboxPaths, spec: &DirSpec) -> PathBuf {
    paths.work_copy(&encode_path(&spec.host_path))
}

/// Materialize one attached directory, recording the baseline SHA for copy
/// mode, and return the mount the backend should perform.
pub async fn prepare_dir(
    spec: &mut DirSpec,
    paths: &SandboxPaths,
    cancel: &CancellationToken,
) -> Result<Mount> {
    match spec.mode {
        DirMode::Ro => Ok(Mount::ro(&spec.host_path, &spec.mount_path)),
        DirMode::Rw => Ok(Mount::rw(&spec.host_path, &spec.mount_path)),
        DirMode::Copy => {
            let copy = work_copy_path(paths, spec);
            copy_dir_preserving(&spec.host_path, &copy).map_err(|e| {
                Error::Other(format!(
                    "copy {} into work dir: {e}",
                    spec.host_path.display()
                ))
            })?;
            let sha = establish_baseline(&copy, cancel).await?;
            spec.baseline_sha = Some(sha);
            Ok(Mount::rw(copy, &spec.mount_path))
        }
    }
}

/// Whether the work copy (or live dir) has uncommitted changes.
pub async fn has_changes(dir: &Path, cancel: &CancellationToken) -> bool {
    match git(dir, &["status", "--porcelain"], cancel).await {
        Ok(out) if out.success() => !out.stdout.trim().is_empty(),
        _ => false,
    }
}
