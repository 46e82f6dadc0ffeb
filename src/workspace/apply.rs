use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use super::{establish_baseline, git, git_checked, work_copy_path};
use crate::paths::SandboxPaths;
use crate::sandbox::error::{Error, Result};
use crate::sandbox::types::{DirMode, DirSpec};
use crate::util::cmd::Cmd;
use crate::util::fs::copy_dir_preserving;

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    pub stat: bool,
    /// Optional path scoping, relative to the directory root.
    pub paths: Vec<String>,
}

/// Diff one attached directory against its baseline.
///
/// Copy mode stages untracked changes first so new files show up. Rw mode
/// diffs the live host directory against HEAD without touching the user's
/// index; the result is advisory since agent changes mix with pre-existing
/// ones. Ro mode has nothing to diff.
pub async fn diff_dir(
    spec: &DirSpec,
    paths: &SandboxPaths,
    opts: &DiffOptions,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    match spec.mode {
        DirMode::Ro => Ok(None),
        DirMode::Rw => {
            if !spec.host_path.join(".git").exists() {
                return Ok(None);
            }
            let mut args = vec!["diff", "HEAD"];
            if opts.stat {
                args.push("--stat");
            }
            add_path_scope(&mut args, &opts.paths);
            let out = git_checked(&spec.host_path, &args, "diff live directory", cancel).await?;
            Ok(Some(out.stdout))
        }
        DirMode::Copy => {
            let work = work_copy_path(paths, spec);
            let baseline = spec
                .baseline_sha
                .as_deref()
                .ok_or_else(|| Error::Other("copy directory has no baseline".into()))?;
            git_checked(&work, &["add", "-A"], "stage work copy", cancel).await?;
            let mut args = vec!["diff", baseline];
            if opts.stat {
                args.push("--stat");
            }
            add_path_scope(&mut args, &opts.paths);
            let out = git_checked(&work, &args, "diff work copy", cancel).await?;
            Ok(Some(out.stdout))
        }
    }
}

fn add_path_scope<'a>(args: &mut Vec<&'a str>, paths: &'a [String]) {
    if !paths.is_empty() {
        args.push("--");
        args.extend(paths.iter().map(String::as_str));
    }
}

#[derive(Debug, Clone)]
pub enum ApplyMode {
    /// Replay the agent's commits with `git am --3way`, then the WIP diff.
    CommitPreserving { keep_wip: bool },
    /// One unstaged diff from baseline to working tree.
    Squash,
    /// Write `.patch` files; the host repo is not touched.
    Export(PathBuf),
}

#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub commits_applied: usize,
    pub commits_total: usize,
    pub wip_applied: bool,
    pub exported: Vec<PathBuf>,
}

impl ApplyReport {
    pub fn nothing_to_apply(&self) -> bool {
        self.commits_total == 0 && !self.wip_applied && self.exported.is_empty()
    }
}

/// Land the changes of a copy-mode directory back into its host repo.
pub async fn apply_dir(
    spec: &DirSpec,
    paths: &SandboxPaths,
    mode: &ApplyMode,
    scope: &[String],
    force: bool,
    cancel: &CancellationToken,
) -> Result<ApplyReport> {
    if spec.mode != DirMode::Copy {
        return Err(Error::Usage(format!(
            "apply needs a copy-mode directory; {} is {}",
            spec.host_path.display(),
            spec.mode
        )));
    }
    let work = work_copy_path(paths, spec);
    let baseline = spec
        .baseline_sha
        .as_deref()
        .ok_or_else(|| Error::Other("copy directory has no baseline".into()))?;

    if !spec.host_path.join(".git").exists() {
        return Err(Error::Workspace(format!(
            "{} is not a git repository; use `diff` or export patches instead",
            spec.host_path.display()
        )));
    }

    // Pre-flight: the host repo must be clean so a conflicted apply never
    // mixes with unrelated edits.
    if !matches!(mode, ApplyMode::Export(_)) && !force {
        let status = git_checked(
            &spec.host_path,
            &["status", "--porcelain"],
            "check host repo",
            cancel,
        )
        .await?;
        if !status.stdout.trim().is_empty() {
            return Err(Error::Workspace(format!(
                "{} has uncommitted changes; commit or stash them first (or pass --force)",
                spec.host_path.display()
            )));
        }
    }

    match mode {
        ApplyMode::CommitPreserving { keep_wip } => {
            apply_commit_preserving(spec, &work, baseline, scope, *keep_wip, cancel).await
        }
        ApplyMode::Squash => apply_squash(spec, &work, baseline, scope, cancel).await,
        ApplyMode::Export(dir) => export_patches(&work, baseline, dir, cancel).await,
    }
}

async fn apply_commit_preserving(
    spec: &DirSpec,
    work: &Path,
    baseline: &str,
    scope: &[String],
    keep_wip: bool,
    cancel: &CancellationToken,
) -> Result<ApplyReport> {
    let mut report = ApplyReport::default();

    let patch_dir = std::env::temp_dir().join(format!(
        "yoloai-patches-{}",
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::create_dir_all(&patch_dir).map_err(|e| Error::io("create patch dir", e))?;
    let _cleanup = PatchDirGuard(&patch_dir);

    let range = format!("{baseline}..HEAD");
    let out = git_checked(
        work,
        &[
            "format-patch",
            "-q",
            &range,
            "-o",
            &patch_dir.to_string_lossy(),
        ],
        "format agent commits",
        cancel,
    )
    .await?;
    // -q still lists the files on stdout, one per line.
    let mut patches: Vec<PathBuf> = out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(PathBuf::from)
        .collect();
    if patches.is_empty() {
        // Some git versions print nothing with -q; fall back to a listing.
        patches = std::fs::read_dir(&patch_dir)
            .map_err(|e| Error::io("list patches", e))?
            .flatten()
            .map(|e| e.path())
            .collect();
        patches.sort();
    }
    report.commits_total = patches.len();

    // One `git am` per patch so commits already landed survive a later
    // conflict; the host repo is left in am-in-progress for the user.
    for patch in &patches {
        let out = git(
            &spec.host_path,
            &["am", "--3way", &patch.to_string_lossy()],
            cancel,
        )
        .await?;
        if !out.success() {
            return Err(Error::Workspace(format!(
                "applied {}/{} commits, then `git am` hit a conflict in {}; \
                 resolve it and run `git am --continue` (or `git am --abort`)",
                report.commits_applied,
                report.commits_total,
                spec.host_path.display()
            )));
        }
        report.commits_applied += 1;
    }

    if keep_wip {
        let wip = wip_diff(work, scope, cancel).await?;
        if !wip.trim().is_empty() {
            git_apply_stdin(&spec.host_path, wip.into_bytes(), cancel).await?;
            report.wip_applied = true;
        }
    }
    Ok(report)
}

struct PatchDirGuard<'a>(&'a Path);

impl Drop for PatchDirGuard<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(self.0);
    }
}

async fn apply_squash(
    spec: &DirSpec,
    work: &Path,
    baseline: &str,
    scope: &[String],
    cancel: &CancellationToken,
) -> Result<ApplyReport> {
    let mut report = ApplyReport::default();
    // Intent-to-add makes untracked files visible to diff without staging
    // their content.
    git_checked(work, &["add", "-A", "-N"], "mark untracked", cancel).await?;
    let mut args = vec!["diff", "--binary", baseline];
    add_path_scope(&mut args, scope);
    let out = git_checked(work, &args, "diff work copy", cancel).await?;
    if out.stdout.trim().is_empty() {
        return Ok(report);
    }
    git_apply_stdin(&spec.host_path, out.stdout.into_bytes(), cancel).await?;
    report.wip_applied = true;
    Ok(report)
}

async fn export_patches(
    work: &Path,
    baseline: &str,
    dir: &Path,
    cancel: &CancellationToken,
) -> Result<ApplyReport> {
    std::fs::create_dir_all(dir).map_err(|e| Error::io("create export dir", e))?;
    let mut report = ApplyReport::default();

    let range = format!("{baseline}..HEAD");
    let out = git_checked(
        work,
        &["format-patch", "-q", &range, "-o", &dir.to_string_lossy()],
        "export agent commits",
        cancel,
    )
    .await?;
    for line in out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        report.exported.push(PathBuf::from(line));
    }
    report.commits_total = report.exported.len();
    report.commits_applied = report.exported.len();

    let wip = wip_diff(work, &[], cancel).await?;
    if !wip.trim().is_empty() {
        let wip_path = dir.join("wip.patch");
        std::fs::write(&wip_path, wip).map_err(|e| Error::io("write wip patch", e))?;
        report.exported.push(wip_path);
    }
    Ok(report)
}

/// Uncommitted work in the copy, untracked files included.
async fn wip_diff(work: &Path, scope: &[String], cancel: &CancellationToken) -> Result<String> {
    git_checked(work, &["add", "-A", "-N"], "mark untracked", cancel).await?;
    let mut args = vec!["diff", "--binary", "HEAD"];
    add_path_scope(&mut args, scope);
    let out = git_checked(work, &args, "diff uncommitted work", cancel).await?;
    Ok(out.stdout)
}

async fn git_apply_stdin(
    host: &Path,
    patch: Vec<u8>,
    cancel: &CancellationToken,
) -> Result<()> {
    let out = Cmd::new("git")
        .args(["apply", "--whitespace=nowarn"])
        .cwd(host)
        .stdin_bytes(patch)
        .output(cancel)
        .await?;
    if out.success() {
        Ok(())
    } else {
        Err(Error::Workspace(format!(
            "`git apply` failed in {}: {}",
            host.display(),
            out.stderr.trim()
        )))
    }
}

/// Restart-reset: discard the work copy, recopy from the host, and record a
/// fresh baseline.
pub async fn recopy_dir(
    spec: &mut DirSpec,
    paths: &SandboxPaths,
    cancel: &CancellationToken,
) -> Result<()> {
    if spec.mode != DirMode::Copy {
        return Ok(());
    }
    let work = work_copy_path(paths, spec);
    if work.exists() {
        std::fs::remove_dir_all(&work).map_err(|e| Error::io("remove work copy", e))?;
    }
    copy_dir_preserving(&spec.host_path, &work)
        .map_err(|e| Error::Other(format!("recopy {}: {e}", spec.host_path.display())))?;
    spec.baseline_sha = Some(establish_baseline(&work, cancel).await?);
    Ok(())
}

/// In-place reset: rsync the host directory over the work copy while the
/// instance keeps running, then re-establish the baseline.
///
/// An agent writing concurrently races the rsync; the caller notifies the
/// agent afterwards.
pub async fn resync_dir(
    spec: &mut DirSpec,
    paths: &SandboxPaths,
    cancel: &CancellationToken,
) -> Result<()> {
    if spec.mode != DirMode::Copy {
        return Ok(());
    }
    let work = work_copy_path(paths, spec);
    let src = format!("{}/", spec.host_path.display());
    let dst = format!("{}/", work.display());
    Cmd::new("rsync")
        .args(["-a", "--delete", &src, &dst])
        .checked("resync work copy", cancel)
        .await?;
    spec.baseline_sha = Some(establish_baseline(&work, cancel).await?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{git, git_checked, prepare_dir};

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    /// Host repo with one committed file, plus sandbox paths.
    async fn fixture() -> (tempfile::TempDir, tempfile::TempDir, SandboxPaths, DirSpec) {
        let host = tempfile::tempdir().unwrap();
        std::fs::write(host.path().join("a.txt"), "hello\n").unwrap();
        git_checked(host.path(), &["init", "-q"], "init", &token())
            .await
            .unwrap();
        git_checked(host.path(), &["add", "-A"], "add", &token())
            .await
            .unwrap();
        git_checked(host.path(), &["commit", "-q", "-m", "H"], "commit", &token())
            .await
            .unwrap();

        let root = tempfile::tempdir().unwrap();
        let paths = SandboxPaths::new(root.path(), "demo");
        let mut spec = DirSpec {
            host_path: host.path().to_path_buf(),
            mount_path: host.path().to_path_buf(),
            mode: DirMode::Copy,
            baseline_sha: None,
        };
        prepare_dir(&mut spec, &paths, &token()).await.unwrap();
        (host, root, paths, spec)
    }

    #[tokio::test]
    async fn clean_copy_diffs_empty_and_apply_is_noop() {
        let (_host, _root, paths, spec) = fixture().await;

        let diff = diff_dir(&spec, &paths, &DiffOptions::default(), &token())
            .await
            .unwrap()
            .unwrap();
        assert!(diff.trim().is_empty());

        let report = apply_dir(
            &spec,
            &paths,
            &ApplyMode::CommitPreserving { keep_wip: true },
            &[],
            false,
            &token(),
        )
        .await
        .unwrap();
        assert!(report.nothing_to_apply());
    }

    #[tokio::test]
    async fn agent_change_round_trips_through_apply() {
        let (host, _root, paths, spec) = fixture().await;
        let work = work_copy_path(&paths, &spec);

        // Simulate the agent: append a line and leave it uncommitted.
        std::fs::write(work.join("a.txt"), "hello\nworld\n").unwrap();

        let diff = diff_dir(&spec, &paths, &DiffOptions::default(), &token())
            .await
            .unwrap()
            .unwrap();
        assert!(diff.contains("+world"));

        let report = apply_dir(
            &spec,
            &paths,
            &ApplyMode::CommitPreserving { keep_wip: true },
            &[],
            false,
            &token(),
        )
        .await
        .unwrap();
        assert!(report.wip_applied);
        assert_eq!(report.commits_total, 0);
        assert_eq!(
            std::fs::read_to_string(host.path().join("a.txt")).unwrap(),
            "hello\nworld\n"
        );
    }

    #[tokio::test]
    async fn committed_changes_land_as_commits() {
        let (host, _root, paths, spec) = fixture().await;
        let work = work_copy_path(&paths, &spec);

        std::fs::write(work.join("b.txt"), "new file\n").unwrap();
        git_checked(&work, &["add", "-A"], "add", &token()).await.unwrap();
        git_checked(&work, &["commit", "-q", "-m", "add b"], "commit", &token())
            .await
            .unwrap();

        let report = apply_dir(
            &spec,
            &paths,
            &ApplyMode::CommitPreserving { keep_wip: true },
            &[],
            false,
            &token(),
        )
        .await
        .unwrap();
        assert_eq!(report.commits_applied, 1);
        assert!(!report.wip_applied);

        let log = git(host.path(), &["log", "--oneline"], &token())
            .await
            .unwrap();
        assert!(log.stdout.contains("add b"));
        assert!(host.path().join("b.txt").is_file());
    }

    #[tokio::test]
    async fn dirty_host_blocks_apply_unless_forced() {
        let (host, _root, paths, spec) = fixture().await;
        let work = work_copy_path(&paths, &spec);
        std::fs::write(work.join("a.txt"), "hello\nagent\n").unwrap();
        std::fs::write(host.path().join("untracked.txt"), "dirt\n").unwrap();

        let err = apply_dir(
            &spec,
            &paths,
            &ApplyMode::Squash,
            &[],
            false,
            &token(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Workspace(_)));
        assert!(err.to_string().contains("uncommitted changes"));
    }

    #[tokio::test]
    async fn squash_applies_single_diff() {
        let (host, _root, paths, spec) = fixture().await;
        let work = work_copy_path(&paths, &spec);

        // One commit plus WIP; squash flattens both.
        std::fs::write(work.join("b.txt"), "committed\n").unwrap();
        git_checked(&work, &["add", "-A"], "add", &token()).await.unwrap();
        git_checked(&work, &["commit", "-q", "-m", "b"], "commit", &token())
            .await
            .unwrap();
        std::fs::write(work.join("c.txt"), "wip\n").unwrap();

        apply_dir(&spec, &paths, &ApplyMode::Squash, &[], false, &token())
            .await
            .unwrap();

        assert!(host.path().join("b.txt").is_file());
        assert!(host.path().join("c.txt").is_file());
        // Squash never creates commits on the host.
        let status = git(host.path(), &["status", "--porcelain"], &token())
            .await
            .unwrap();
        assert!(!status.stdout.trim().is_empty());
    }

    #[tokio::test]
    async fn export_writes_patches_without_touching_host() {
        let (host, _root, paths, spec) = fixture().await;
        let work = work_copy_path(&paths, &spec);

        std::fs::write(work.join("b.txt"), "committed\n").unwrap();
        git_checked(&work, &["add", "-A"], "add", &token()).await.unwrap();
        git_checked(&work, &["commit", "-q", "-m", "b"], "commit", &token())
            .await
            .unwrap();
        std::fs::write(work.join("c.txt"), "wip\n").unwrap();

        let export = tempfile::tempdir().unwrap();
        let report = apply_dir(
            &spec,
            &paths,
            &ApplyMode::Export(export.path().to_path_buf()),
            &[],
            false,
            &token(),
        )
        .await
        .unwrap();

        assert_eq!(report.commits_total, 1);
        assert!(report.exported.iter().any(|p| p.ends_with("wip.patch")));
        assert!(!host.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn recopy_resets_to_host_state_and_advances_baseline() {
        let (host, _root, paths, mut spec) = fixture().await;
        let work = work_copy_path(&paths, &spec);
        let old_baseline = spec.baseline_sha.clone().unwrap();

        std::fs::write(work.join("scratch.txt"), "agent junk\n").unwrap();
        // Host moves forward while the sandbox works.
        std::fs::write(host.path().join("a.txt"), "hello\nhost edit\n").unwrap();
        git_checked(host.path(), &["commit", "-aqm", "host edit"], "commit", &token())
            .await
            .unwrap();

        recopy_dir(&mut spec, &paths, &token()).await.unwrap();

        assert!(!work.join("scratch.txt").exists());
        assert_eq!(
            std::fs::read_to_string(work.join("a.txt")).unwrap(),
            "hello\nhost edit\n"
        );
        assert_ne!(spec.baseline_sha.as_deref().unwrap(), old_baseline);
    }

    #[tokio::test]
    async fn resync_matches_host_bytes() {
        if crate::util::cmd::which("rsync").is_none() {
            return;
        }
        let (host, _root, paths, mut spec) = fixture().await;
        let work = work_copy_path(&paths, &spec);

        std::fs::write(work.join("junk.txt"), "junk\n").unwrap();
        std::fs::write(host.path().join("fresh.txt"), "fresh\n").unwrap();

        resync_dir(&mut spec, &paths, &token()).await.unwrap();

        assert!(!work.join("junk.txt").exists());
        assert_eq!(
            std::fs::read_to_string(work.join("fresh.txt")).unwrap(),
            "fresh\n"
        );
        assert!(spec.baseline_sha.is_some());
    }
}
