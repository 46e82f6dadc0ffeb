use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use filetime::FileTime;

/// Write-to-temp + rename in the same directory. Survives a crash mid-write
/// with either the old content or the new, never a partial file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        uuid::Uuid::new_v4().simple()
    ));
    std::fs::write(&tmp, bytes)?;
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// chmod helper.
pub fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// Create a directory (and parents) with the given mode on the leaf.
pub fn create_dir_with_mode(path: &Path, mode: u32) -> io::Result<()> {
    std::fs::create_dir_all(path)?;
    set_mode(path, mode)
}

/// Write a secret-bearing file: parent assumed present, file mode 0600.
pub fn write_secret_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    std::fs::write(path, bytes)?;
    set_mode(path, 0o600)
}

/// Recursive copy preserving permissions, symlinks, and mtimes.
///
/// Symlinks are recreated as symlinks (not followed). Ownership is left to
/// the current user.
pub fn copy_dir_preserving(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    let src_meta = std::fs::metadata(src)?;
    std::fs::set_permissions(dst, src_meta.permissions())?;

    for entry in walkdir::WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| {
            io::Error::other(format!("walk {}: {e}", src.display()))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::other(e.to_string()))?;
        let target = dst.join(rel);
        let ftype = entry.file_type();

        if ftype.is_dir() {
            std::fs::create_dir_all(&target)?;
            let meta = entry.metadata().map_err(io::Error::other)?;
            std::fs::set_permissions(&target, meta.permissions())?;
        } else if ftype.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            let meta = entry.metadata().map_err(io::Error::other)?;
            filetime::set_file_mtime(&target, FileTime::from_last_modification_time(&meta))?;
        }
    }

    // Directory mtimes, deepest first so parent stamps survive child writes.
    let mut dirs: Vec<_> = walkdir::WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .collect();
    dirs.sort_by_key(|e| std::cmp::Reverse(e.depth()));
    for entry in dirs {
        let rel = entry.path().strip_prefix(src).unwrap_or(Path::new(""));
        if let Ok(meta) = entry.metadata() {
            let _ = filetime::set_file_mtime(
                dst.join(rel),
                FileTime::from_last_modification_time(&meta),
            );
        }
    }
    Ok(())
}

/// Total apparent size of a directory tree in bytes.
pub fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.size())
        .sum()
}

/// Render a byte count the way `ls -lh` would.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.json");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
    }

    #[test]
    fn copy_preserves_mode_and_symlink() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let dst_root = dst.path().join("out");

        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/script.sh"), "#!/bin/sh\n").unwrap();
        set_mode(&src.path().join("sub/script.sh"), 0o755).unwrap();
        std::os::unix::fs::symlink("sub/script.sh", src.path().join("link")).unwrap();

        copy_dir_preserving(src.path(), &dst_root).unwrap();

        let mode = std::fs::metadata(dst_root.join("sub/script.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);

        let link = std::fs::read_link(dst_root.join("link")).unwrap();
        assert_eq!(link, Path::new("sub/script.sh"));
    }

    #[test]
    fn copy_preserves_mtime() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let dst_root = dst.path().join("out");

        let file = src.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();
        filetime::set_file_mtime(&file, FileTime::from_unix_time(1_000_000_000, 0)).unwrap();

        copy_dir_preserving(src.path(), &dst_root).unwrap();

        let meta = std::fs::metadata(dst_root.join("a.txt")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1_000_000_000);
    }

    #[test]
    fn dir_size_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("b"), vec![0u8; 24]).unwrap();
        assert_eq!(dir_size(dir.path()), 124);
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KiB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MiB");
    }
}
