use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::sandbox::error::{Error, Result};
use crate::util::fs::atomic_write;

pub const DOCKERFILE: &str = include_str!("assets/Dockerfile");
pub const ENTRYPOINT: &str = include_str!("assets/entrypoint.sh");
pub const TMUX_CONF: &str = include_str!("assets/tmux.conf");
pub const VM_SETUP: &str = include_str!("assets/vm-setup.sh");

/// Editable resources seeded into each profile directory.
pub fn embedded_resources() -> &'static [(&'static str, &'static str)] {
    &[
        ("Dockerfile", DOCKERFILE),
        ("entrypoint.sh", ENTRYPOINT),
        ("tmux.conf", TMUX_CONF),
        ("vm-setup.sh", VM_SETUP),
    ]
}

const MANIFEST_NAME: &str = ".checksums";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// What happened to one resource during seeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedAction {
    /// File was missing; written fresh.
    Written,
    /// File already matches the embedded content.
    Current,
    /// File matched its last-seeded checksum; upgraded to the new content.
    Upgraded,
    /// File was modified by the user; left alone, `<name>.new` written.
    KeptUserCopy,
}

fn load_manifest(dir: &Path) -> BTreeMap<String, String> {
    std::fs::read(dir.join(MANIFEST_NAME))
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

fn save_manifest(dir: &Path, manifest: &BTreeMap<String, String>) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| Error::Other(format!("serialize checksum manifest: {e}")))?;
    json.push(b'\n');
    atomic_write(&dir.join(MANIFEST_NAME), &json)
        .map_err(|e| Error::io("write checksum manifest", e))
}

/// Seed the embedded resources into `dir`, upgrading unmodified files and
/// preserving user edits. Runs on every boot; a no-op when everything is
/// current.
pub fn seed_profile(dir: &Path) -> Result<Vec<(String, SeedAction)>> {
    std::fs::create_dir_all(dir).map_err(|e| Error::io("create profile dir", e))?;
    let mut manifest = load_manifest(dir);
    let mut actions = Vec::new();

    for (name, content) in embedded_resources() {
        let path = dir.join(name);
        let embedded_sha = sha256_hex(content.as_bytes());

        let action = match std::fs::read(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                atomic_write(&path, content.as_bytes())
                    .map_err(|e| Error::io("seed resource", e))?;
                manifest.insert(name.to_string(), embedded_sha);
                SeedAction::Written
            }
            Err(e) => return Err(Error::io("read seeded resource", e)),
            Ok(on_disk) => {
                let disk_sha = sha256_hex(&on_disk);
                if disk_sha == embedded_sha {
                    manifest.insert(name.to_string(), embedded_sha);
                    SeedAction::Current
                } else if manifest.get(*name) == Some(&disk_sha) {
                    // Untouched since the last seed; safe to upgrade.
                    atomic_write(&path, content.as_bytes())
                        .map_err(|e| Error::io("upgrade resource", e))?;
                    manifest.insert(name.to_string(), embedded_sha);
                    SeedAction::Upgraded
                } else {
                    // User-modified (or pre-manifest). Leave it, offer the
                    // new content alongside for review.
                    let new_path = dir.join(format!("{name}.new"));
                    atomic_write(&new_path, content.as_bytes())
                        .map_err(|e| Error::io("write .new resource", e))?;
                    SeedAction::KeptUserCopy
                }
            }
        };
        actions.push((name.to_string(), action));
    }

    save_manifest(dir, &manifest)?;
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action_for<'a>(actions: &'a [(String, SeedAction)], name: &str) -> SeedAction {
        actions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| *a)
            .unwrap()
    }

    #[test]
    fn fresh_dir_writes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let actions = seed_profile(dir.path()).unwrap();
        for (name, action) in &actions {
            assert_eq!(*action, SeedAction::Written, "{name}");
            assert!(dir.path().join(name).is_file());
        }
        assert!(dir.path().join(MANIFEST_NAME).is_file());
    }

    #[test]
    fn second_seed_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        seed_profile(dir.path()).unwrap();
        let actions = seed_profile(dir.path()).unwrap();
        for (name, action) in &actions {
            assert_eq!(*action, SeedAction::Current, "{name}");
        }
    }

    #[test]
    fn user_modified_file_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        seed_profile(dir.path()).unwrap();

        let dockerfile = dir.path().join("Dockerfile");
        std::fs::write(&dockerfile, "FROM scratch\n").unwrap();

        let actions = seed_profile(dir.path()).unwrap();
        assert_eq!(action_for(&actions, "Dockerfile"), SeedAction::KeptUserCopy);
        assert_eq!(
            std::fs::read_to_string(&dockerfile).unwrap(),
            "FROM scratch\n"
        );
        assert!(dir.path().join("Dockerfile.new").is_file());
    }

    #[test]
    fn unrecorded_differing_file_is_treated_as_user_modified() {
        let dir = tempfile::tempdir().unwrap();
        // File exists before any manifest was written.
        std::fs::write(dir.path().join("tmux.conf"), "set -g mouse off\n").unwrap();

        let actions = seed_profile(dir.path()).unwrap();
        assert_eq!(action_for(&actions, "tmux.conf"), SeedAction::KeptUserCopy);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("tmux.conf")).unwrap(),
            "set -g mouse off\n"
        );
    }

    #[test]
    fn stale_unmodified_file_is_upgraded() {
        let dir = tempfile::tempdir().unwrap();
        // Simulate an old release: seeded content differs from the current
        // embed, and the manifest records exactly that old content.
        let old = "#!/bin/sh\necho old\n";
        std::fs::write(dir.path().join("entrypoint.sh"), old).unwrap();
        let mut manifest = BTreeMap::new();
        manifest.insert("entrypoint.sh".to_string(), sha256_hex(old.as_bytes()));
        save_manifest(dir.path(), &manifest).unwrap();

        let actions = seed_profile(dir.path()).unwrap();
        assert_eq!(action_for(&actions, "entrypoint.sh"), SeedAction::Upgraded);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("entrypoint.sh")).unwrap(),
            ENTRYPOINT
        );
    }
}
