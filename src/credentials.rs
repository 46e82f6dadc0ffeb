use std::path::PathBuf;

use crate::agents::AgentDef;
use crate::paths::SandboxPaths;
use crate::sandbox::error::{Error, Result};
use crate::sandbox::types::expand_tilde;
use crate::util::fs::{create_dir_with_mode, write_secret_file};

/// Source of secrets stored outside the filesystem.
pub trait Keychain: Send + Sync {
    fn lookup(&self, service: &str) -> Option<String>;
}

/// macOS Keychain via `security find-generic-password -s <service> -w`.
/// Returns nothing on other platforms or when the entry is absent.
pub struct SecurityCliKeychain;

impl Keychain for SecurityCliKeychain {
    fn lookup(&self, service: &str) -> Option<String> {
        if !cfg!(target_os = "macos") {
            return None;
        }
        let output = std::process::Command::new("security")
            .args(["find-generic-password", "-s", service, "-w"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let raw = String::from_utf8(output.stdout).ok()?;
        let trimmed = raw.trim().to_string();
        if trimmed.is_empty() { None } else { Some(trimmed) }
    }
}

/// One seed file with its content resolved on the host.
#[derive(Debug, Clone)]
pub struct ResolvedSeed {
    pub target_path: String,
    pub home_dir: bool,
    pub content: Vec<u8>,
}

/// Everything collected for injection: API key values and seed contents.
#[derive(Debug, Clone, Default)]
pub struct CredentialPlan {
    /// Env var name → value, projected as `/run/secrets/<NAME>` files.
    pub api_keys: Vec<(String, String)>,
    pub seeds: Vec<ResolvedSeed>,
}

/// Collect credentials for an agent from the host environment, seed files,
/// and the keychain.
///
/// Fails with `CredentialMissing` when the agent declares API keys and none
/// of them, none of the auth-hint variables, and no auth-only seed resolves.
pub fn collect(
    agent: &AgentDef,
    env: &dyn Fn(&str) -> Option<String>,
    keychain: &dyn Keychain,
) -> Result<CredentialPlan> {
    let mut plan = CredentialPlan::default();

    for var in &agent.api_key_env_vars {
        if let Some(value) = env(var).filter(|v| !v.is_empty()) {
            plan.api_keys.push((var.clone(), value));
        }
    }

    let agent_requires_auth = !agent.api_key_env_vars.is_empty();
    let have_agent_key = !plan.api_keys.is_empty();
    let have_hint = agent
        .auth_hint_env_vars
        .iter()
        .any(|v| env(v).filter(|s| !s.is_empty()).is_some());

    let mut resolved_auth_seed = false;
    for seed in &agent.seed_files {
        let gate_keys: &[String] = seed
            .owner_api_keys
            .as_deref()
            .unwrap_or(&agent.api_key_env_vars);
        let have_owner_key = gate_keys
            .iter()
            .any(|v| env(v).filter(|s| !s.is_empty()).is_some());

        if seed.auth_only && have_owner_key {
            // An API key supersedes file-based auth.
            continue;
        }

        let content = resolve_seed_content(&seed.host_path, seed.keychain_service.as_deref(), keychain);
        match content {
            Some(content) => {
                if seed.auth_only {
                    resolved_auth_seed = true;
                }
                plan.seeds.push(ResolvedSeed {
                    target_path: seed.target_path.clone(),
                    home_dir: seed.home_dir,
                    content,
                });
            }
            None if seed.auth_only && agent_requires_auth && !have_owner_key => {
                return Err(Error::CredentialMissing {
                    agent: agent.name.clone(),
                    vars: gate_keys.to_vec(),
                });
            }
            None => {
                tracing::debug!(agent = %agent.name, seed = %seed.host_path, "seed file absent, skipping");
            }
        }
    }

    if agent_requires_auth && !have_agent_key && !have_hint && !resolved_auth_seed {
        return Err(Error::CredentialMissing {
            agent: agent.name.clone(),
            vars: agent.api_key_env_vars.clone(),
        });
    }

    Ok(plan)
}

fn resolve_seed_content(
    host_path: &str,
    keychain_service: Option<&str>,
    keychain: &dyn Keychain,
) -> Option<Vec<u8>> {
    let expanded = expand_tilde(host_path);
    if let Ok(bytes) = std::fs::read(&expanded) {
        return Some(bytes);
    }
    keychain_service
        .and_then(|service| keychain.lookup(service))
        .map(String::into_bytes)
}

/// Secrets staged on the host for bind-mounting into the instance.
///
/// Lives under an unpredictable per-invocation directory (0700, files 0600).
/// Dropping removes the directory, so the files are gone as soon as the
/// instance has started, and on every error path; `persist()` opts out for
/// instances created but deliberately not started yet.
#[derive(Debug)]
pub struct StagedSecrets {
    pub dir: PathBuf,
    /// Env var name → staged file path.
    pub files: Vec<(String, PathBuf)>,
    keep: bool,
}

impl StagedSecrets {
    /// Leave the staged files on disk past this invocation.
    pub fn persist(&mut self) {
        self.keep = true;
    }
}

impl Drop for StagedSecrets {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %self.dir.display(), error = %e, "failed to remove secret staging dir");
            }
        }
    }
}

/// Stale staging dirs older than this are eligible for prune.
pub const STAGING_PREFIX: &str = "yoloai-";

/// Stage API key values as per-secret files under `/tmp/yoloai-<rand>/`.
/// Returns None when the plan has no keys.
pub fn stage_secrets(plan: &CredentialPlan) -> Result<Option<StagedSecrets>> {
    if plan.api_keys.is_empty() {
        return Ok(None);
    }
    let dir = std::env::temp_dir().join(format!(
        "{STAGING_PREFIX}{}",
        uuid::Uuid::new_v4().simple()
    ));
    create_dir_with_mode(&dir, 0o700).map_err(|e| Error::io("create secret staging dir", e))?;

    let mut files = Vec::new();
    for (name, value) in &plan.api_keys {
        let path = dir.join(name);
        write_secret_file(&path, value.as_bytes())
            .map_err(|e| Error::io("write staged secret", e))?;
        files.push((name.clone(), path));
    }
    Ok(Some(StagedSecrets {
        dir,
        files,
        keep: false,
    }))
}

/// Write resolved seed files into the sandbox's `agent-state/` or
/// `home-seed/` trees. Files are 0600, parents owner-only.
pub fn write_seeds(plan: &CredentialPlan, paths: &SandboxPaths) -> Result<()> {
    for seed in &plan.seeds {
        let root = if seed.home_dir {
            paths.home_seed_dir()
        } else {
            paths.agent_state_dir()
        };
        let target = root.join(&seed.target_path);
        if let Some(parent) = target.parent() {
            create_dir_with_mode(parent, 0o700).map_err(|e| Error::io("create seed dir", e))?;
        }
        write_secret_file(&target, &seed.content).map_err(|e| Error::io("write seed file", e))?;
    }
    Ok(())
}

/// Remove stale `/tmp/yoloai-*` staging dirs older than one hour. Returns
/// the removed paths.
pub fn prune_stale_staging() -> Vec<PathBuf> {
    let mut removed = Vec::new();
    let tmp = std::env::temp_dir();
    let Ok(entries) = std::fs::read_dir(&tmp) else {
        return removed;
    };
    let cutoff = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(STAGING_PREFIX) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_dir() {
            continue;
        }
        let old = meta.modified().map(|m| m < cutoff).unwrap_or(false);
        if old && std::fs::remove_dir_all(entry.path()).is_ok() {
            removed.push(entry.path());
        }
    }
    removed
}
