use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use super::types::{DirSpec, NetworkMode, PortMap, Resources};
use crate::util::fs::atomic_write;

/// The durable state of a sandbox, persisted as `meta.json`.
///
/// Unknown fields are ignored on read so older binaries can load metadata
/// written by newer ones. The file is always rewritten whole via
/// write-temp + rename, never patched in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub yoloai_version: String,

    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Which driver owns this instance.
    pub backend: String,
    pub image_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,

    pub workdir: DirSpec,
    #[serde(default)]
    pub directories: Vec<DirSpec>,

    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default)]
    pub network_allow: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortMap>,
    #[serde(default)]
    pub resources: Resources,

    #[serde(default)]
    pub has_prompt: bool,
}

impl Meta {
    pub fn load(path: &Path) -> Result<Meta> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))
    }

    /// Atomic write: serialize, write to a temp file in the same directory,
    /// rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Other(format!("serialize meta: {e}")))?;
        json.push(b'\n');
        atomic_write(path, &json).map_err(|e| Error::io("write meta.json", e))
    }

    /// All directories attached to the sandbox: workdir first, then aux dirs.
    pub fn all_dirs(&self) -> impl Iterator<Item = &DirSpec> {
        std::iter::once(&self.workdir).chain(self.directories.iter())
    }

    pub fn all_dirs_mut(&mut self) -> impl Iterator<Item = &mut DirSpec> {
        std::iter::once(&mut self.workdir).chain(self.directories.iter_mut())
    }
}
