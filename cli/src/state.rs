use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Outputs harvested from one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeState {
    pub role: String,
    pub bin_dir: Option<String>,
    pub token: Option<String>,
    pub kubeconfig: Option<String>,
}

/// Persisted per-host state, the CLI's stand-in for a caller that stores
/// harvested outputs between lifecycle calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateStore {
    // Key: host
    pub nodes: BTreeMap<String, NodeState>,
}

impl StateStore {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(path).with_context(|| format!("Failed to read state {:?}", path))?;
        let store =
            serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create dir {:?}", parent))?;
        }
        let bytes = serde_json::to_vec_pretty(self).context("Failed to serialize state")?;
        fs::write(path, bytes).with_context(|| format!("Failed to write {:?}", path))?;

        // The store holds join tokens; keep it owner-readable only.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to set permissions on {:?}", path))?;
        }
        Ok(())
    }
}

pub fn default_state_path() -> PathBuf {
    let mut dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push("capstan");
    dir.push("state.json");
    dir
}
