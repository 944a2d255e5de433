//! Cluster endpoint persistence.
//!
//! The endpoints handed out to clusters are saved on shutdown and loaded on
//! startup, so a restarted process can hot restart with the same ports.
//! Writes go to a temp file that is renamed over the state file.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::registry::ClusterEndpoint;

/// Persisted state file format version.
const STATE_VERSION: u32 = 1;

/// Persisted endpoint state.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedState {
    /// Format version.
    pub version: u32,
    /// Host the endpoints were bound to.
    pub host: String,
    /// Endpoints ordered by port.
    pub clusters: Vec<ClusterEndpoint>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            host: String::new(),
            clusters: Vec::new(),
        }
    }
}

/// State persistence manager.
pub struct StatePersistence {
    /// Path to the state file.
    state_path: PathBuf,
}

impl StatePersistence {
    pub fn new(state_path: PathBuf) -> Self {
        Self { state_path }
    }

    /// Load state from disk.
    ///
    /// Returns default state if the file doesn't exist or was written by an
    /// incompatible version. Returns error if the file exists but is invalid.
    pub fn load(&self) -> Result<PersistedState> {
        if !self.state_path.exists() {
            debug!(path = %self.state_path.display(), "No state file, starting fresh");
            return Ok(PersistedState::default());
        }

        let content = fs::read_to_string(&self.state_path)
            .with_context(|| format!("Failed to read state file: {}", self.state_path.display()))?;

        let state: PersistedState = serde_json::from_str(&content).with_context(|| {
            format!("Failed to parse state file: {}", self.state_path.display())
        })?;

        if state.version != STATE_VERSION {
            warn!(
                file_version = state.version,
                current_version = STATE_VERSION,
                "State file version mismatch, starting fresh"
            );
            return Ok(PersistedState::default());
        }

        info!(
            path = %self.state_path.display(),
            host = %state.host,
            cluster_count = state.clusters.len(),
            "Loaded state from disk"
        );

        Ok(state)
    }

    /// Save the endpoints of every cluster.
    pub fn save(&self, host: &str, clusters: Vec<ClusterEndpoint>) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let state = PersistedState {
            version: STATE_VERSION,
            host: host.to_string(),
            clusters,
        };

        let tmp_path = self.state_path.with_extension("tmp");
        let content = serde_json::to_string_pretty(&state).context("Failed to serialize state")?;

        fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write temp file: {}", tmp_path.display()))?;

        fs::rename(&tmp_path, &self.state_path).with_context(|| {
            format!(
                "Failed to rename {} -> {}",
                tmp_path.display(),
                self.state_path.display()
            )
        })?;

        debug!(
            path = %self.state_path.display(),
            cluster_count = state.clusters.len(),
            "Saved state to disk"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn endpoint(name: &str, port: u16) -> ClusterEndpoint {
        ClusterEndpoint {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let persistence = StatePersistence::new(dir.path().join("state.json"));

        let state = persistence.load().unwrap();
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.clusters.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let persistence = StatePersistence::new(path.clone());

        persistence
            .save("127.0.0.1", vec![endpoint("a", 20005), endpoint("b", 20010)])
            .unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let state = persistence.load().unwrap();
        assert_eq!(state.host, "127.0.0.1");
        assert_eq!(state.clusters, vec![endpoint("a", 20005), endpoint("b", 20010)]);
    }

    #[test]
    fn test_version_mismatch_starts_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{"version":99,"host":"127.0.0.1","clusters":[{"name":"a","host":"127.0.0.1","port":20000}]}"#,
        )
        .unwrap();

        let state = StatePersistence::new(path).load().unwrap();
        assert!(state.clusters.is_empty());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "not json").unwrap();

        assert!(StatePersistence::new(path).load().is_err());
    }
}
