//! Store abstraction for ChangeOps state management.
//!
//! A [`Store`] is the logical container for the control plane's subsystem
//! databases and the audit event log, rooted at `<project>/.changeops/data/`.
//! All subsystem state (drafts, workflows, triggers, promotions, the graph)
//! is scoped to a store, and all mutations go through the broker
//! (see `broker.rs`).

use crate::core::error::ChangeOpsError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Store handle representing a ChangeOps state workspace.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory (`…/.changeops/data`).
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Open the store for a project root, creating the data directory if needed.
    pub fn open(project_root: &Path) -> Result<Self, ChangeOpsError> {
        let root = project_root.join(".changeops").join("data");
        fs::create_dir_all(&root).map_err(ChangeOpsError::IoError)?;
        Ok(Self { root })
    }
}

/// Walk up from `start_dir` to the nearest directory containing `.changeops`.
pub fn find_project_root(start_dir: &Path) -> Result<PathBuf, ChangeOpsError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(".changeops").exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(ChangeOpsError::NotFound(
                "'.changeops' directory not found in current or parent directories. Run `changeops init` first.".to_string(),
            ));
        }
    }
}

/// Runtime configuration, read from `<project>/.changeops/config.toml`.
///
/// Missing file or missing keys fall back to defaults; environment variables
/// (`CHANGEOPS_DISPATCHER_CONCURRENCY`, `CHANGEOPS_SCHEDULE_TICK_SECS`)
/// override the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Bounded dispatcher concurrency W.
    pub dispatcher_concurrency: usize,
    /// Schedule poller tick in seconds.
    pub schedule_tick_secs: u64,
    /// Horizon after which pending intents are re-scanned on startup, seconds.
    pub intent_recovery_horizon_secs: u64,
    /// Raise on the first malformed stream frame instead of dropping it.
    pub strict_frames: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dispatcher_concurrency: 4,
            schedule_tick_secs: 60,
            intent_recovery_horizon_secs: 300,
            strict_frames: false,
        }
    }
}

impl StoreConfig {
    pub fn load(project_root: &Path) -> Self {
        let path = project_root.join(".changeops").join("config.toml");
        let mut config = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| toml::from_str::<StoreConfig>(&raw).ok())
            .unwrap_or_default();

        if let Some(w) = env_usize("CHANGEOPS_DISPATCHER_CONCURRENCY") {
            config.dispatcher_concurrency = w.max(1);
        }
        if let Some(tick) = env_u64("CHANGEOPS_SCHEDULE_TICK_SECS") {
            config.schedule_tick_secs = tick.max(1);
        }
        config
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_sane() {
        let config = StoreConfig::default();
        assert_eq!(config.schedule_tick_secs, 60);
        assert!(config.dispatcher_concurrency >= 1);
        assert!(!config.strict_frames);
    }

    #[test]
    fn config_parses_partial_toml() {
        let config: StoreConfig = toml::from_str("dispatcher_concurrency = 8").unwrap();
        assert_eq!(config.dispatcher_concurrency, 8);
        assert_eq!(config.schedule_tick_secs, 60);
    }
}
