//! Engine tuning knobs, loadable from a JSON file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, Result};

/// Environment variable naming a JSON config file for the CLI.
pub const CONFIG_ENV: &str = "PHOENIX_RESTORE_CONFIG";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Scan worker threads.
    pub scan_workers: usize,
    /// Concurrent restore jobs in one batch.
    pub restore_workers: usize,
    /// Index records (MFT records, inodes, catalog nodes) per metadata region.
    pub records_per_region: u64,
    /// Bytes per carving window handed to one worker.
    pub carve_window_bytes: u64,
    /// Content above this size is not read back for checksum/structure checks.
    pub verify_limit_bytes: u64,
    pub max_carved_candidates: usize,
    /// Extent counts above this are heavy fragmentation.
    pub fragmentation_threshold: usize,
    /// Directory names a quick scan is restricted to.
    pub quick_directories: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        EngineConfig {
            scan_workers: workers.max(1),
            restore_workers: 4,
            records_per_region: 4096,
            carve_window_bytes: 4 * 1024 * 1024,
            verify_limit_bytes: 64 * 1024 * 1024,
            max_carved_candidates: 50_000,
            fragmentation_threshold: 16,
            quick_directories: [
                "Desktop",
                "Downloads",
                "Documents",
                "Pictures",
                "Videos",
                "Music",
                "$RECYCLE.BIN",
                "RECYCLER",
                "Recycle Bin",
                ".Trash",
                ".Trash-1000",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(text)
            .map_err(|e| RecoveryError::Config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RecoveryError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan_workers == 0 {
            return Err(RecoveryError::Config("scan_workers must be at least 1".into()));
        }
        if self.restore_workers == 0 {
            return Err(RecoveryError::Config("restore_workers must be at least 1".into()));
        }
        if self.records_per_region == 0 {
            return Err(RecoveryError::Config("records_per_region must be at least 1".into()));
        }
        if self.carve_window_bytes < 4096 {
            return Err(RecoveryError::Config("carve_window_bytes must be at least 4096".into()));
        }
        Ok(())
    }

    /// Case-insensitive membership test against the quick-scan directory list.
    pub fn is_quick_directory(&self, name: &str) -> bool {
        self.quick_directories
            .iter()
            .any(|d| d.eq_ignore_ascii_case(name))
    }
}
