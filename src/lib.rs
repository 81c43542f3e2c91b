//! Phoenix Restore - Deleted-file recovery engine
//!
//! Opens devices and disk images read-only, walks FAT32, exFAT, NTFS, EXT4
//! and HFS+ metadata for unlinked files, carves free space by signature,
//! grades every candidate and restores selected ones off the source volume.

pub mod config;
pub mod disk_reader;
pub mod error;
pub mod evaluator;
pub mod exfat_parser;
pub mod ext4_parser;
pub mod fat_parser;
pub mod file_carver;
pub mod filesystem;
pub mod hfs_parser;
pub mod ntfs_parser;
pub mod recovery_engine;
pub mod restore;
pub mod types;
pub mod validators;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{EngineConfig, CONFIG_ENV};
pub use disk_reader::{DiskReader, PartitionEntry};
pub use error::{RecoveryError, Result};
pub use recovery_engine::{RecoveryEngine, ScanReport, ScanSessionId, VolumeHandle};
pub use types::{
    CandidateEntry, ConfidenceTier, EntryId, FileCategory, FilesystemKind, ProgressSnapshot,
    RestoreJob, RestoreOutcome, ResultFilter, ScanMode, ScanState, VolumeInfo,
};
