//! Error taxonomy shared by every component of the recovery core.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Every failure the recovery core can report. Nothing in the library
/// terminates the process; callers get one of these instead.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Access denied opening {path}: {message}")]
    AccessDenied { path: PathBuf, message: String },

    #[error("Volume not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported medium: {0}")]
    UnsupportedMedium(String),

    #[error("I/O error at byte offset {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("Sector range {start}+{count} is outside the volume ({total} sectors)")]
    OutOfRange { start: u64, count: u64, total: u64 },

    #[error("Corrupt metadata in {region}: {reason}")]
    MetadataCorrupt { region: String, reason: String },

    #[error("Destination {0} resolves onto the source volume")]
    DestinationOnSourceVolume(PathBuf),

    #[error("Unknown volume handle {0}")]
    UnknownVolume(u64),

    #[error("Unknown scan session {0}")]
    UnknownSession(u64),

    #[error("Unknown entry {0}")]
    UnknownEntry(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RecoveryError {
    /// Build a `MetadataCorrupt` error for a named region.
    pub fn corrupt(region: impl Into<String>, reason: impl Into<String>) -> Self {
        RecoveryError::MetadataCorrupt {
            region: region.into(),
            reason: reason.into(),
        }
    }

    /// Map an error from `File::open` (or `metadata`) to the open-time taxonomy.
    pub fn from_open(path: &std::path::Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => RecoveryError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => RecoveryError::AccessDenied {
                path: path.to_path_buf(),
                message: err.to_string(),
            },
            _ => RecoveryError::UnsupportedMedium(format!("{}: {}", path.display(), err)),
        }
    }

    pub fn is_metadata_corrupt(&self) -> bool {
        matches!(self, RecoveryError::MetadataCorrupt { .. })
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, RecoveryError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_open_errors_map_to_taxonomy() {
        let path = Path::new("/dev/does-not-exist");
        let missing = RecoveryError::from_open(path, io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(missing, RecoveryError::NotFound(_)));

        let denied =
            RecoveryError::from_open(path, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(denied, RecoveryError::AccessDenied { .. }));

        let other = RecoveryError::from_open(path, io::Error::from(io::ErrorKind::InvalidInput));
        assert!(matches!(other, RecoveryError::UnsupportedMedium(_)));
    }

    #[test]
    fn test_corrupt_helper() {
        let err = RecoveryError::corrupt("mft records 0..4096", "bad fixup");
        assert!(err.is_metadata_corrupt());
        assert!(err.to_string().contains("bad fixup"));
    }
}
