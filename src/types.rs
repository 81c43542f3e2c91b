//! Data model shared by the scanner, the evaluator and the restore writer.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RecoveryError;

/// Filesystem family detected on a volume.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilesystemKind {
    Ntfs,
    Fat32,
    ExFat,
    HfsPlus,
    Ext4,
    Unknown,
}

impl FilesystemKind {
    pub fn name(&self) -> &'static str {
        match self {
            FilesystemKind::Ntfs => "NTFS",
            FilesystemKind::Fat32 => "FAT32",
            FilesystemKind::ExFat => "exFAT",
            FilesystemKind::HfsPlus => "HFS+",
            FilesystemKind::Ext4 => "EXT4",
            FilesystemKind::Unknown => "Unknown",
        }
    }
}

/// How a volume is identified on the host, used to keep restores off the source.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceIdentity {
    /// A block or character device, by device number.
    Device { rdev: u64 },
    /// A regular image file, by the filesystem it lives on and its inode.
    ImageFile { dev: u64, ino: u64 },
    /// In-memory sources and platforms without stable identities.
    Detached,
}

/// Immutable description of an opened volume.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VolumeInfo {
    pub path: PathBuf,
    pub partition: Option<u32>,
    pub sector_size: u32,
    pub total_sectors: u64,
    pub filesystem: FilesystemKind,
    pub identity: DeviceIdentity,
}

/// One run of sectors belonging to a candidate. `length` is in bytes so the
/// extent list of an entry sums to its size; only the last extent of an entry
/// is normally shorter than its allocation unit.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start_sector: u64,
    pub length: u64,
    /// Set when the sectors are now owned by a live allocation.
    pub overwritten: bool,
}

impl Extent {
    pub fn new(start_sector: u64, length: u64) -> Self {
        Extent {
            start_sector,
            length,
            overwritten: false,
        }
    }

    pub fn start_byte(&self, sector_size: u32) -> u64 {
        self.start_sector * sector_size as u64
    }

    pub fn end_byte(&self, sector_size: u32) -> u64 {
        self.start_byte(sector_size) + self.length
    }

    /// Number of sectors touched by this extent.
    pub fn sector_count(&self, sector_size: u32) -> u64 {
        self.length.div_ceil(sector_size as u64)
    }

    pub fn contains_sector(&self, sector: u64, sector_size: u32) -> bool {
        sector >= self.start_sector && sector < self.start_sector + self.sector_count(sector_size)
    }
}

/// True when any two extents share a byte.
pub fn extents_overlap(extents: &[Extent], sector_size: u32) -> bool {
    let mut spans: Vec<(u64, u64)> = extents
        .iter()
        .filter(|e| e.length > 0)
        .map(|e| (e.start_byte(sector_size), e.end_byte(sector_size)))
        .collect();
    spans.sort_unstable();
    spans.windows(2).any(|w| w[1].0 < w[0].1)
}

/// True when every extent starts on the sector right after the previous one ends.
pub fn extents_contiguous(extents: &[Extent], sector_size: u32) -> bool {
    extents.windows(2).all(|w| {
        w[0].start_sector + w[0].sector_count(sector_size) == w[1].start_sector
    })
}

/// Where a candidate comes from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Metadata,
    Carved,
}

/// Recovery confidence. Ordered so that `High > Medium > Low`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

/// Outcome of a structural or checksum self-check over reconstructed content.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StructuralCheck {
    Passed,
    Failed,
    Unavailable,
}

/// Metadata locator of a candidate inside its volume.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryLocator {
    MftRecord(u64),
    Inode(u64),
    /// Byte offset of the directory slot (or entry set) on the volume.
    DirectorySlot(u64),
    /// Catalog node number and byte offset of the record inside that node.
    CatalogRecord { node: u32, offset: u32 },
    /// Byte offset of the carved header on the volume.
    CarveOffset(u64),
}

impl fmt::Display for EntryLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryLocator::MftRecord(n) => write!(f, "mft-{}", n),
            EntryLocator::Inode(n) => write!(f, "inode-{}", n),
            EntryLocator::DirectorySlot(off) => write!(f, "dirent-{}", off),
            EntryLocator::CatalogRecord { node, offset } => write!(f, "catalog-{}-{}", node, offset),
            EntryLocator::CarveOffset(off) => write!(f, "carve-{}", off),
        }
    }
}

/// Stable identifier of a candidate: volume plus metadata locator.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub volume: u64,
    pub locator: EntryLocator,
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}/{}", self.volume, self.locator)
    }
}

/// File type inferred from a signature or from the recorded name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileTypeGuess {
    pub extension: String,
    pub mime: String,
}

impl FileTypeGuess {
    pub fn from_extension(ext: &str) -> Self {
        let extension = ext.to_lowercase();
        let mime = mime_for_extension(&extension).to_string();
        FileTypeGuess { extension, mime }
    }

    pub fn from_name(name: &str) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.len() <= 10)
            .unwrap_or("");
        Self::from_extension(ext)
    }

    pub fn category(&self) -> FileCategory {
        FileCategory::from_extension(&self.extension)
    }
}

fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "doc" | "xls" | "ole" => "application/x-ole-storage",
        "7z" => "application/x-7z-compressed",
        "rar" => "application/vnd.rar",
        "sqlite" | "db" => "application/vnd.sqlite3",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "avi" => "video/x-msvideo",
        "mp4" => "video/mp4",
        "txt" => "text/plain",
        "eml" => "message/rfc822",
        _ => "application/octet-stream",
    }
}

/// Coarse grouping used for result filtering.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Documents,
    Videos,
    Images,
    Emails,
    Audio,
    Archives,
    Other,
}

impl FileCategory {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "webp" | "tiff" | "ico" | "heic" => {
                FileCategory::Images
            }
            "mp4" | "avi" | "mkv" | "mov" | "wmv" | "flv" | "webm" | "m4v" => FileCategory::Videos,
            "mp3" | "wav" | "flac" | "aac" | "ogg" | "wma" | "m4a" => FileCategory::Audio,
            "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "txt" | "rtf" | "odt"
            | "ole" => FileCategory::Documents,
            "eml" | "msg" | "pst" | "mbox" => FileCategory::Emails,
            "zip" | "rar" | "7z" | "tar" | "gz" | "bz2" => FileCategory::Archives,
            _ => FileCategory::Other,
        }
    }
}

impl FromStr for FileCategory {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "documents" => Ok(FileCategory::Documents),
            "videos" => Ok(FileCategory::Videos),
            "images" => Ok(FileCategory::Images),
            "emails" => Ok(FileCategory::Emails),
            "audio" => Ok(FileCategory::Audio),
            "archives" => Ok(FileCategory::Archives),
            "other" => Ok(FileCategory::Other),
            other => Err(RecoveryError::Config(format!("unknown category: {}", other))),
        }
    }
}

/// A discovered recoverable unit. Built once, fully, before it is published
/// to a scan session; never mutated afterwards.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CandidateEntry {
    pub id: EntryId,
    pub name: Option<String>,
    /// Directory path recorded in metadata, when it could be resolved.
    pub path: Option<String>,
    pub size: u64,
    pub extents: Vec<Extent>,
    pub modified: Option<DateTime<Utc>>,
    pub source: SourceKind,
    pub tier: ConfidenceTier,
    pub file_type: FileTypeGuess,
    pub structural: StructuralCheck,
    pub readable_fraction: f64,
    /// CRC-32 of the reconstructed content, when it was read at scan time.
    pub checksum: Option<u32>,
    /// Hex preview of the first bytes for carved entries.
    pub header_hex: Option<String>,
}

impl CandidateEntry {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None if self.file_type.extension.is_empty() => self.id.locator.to_string(),
            None => format!("{}.{}", self.id.locator, self.file_type.extension),
        }
    }
}

/// Scan depth requested by the caller.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Quick,
    Deep,
    Forensic,
}

impl FromStr for ScanMode {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quick" => Ok(ScanMode::Quick),
            "deep" => Ok(ScanMode::Deep),
            "forensic" => Ok(ScanMode::Forensic),
            other => Err(RecoveryError::Config(format!("unknown scan mode: {}", other))),
        }
    }
}

/// Lifecycle of a scan session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Cancelled | ScanState::Failed
        )
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ScanState::Idle => 0,
            ScanState::Running => 1,
            ScanState::Completed => 2,
            ScanState::Cancelled => 3,
            ScanState::Failed => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ScanState::Running,
            2 => ScanState::Completed,
            3 => ScanState::Cancelled,
            4 => ScanState::Failed,
            _ => ScanState::Idle,
        }
    }
}

/// Point-in-time view of a session's counters.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProgressSnapshot {
    pub sectors_scanned: u64,
    pub entries_found: u64,
    pub state: ScanState,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RestoreOutcome {
    Pending,
    Succeeded,
    Failed,
}

/// One request to copy one candidate's content out to a destination.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RestoreJob {
    pub entry: EntryId,
    pub destination: PathBuf,
    pub outcome: RestoreOutcome,
    pub failure: Option<String>,
    /// Set when the written data may be incomplete or unverified.
    pub low_confidence: bool,
    pub notes: Vec<String>,
    pub bytes_written: u64,
    pub checksum: Option<u32>,
}

impl RestoreJob {
    pub fn pending(entry: EntryId, destination: PathBuf) -> Self {
        RestoreJob {
            entry,
            destination,
            outcome: RestoreOutcome::Pending,
            failure: None,
            low_confidence: false,
            notes: Vec::new(),
            bytes_written: 0,
            checksum: None,
        }
    }

    pub fn fail(mut self, reason: impl Into<String>) -> Self {
        self.outcome = RestoreOutcome::Failed;
        self.failure = Some(reason.into());
        self
    }
}

/// Result filter supplied by a front end.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ResultFilter {
    pub category: Option<FileCategory>,
    pub name_contains: Option<String>,
}

impl ResultFilter {
    pub fn matches(&self, entry: &CandidateEntry) -> bool {
        if let Some(category) = self.category {
            if entry.file_type.category() != category {
                return false;
            }
        }
        match &self.name_contains {
            Some(needle) => entry
                .display_name()
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            None => true,
        }
    }
}
