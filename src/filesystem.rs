//! Filesystem detection and the common shape of the metadata parsers.
//!
//! Each parser walks one filesystem family's on-disk index and reports the
//! unlinked files whose data has not been handed to a live object yet.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::disk_reader::DiskReader;
use crate::error::Result;
use crate::types::{EntryLocator, Extent, FilesystemKind};

const HEADER_BYTES: usize = 4096;

/// A half-open run of sectors `[start, start + count)`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SectorRange {
    pub start: u64,
    pub count: u64,
}

impl SectorRange {
    pub fn new(start: u64, count: u64) -> Self {
        SectorRange { start, count }
    }

    pub fn end(&self) -> u64 {
        self.start + self.count
    }
}

/// Merge overlapping or touching ranges into a sorted, disjoint list.
pub fn merge_ranges(mut ranges: Vec<SectorRange>) -> Vec<SectorRange> {
    ranges.retain(|r| r.count > 0);
    ranges.sort_unstable();
    let mut merged: Vec<SectorRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start <= last.end() => {
                let end = last.end().max(range.end());
                last.count = end - last.start;
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Which part of the directory tree a scan covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanScope {
    /// Only the well-known user directories (quick mode).
    WellKnown,
    /// Every record on the volume.
    Full,
}

/// One disjoint unit of metadata work handed to a scan worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionSpec {
    /// A contiguous range of index records (MFT records, inodes by group, catalog nodes).
    Records { first: u64, count: u64 },
    /// One directory, by the parser's own locator (cluster, inode).
    Directory {
        locator: u64,
        path: String,
        recursive: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRegion {
    pub spec: RegionSpec,
    /// Sectors to carve if this region turns out to be corrupt. `None` means
    /// the free space of the whole volume.
    pub fallback: Option<SectorRange>,
}

impl MetadataRegion {
    pub fn records(first: u64, count: u64) -> Self {
        MetadataRegion {
            spec: RegionSpec::Records { first, count },
            fallback: None,
        }
    }

    /// Record regions covering `ids`, consecutive ids merged into runs of at
    /// most `per_region` records.
    pub fn record_runs(ids: impl IntoIterator<Item = u64>, per_region: u64) -> Vec<Self> {
        let mut ids: Vec<u64> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        let mut regions: Vec<MetadataRegion> = Vec::new();
        for id in ids {
            match regions.last_mut() {
                Some(MetadataRegion {
                    spec: RegionSpec::Records { first, count },
                    ..
                }) if *first + *count == id && *count < per_region.max(1) => *count += 1,
                _ => regions.push(MetadataRegion::records(id, 1)),
            }
        }
        regions
    }

    pub fn directory(locator: u64, path: impl Into<String>, recursive: bool) -> Self {
        MetadataRegion {
            spec: RegionSpec::Directory {
                locator,
                path: path.into(),
                recursive,
            },
            fallback: None,
        }
    }

    pub fn label(&self) -> String {
        match &self.spec {
            RegionSpec::Records { first, count } => format!("records {}..{}", first, first + count),
            RegionSpec::Directory { path, .. } => format!("directory {}", path),
        }
    }
}

/// An unlinked file found by a parser, before evaluation.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub locator: EntryLocator,
    pub name: Option<String>,
    pub path: Option<String>,
    pub size: u64,
    /// In file order; overwritten runs already flagged.
    pub extents: Vec<Extent>,
    pub modified: Option<DateTime<Utc>>,
    /// The extent list comes from intact allocation metadata rather than a
    /// layout assumption.
    pub layout_verified: bool,
}

/// Shared state handed to parsers and carvers: the volume, the knobs, the
/// cancellation flag and the progress counter.
pub struct ScanContext<'a> {
    pub reader: &'a DiskReader,
    pub config: &'a EngineConfig,
    cancel: &'a AtomicBool,
    sectors_scanned: &'a AtomicU64,
}

impl<'a> ScanContext<'a> {
    pub fn new(
        reader: &'a DiskReader,
        config: &'a EngineConfig,
        cancel: &'a AtomicBool,
        sectors_scanned: &'a AtomicU64,
    ) -> Self {
        ScanContext {
            reader,
            config,
            cancel,
            sectors_scanned,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn sector_size(&self) -> u32 {
        self.reader.sector_size()
    }

    pub fn volume_bytes(&self) -> u64 {
        self.reader.size()
    }

    /// Read bytes and count the sectors touched towards scan progress.
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let data = self.reader.read_bytes(offset, len)?;
        self.count_bytes(len as u64);
        Ok(data)
    }

    pub fn count_bytes(&self, len: u64) {
        let sectors = len.div_ceil(self.sector_size() as u64);
        self.sectors_scanned.fetch_add(sectors, Ordering::Relaxed);
    }
}

/// Allocation state per allocation unit (cluster or block). A set bit means
/// a live object owns the unit. Bytes outside the mapped unit area count as
/// allocated, since they hold the filesystem's own structures.
#[derive(Debug, Clone)]
pub struct AllocationMap {
    first_unit: u64,
    first_unit_byte: u64,
    unit_bytes: u64,
    unit_count: u64,
    bits: Vec<u8>,
}

impl AllocationMap {
    /// Everything free; units are marked as live owners are discovered.
    pub fn new(first_unit: u64, first_unit_byte: u64, unit_bytes: u64, unit_count: u64) -> Self {
        AllocationMap {
            first_unit,
            first_unit_byte,
            unit_bytes: unit_bytes.max(1),
            unit_count,
            bits: vec![0u8; unit_count.div_ceil(8) as usize],
        }
    }

    /// Like `new`, but units that would start past `volume_bytes` are left
    /// out of the map. Damaged geometry cannot inflate the bitmap.
    pub fn bounded(
        first_unit: u64,
        first_unit_byte: u64,
        unit_bytes: u64,
        unit_count: u64,
        volume_bytes: u64,
    ) -> Self {
        let fitting = volume_bytes.saturating_sub(first_unit_byte) / unit_bytes.max(1);
        if fitting < unit_count {
            warn!(
                "Allocation map of {} units capped to the {} that fit the volume",
                unit_count, fitting
            );
        }
        AllocationMap::new(first_unit, first_unit_byte, unit_bytes, unit_count.min(fitting))
    }

    /// An empty map where no unit exists: every byte counts as free.
    pub fn unmapped() -> Self {
        AllocationMap::new(0, 0, 1, 0)
    }

    pub fn unit_bytes(&self) -> u64 {
        self.unit_bytes
    }

    pub fn unit_count(&self) -> u64 {
        self.unit_count
    }

    pub fn mark(&mut self, unit: u64) {
        if let Some(idx) = self.index(unit) {
            self.bits[(idx / 8) as usize] |= 1 << (idx % 8);
        }
    }

    pub fn mark_run(&mut self, first: u64, count: u64) {
        for unit in first..first.saturating_add(count) {
            self.mark(unit);
        }
    }

    pub fn is_allocated(&self, unit: u64) -> bool {
        match self.index(unit) {
            Some(idx) => self.bits[(idx / 8) as usize] & (1 << (idx % 8)) != 0,
            None => self.unit_count > 0,
        }
    }

    fn index(&self, unit: u64) -> Option<u64> {
        unit.checked_sub(self.first_unit)
            .filter(|idx| *idx < self.unit_count)
    }

    /// Byte offset where `unit` starts.
    pub fn unit_offset(&self, unit: u64) -> u64 {
        self.first_unit_byte + (unit - self.first_unit) * self.unit_bytes
    }

    fn unit_at_byte(&self, byte: u64) -> Option<u64> {
        if self.unit_count == 0 || byte < self.first_unit_byte {
            return None;
        }
        let unit = self.first_unit + (byte - self.first_unit_byte) / self.unit_bytes;
        (unit < self.first_unit + self.unit_count).then_some(unit)
    }

    /// Split an extent wherever allocation state changes, flagging runs now
    /// owned by live objects as overwritten.
    pub fn split_extent(&self, extent: Extent, sector_size: u32) -> Vec<Extent> {
        if self.unit_count == 0 || extent.length == 0 {
            return vec![extent];
        }
        let ss = sector_size as u64;
        let mut pieces: Vec<Extent> = Vec::new();
        let mut pos = extent.start_byte(sector_size);
        let end = extent.end_byte(sector_size);

        while pos < end {
            let (piece_end, allocated) = match self.unit_at_byte(pos) {
                Some(unit) => {
                    let unit_end = self.unit_offset(unit) + self.unit_bytes;
                    (unit_end.min(end), self.is_allocated(unit))
                }
                None => (end, true),
            };
            let overwritten = allocated || extent.overwritten;
            match pieces.last_mut() {
                Some(last) if last.overwritten == overwritten => last.length += piece_end - pos,
                _ => pieces.push(Extent {
                    start_sector: pos / ss,
                    length: piece_end - pos,
                    overwritten,
                }),
            }
            pos = piece_end;
        }
        pieces
    }

    /// Sector ranges of free units, for carving.
    pub fn free_ranges(&self, sector_size: u32, total_sectors: u64) -> Vec<SectorRange> {
        if self.unit_count == 0 {
            return vec![SectorRange::new(0, total_sectors)];
        }
        let ss = sector_size as u64;
        let mut ranges = Vec::new();
        let mut run_start: Option<u64> = None;

        for unit in self.first_unit..self.first_unit + self.unit_count {
            let free = !self.is_allocated(unit);
            match (free, run_start) {
                (true, None) => run_start = Some(unit),
                (false, Some(start)) => {
                    ranges.push(self.units_to_sectors(start, unit - start, ss, total_sectors));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            let end = self.first_unit + self.unit_count;
            ranges.push(self.units_to_sectors(start, end - start, ss, total_sectors));
        }
        ranges.retain(|r| r.count > 0);
        ranges
    }

    fn units_to_sectors(&self, first: u64, count: u64, ss: u64, total: u64) -> SectorRange {
        let start = (self.unit_offset(first) / ss).min(total);
        let end = ((self.unit_offset(first) + count * self.unit_bytes) / ss).min(total);
        SectorRange::new(start, end - start)
    }
}

/// Interface implemented by every filesystem family.
pub trait MetadataParser: Send + Sync {
    fn kind(&self) -> FilesystemKind;

    /// Partition the work for `scope` into disjoint regions.
    fn regions(&self, ctx: &ScanContext, scope: ScanScope) -> Result<Vec<MetadataRegion>>;

    /// Parse one region. Fails with `MetadataCorrupt` only for that region.
    fn parse_region(
        &self,
        ctx: &ScanContext,
        region: &MetadataRegion,
        scope: ScanScope,
    ) -> Result<Vec<DiscoveredFile>>;

    /// Which allocation units live objects own.
    fn allocation(&self) -> &AllocationMap;
}

/// Identify the filesystem at the start of the volume, along with the
/// logical sector size its boot sector declares.
pub fn detect_filesystem(reader: &DiskReader) -> Result<(FilesystemKind, Option<u32>)> {
    let len = (reader.size() as usize).min(HEADER_BYTES);
    let head = reader.read_bytes(0, len)?;
    let kind = detect_from_header(&head);
    Ok((kind, declared_sector_size(&head, kind)))
}

pub fn detect_from_header(head: &[u8]) -> FilesystemKind {
    if head.len() >= 512 {
        if &head[3..11] == b"NTFS    " {
            return FilesystemKind::Ntfs;
        }
        if &head[3..11] == b"EXFAT   " {
            return FilesystemKind::ExFat;
        }
        let boot_signature = head[510] == 0x55 && head[511] == 0xAA;
        let bytes_per_sector = LittleEndian::read_u16(&head[11..13]);
        let fat16_size = LittleEndian::read_u16(&head[22..24]);
        if boot_signature
            && &head[82..90] == b"FAT32   "
            && matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096)
            && fat16_size == 0
        {
            return FilesystemKind::Fat32;
        }
    }
    if head.len() >= 1082 && LittleEndian::read_u16(&head[1080..1082]) == 0xEF53 {
        return FilesystemKind::Ext4;
    }
    if head.len() >= 1026 {
        let signature = BigEndian::read_u16(&head[1024..1026]);
        if signature == 0x482B || signature == 0x4858 {
            return FilesystemKind::HfsPlus;
        }
    }
    FilesystemKind::Unknown
}

/// Logical sector size the boot sector declares, where the format has one.
pub fn declared_sector_size(head: &[u8], kind: FilesystemKind) -> Option<u32> {
    match kind {
        FilesystemKind::Ntfs | FilesystemKind::Fat32 => le_u16(head, 11).map(u32::from),
        FilesystemKind::ExFat => head
            .get(108)
            .filter(|shift| (9..=12).contains(*shift))
            .map(|shift| 1u32 << shift),
        _ => None,
    }
}

pub(crate) fn le_u16(buf: &[u8], off: usize) -> Option<u16> {
    buf.get(off..off + 2).map(LittleEndian::read_u16)
}

pub(crate) fn le_u32(buf: &[u8], off: usize) -> Option<u32> {
    buf.get(off..off + 4).map(LittleEndian::read_u32)
}

pub(crate) fn le_u64(buf: &[u8], off: usize) -> Option<u64> {
    buf.get(off..off + 8).map(LittleEndian::read_u64)
}

pub(crate) fn be_u16(buf: &[u8], off: usize) -> Option<u16> {
    buf.get(off..off + 2).map(BigEndian::read_u16)
}

pub(crate) fn be_u32(buf: &[u8], off: usize) -> Option<u32> {
    buf.get(off..off + 4).map(BigEndian::read_u32)
}

pub(crate) fn be_u64(buf: &[u8], off: usize) -> Option<u64> {
    buf.get(off..off + 8).map(BigEndian::read_u64)
}

/// Directory names that lead towards well-known directories: the root's
/// `Users`/`home` folders and the per-user folders below them.
pub(crate) fn is_user_root(name: &str) -> bool {
    name.eq_ignore_ascii_case("Users")
        || name.eq_ignore_ascii_case("home")
        || name.eq_ignore_ascii_case("Documents and Settings")
}

/// A directory path is in quick scope when it is, or lies below, a listed
/// directory at the root or at `<user root>/<user>/`.
pub(crate) fn in_quick_scope(path: &str, config: &EngineConfig) -> bool {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    match components.as_slice() {
        [first, ..] if config.is_quick_directory(first) => true,
        [root, _user, dir, ..] => is_user_root(root) && config.is_quick_directory(dir),
        _ => false,
    }
}

/// True when the quick-scope walk may still reach a listed directory below `path`.
pub(crate) fn leads_to_quick_scope(path: &str) -> bool {
    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    match components.as_slice() {
        [] => true,
        [root] | [root, _] => is_user_root(root),
        _ => false,
    }
}

pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}
