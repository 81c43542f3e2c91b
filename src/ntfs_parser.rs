//! NTFS MFT Parser Module
//! Parses the Master File Table to find deleted file records

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Cursor, Seek, SeekFrom};
use std::sync::{Mutex, PoisonError};

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::error::{RecoveryError, Result};
use crate::filesystem::{
    in_quick_scope, join_path, le_u16, le_u32, le_u64, leads_to_quick_scope, AllocationMap, DiscoveredFile, MetadataParser,
    MetadataRegion, RegionSpec, ScanContext, ScanScope,
};
use crate::types::{EntryLocator, Extent, FilesystemKind};

// NTFS Constants
const MFT_SIGNATURE: &[u8] = b"FILE";
const BAAD_SIGNATURE: &[u8] = b"BAAD";
const ATTRIBUTE_END: u32 = 0xFFFFFFFF;

// Attribute Types
const ATTRIBUTE_STANDARD_INFORMATION: u32 = 0x10;
const ATTRIBUTE_FILE_NAME: u32 = 0x30;
const ATTRIBUTE_DATA: u32 = 0x80;
const ATTRIBUTE_INDEX_ROOT: u32 = 0x90;
const ATTRIBUTE_INDEX_ALLOCATION: u32 = 0xA0;

// Record header flags
const RECORD_IN_USE: u16 = 0x01;
const RECORD_IS_DIRECTORY: u16 = 0x02;

const MFT_RECORD: u64 = 0;
const ROOT_RECORD: u64 = 5;
const BITMAP_RECORD: u64 = 6;
const FIRST_USER_RECORD: u64 = 16;
const NAMESPACE_DOS: u8 = 2;
const MAX_PATH_DEPTH: usize = 64;
const REFERENCE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

const INDX_SIGNATURE: &[u8] = b"INDX";
const INDEX_NODE_HEADER: usize = 0x18;
const INDEX_ENTRY_LAST: u16 = 0x02;
const FILE_NAME_IS_DIRECTORY: u32 = 0x1000_0000;
const FILE_NAME_MIN: usize = 66;

#[derive(Debug, Clone)]
pub struct NtfsBootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u32,
    pub total_sectors: u64,
    pub mft_cluster: u64,
    pub mft_record_size: u32,
    pub cluster_size: u32,
}

impl NtfsBootSector {
    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / self.sectors_per_cluster as u64
    }
}

/// Parse NTFS boot sector to get MFT location
pub fn parse_boot_sector(data: &[u8]) -> Option<NtfsBootSector> {
    if data.len() < 512 || &data[3..7] != b"NTFS" {
        return None;
    }

    let mut cursor = Cursor::new(data);

    cursor.seek(SeekFrom::Start(0x0B)).ok()?;
    let bytes_per_sector = cursor.read_u16::<LittleEndian>().ok()?;

    // Values above 0x80 encode a power of two
    let raw_spc = cursor.read_u8().ok()?;
    let sectors_per_cluster = if raw_spc > 0x80 {
        1u32.checked_shl(256 - raw_spc as u32)?
    } else {
        raw_spc as u32
    };

    cursor.seek(SeekFrom::Start(0x28)).ok()?;
    let total_sectors = cursor.read_u64::<LittleEndian>().ok()?;
    let mft_cluster = cursor.read_u64::<LittleEndian>().ok()?;

    cursor.seek(SeekFrom::Start(0x40)).ok()?;
    let mft_size_raw = cursor.read_i8().ok()?;

    if bytes_per_sector == 0 || sectors_per_cluster == 0 {
        return None;
    }
    let cluster_size = (bytes_per_sector as u32).checked_mul(sectors_per_cluster)?;
    let mft_record_size = if mft_size_raw > 0 {
        (mft_size_raw as u32).checked_mul(cluster_size)?
    } else {
        1u32.checked_shl(mft_size_raw.unsigned_abs() as u32)?
    };
    if !(256..=65536).contains(&mft_record_size) {
        return None;
    }

    Some(NtfsBootSector {
        bytes_per_sector,
        sectors_per_cluster,
        total_sectors,
        mft_cluster,
        mft_record_size,
        cluster_size,
    })
}

/// One mapping pair. `lcn` is `None` for a sparse run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    pub lcn: Option<u64>,
    pub cluster_count: u64,
}

#[derive(Debug, Clone)]
pub struct MftRecord {
    pub record_number: u64,
    pub in_use: bool,
    pub is_directory: bool,
    pub file_name: Option<String>,
    pub parent_record: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Size and runs of the unnamed non-resident `$DATA` stream.
    pub data: Option<(u64, Vec<DataRun>)>,
    pub resident_data: bool,
    /// Content of the resident `$INDEX_ROOT`, directories only.
    pub index_root: Option<Vec<u8>>,
    /// Runs of `$INDEX_ALLOCATION` when the index outgrew the record.
    pub index_allocation: Option<Vec<DataRun>>,
}

#[derive(Debug)]
pub enum RecordParse {
    /// Never used or wiped: no `FILE` signature.
    Unused,
    Corrupt(String),
    Parsed(MftRecord),
}

/// Parse a single MFT record
pub fn parse_mft_record(raw: &[u8], record_number: u64, sector_stride: usize) -> RecordParse {
    if raw.len() < 48 || raw[0..4] == [0u8; 4] {
        return RecordParse::Unused;
    }
    if &raw[0..4] == BAAD_SIGNATURE {
        return RecordParse::Corrupt("record marked BAAD".into());
    }
    if &raw[0..4] != MFT_SIGNATURE {
        return RecordParse::Unused;
    }

    let mut data = raw.to_vec();
    if !apply_fixup(&mut data, sector_stride) {
        return RecordParse::Corrupt("update sequence mismatch".into());
    }

    let flags = le_u16(&data, 0x16).unwrap_or(0);
    let first_attr_offset = le_u16(&data, 0x14).unwrap_or(0) as usize;
    let used = (le_u32(&data, 0x18).unwrap_or(0) as usize).min(data.len());

    let mut record = MftRecord {
        record_number,
        in_use: flags & RECORD_IN_USE != 0,
        is_directory: flags & RECORD_IS_DIRECTORY != 0,
        file_name: None,
        parent_record: 0,
        modified: None,
        data: None,
        resident_data: false,
        index_root: None,
        index_allocation: None,
    };
    let mut fragments: Vec<(u64, u64, Vec<DataRun>)> = Vec::new();

    let mut attr_offset = first_attr_offset;
    loop {
        let attr_type = match le_u32(&data, attr_offset) {
            Some(t) if attr_offset + 4 <= used => t,
            _ => return RecordParse::Corrupt("attribute chain runs past the record".into()),
        };
        if attr_type == ATTRIBUTE_END {
            break;
        }
        let attr_length = le_u32(&data, attr_offset + 4).unwrap_or(0) as usize;
        if attr_length < 16 || attr_offset + attr_length > used {
            return RecordParse::Corrupt(format!("bad attribute length at {:#x}", attr_offset));
        }
        let attr = &data[attr_offset..attr_offset + attr_length];

        match attr_type {
            ATTRIBUTE_STANDARD_INFORMATION => {
                if let Some(modified) = parse_standard_info(attr) {
                    record.modified = Some(modified);
                }
            }
            ATTRIBUTE_FILE_NAME => {
                if let Some((name, parent)) = parse_file_name_attr(attr) {
                    let longer = record
                        .file_name
                        .as_ref()
                        .map_or(true, |current| name.len() > current.len());
                    if longer {
                        record.file_name = Some(name);
                        record.parent_record = parent;
                    }
                }
            }
            // Only the unnamed stream carries file content
            ATTRIBUTE_DATA if attr[9] == 0 => {
                if attr[8] == 0 {
                    record.resident_data = true;
                } else {
                    match parse_data_attr(attr) {
                        Some(fragment) => fragments.push(fragment),
                        None => return RecordParse::Corrupt("malformed mapping pairs".into()),
                    }
                }
            }
            ATTRIBUTE_INDEX_ROOT => {
                record.index_root = resident_content(attr).map(<[u8]>::to_vec);
            }
            ATTRIBUTE_INDEX_ALLOCATION if attr[8] != 0 => {
                record.index_allocation = parse_data_attr(attr).map(|(_, _, runs)| runs);
            }
            _ => {}
        }
        attr_offset += attr_length;
    }

    if !fragments.is_empty() {
        fragments.sort_by_key(|(vcn, _, _)| *vcn);
        let real_size = fragments[0].1;
        let runs = fragments.into_iter().flat_map(|(_, _, runs)| runs).collect();
        record.data = Some((real_size, runs));
    }
    RecordParse::Parsed(record)
}

/// Apply NTFS fixup array to correct sector boundaries. Returns false when a
/// sector tail does not carry the update sequence number (torn write).
fn apply_fixup(data: &mut [u8], stride: usize) -> bool {
    let offset = le_u16(data, 4).unwrap_or(0) as usize;
    let count = le_u16(data, 6).unwrap_or(0) as usize;
    if count == 0 || stride < 2 || offset + count * 2 > data.len() {
        return false;
    }

    let signature = [data[offset], data[offset + 1]];
    for i in 1..count {
        let sector_end = i * stride - 2;
        if sector_end + 2 > data.len() {
            return false;
        }
        if data[sector_end..sector_end + 2] != signature {
            return false;
        }
        data[sector_end] = data[offset + i * 2];
        data[sector_end + 1] = data[offset + i * 2 + 1];
    }
    true
}

/// Windows FILETIME (100ns ticks since 1601) to UTC.
fn filetime_to_datetime(ft: u64) -> Option<DateTime<Utc>> {
    if ft == 0 {
        return None;
    }
    let secs = (ft / 10_000_000) as i64 - 11_644_473_600;
    let nanos = ((ft % 10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

fn resident_content(attr: &[u8]) -> Option<&[u8]> {
    if attr[8] != 0 {
        return None;
    }
    let length = le_u32(attr, 16)? as usize;
    let offset = le_u16(attr, 20)? as usize;
    attr.get(offset..offset + length)
}

fn parse_standard_info(attr: &[u8]) -> Option<DateTime<Utc>> {
    let content = resident_content(attr)?;
    filetime_to_datetime(le_u64(content, 8)?)
}

fn parse_file_name_attr(attr: &[u8]) -> Option<(String, u64)> {
    let (name, parent, _) = parse_file_name(resident_content(attr)?)?;
    Some((name, parent))
}

/// Name, parent record and flags of a `$FILE_NAME` body. DOS names are
/// skipped; the long name of the same file carries the same data.
fn parse_file_name(content: &[u8]) -> Option<(String, u64, u32)> {
    let parent = le_u64(content, 0)? & REFERENCE_MASK;
    let flags = le_u32(content, 56)?;
    let name_length = *content.get(64)? as usize;
    let namespace = *content.get(65)?;

    if namespace == NAMESPACE_DOS || namespace > 3 || name_length == 0 {
        return None;
    }
    let units: Vec<u16> = content
        .get(FILE_NAME_MIN..FILE_NAME_MIN + name_length * 2)?
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Some((String::from_utf16_lossy(&units), parent, flags))
}

/// One child named by a directory's `$I30` index.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexEntry {
    record: u64,
    name: String,
    is_directory: bool,
    /// Left behind in the unused tail of an index node.
    stale: bool,
}

/// Decode the index entry at `pos`, returning it with its length. Entries
/// whose `$FILE_NAME` names another parent are rejected.
fn parse_index_entry(node: &[u8], pos: usize, end: usize, dir: u64) -> Option<(IndexEntry, usize)> {
    let length = le_u16(node, pos + 8)? as usize;
    let content_length = le_u16(node, pos + 10)? as usize;
    if length % 8 != 0 || pos + length > end || 16 + content_length > length {
        return None;
    }
    let record = le_u64(node, pos)? & REFERENCE_MASK;
    let content = node.get(pos + 16..pos + 16 + content_length)?;
    let (name, parent, flags) = parse_file_name(content)?;
    if record == 0 || parent != dir || name.contains(['\0', '/']) {
        return None;
    }
    let entry = IndexEntry {
        record,
        name,
        is_directory: flags & FILE_NAME_IS_DIRECTORY != 0,
        stale: false,
    };
    Some((entry, length))
}

/// Entries of one index node whose header starts at `header`. With
/// `slack`, the space between the used and allocated size is searched for
/// entries that were removed from the node.
fn index_node_entries(node: &[u8], header: usize, dir: u64, slack: bool, out: &mut Vec<IndexEntry>) {
    let (Some(first), Some(used), Some(allocated)) = (
        le_u32(node, header),
        le_u32(node, header + 4),
        le_u32(node, header + 8),
    ) else {
        return;
    };
    let allocated = (header + allocated as usize).min(node.len());
    let used = (header + used as usize).min(allocated);

    let mut pos = header + first as usize;
    while pos + 16 <= used {
        let (Some(length), Some(flags)) = (le_u16(node, pos + 8), le_u16(node, pos + 12)) else {
            break;
        };
        if flags & INDEX_ENTRY_LAST != 0 || length < 16 || length % 8 != 0 {
            break;
        }
        if let Some((entry, _)) = parse_index_entry(node, pos, used, dir) {
            out.push(entry);
        }
        pos += length as usize;
    }

    if !slack {
        return;
    }
    let mut pos = used.next_multiple_of(8);
    while pos + 16 + FILE_NAME_MIN <= allocated {
        match parse_index_entry(node, pos, allocated, dir) {
            Some((mut entry, length)) => {
                entry.stale = true;
                out.push(entry);
                pos += length;
            }
            None => pos += 8,
        }
    }
}

/// Starting VCN, real size and runs of one non-resident attribute fragment.
fn parse_data_attr(attr: &[u8]) -> Option<(u64, u64, Vec<DataRun>)> {
    let start_vcn = le_u64(attr, 16)?;
    let runs_offset = le_u16(attr, 32)? as usize;
    let real_size = le_u64(attr, 48)?;
    let runs = parse_data_runs(attr.get(runs_offset..)?)?;
    Some((start_vcn, real_size, runs))
}

/// Decode mapping pairs. `None` when a pair is truncated or its fields are
/// wider than eight bytes.
pub fn parse_data_runs(data: &[u8]) -> Option<Vec<DataRun>> {
    let mut runs = Vec::new();
    let mut offset = 0;
    let mut prev_lcn: i64 = 0;

    while offset < data.len() {
        let header = data[offset];
        if header == 0 {
            return Some(runs);
        }

        let length_size = (header & 0x0F) as usize;
        let offset_size = ((header >> 4) & 0x0F) as usize;
        if length_size == 0 || length_size > 8 || offset_size > 8 {
            return None;
        }
        let fields = data.get(offset + 1..offset + 1 + length_size + offset_size)?;

        let mut cluster_count: u64 = 0;
        for (i, byte) in fields[..length_size].iter().enumerate() {
            cluster_count |= (*byte as u64) << (i * 8);
        }

        // Offsets are signed deltas from the previous run
        let lcn = if offset_size == 0 {
            None
        } else {
            let delta_bytes = &fields[length_size..];
            let mut delta: i64 = 0;
            for (i, byte) in delta_bytes.iter().enumerate() {
                delta |= (*byte as i64) << (i * 8);
            }
            if offset_size < 8 && delta_bytes[offset_size - 1] & 0x80 != 0 {
                delta |= -1i64 << (offset_size * 8);
            }
            prev_lcn = prev_lcn.checked_add(delta)?;
            Some(u64::try_from(prev_lcn).ok()?)
        };

        runs.push(DataRun { lcn, cluster_count });
        offset += 1 + length_size + offset_size;
    }
    Some(runs)
}

pub struct NtfsParser {
    boot: NtfsBootSector,
    /// Clusters that exist on both the boot sector's and the reader's view.
    total_clusters: u64,
    /// Byte segments holding the MFT, in VCN order.
    mft_segments: Vec<(u64, u64)>,
    record_count: u64,
    allocation: AllocationMap,
    directory_names: Mutex<HashMap<u64, Option<(String, u64)>>>,
}

impl NtfsParser {
    pub fn open(ctx: &ScanContext) -> Result<Self> {
        let boot = parse_boot_sector(&ctx.read_bytes(0, 512)?)
            .ok_or_else(|| RecoveryError::corrupt("NTFS boot sector", "unparsable boot sector"))?;
        if boot.cluster_size as u64 % ctx.sector_size() as u64 != 0 {
            return Err(RecoveryError::corrupt(
                "NTFS boot sector",
                "cluster size is not a multiple of the sector size",
            ));
        }

        let record_size = boot.mft_record_size as u64;
        let mft_offset = boot
            .mft_cluster
            .checked_mul(boot.cluster_size as u64)
            .ok_or_else(|| RecoveryError::corrupt("NTFS boot sector", "$MFT cluster out of range"))?;
        let first = ctx.read_bytes(mft_offset, record_size as usize)?;
        let mft = match parse_mft_record(&first, MFT_RECORD, boot.bytes_per_sector as usize) {
            RecordParse::Parsed(record) => record,
            _ => return Err(RecoveryError::corrupt("$MFT record", "unreadable $MFT record")),
        };
        let (mft_size, mft_runs) = mft
            .data
            .ok_or_else(|| RecoveryError::corrupt("$MFT record", "no $DATA runs"))?;

        let total_clusters = boot
            .total_clusters()
            .min(ctx.volume_bytes() / boot.cluster_size as u64);
        let mft_segments = Self::segments(&boot, total_clusters, &mft_runs)
            .ok_or_else(|| RecoveryError::corrupt("$MFT record", "sparse or out-of-volume run"))?;
        let mft_bytes: u64 = mft_segments.iter().map(|(_, len)| *len).sum();

        let mut parser = NtfsParser {
            mft_segments,
            record_count: mft_size.min(mft_bytes) / record_size,
            total_clusters,
            allocation: AllocationMap::unmapped(),
            directory_names: Mutex::new(HashMap::new()),
            boot,
        };
        parser.allocation = parser.read_bitmap(ctx)?;
        info!(
            "NTFS: {} MFT records of {} bytes, cluster {} bytes",
            parser.record_count, record_size, parser.boot.cluster_size
        );
        Ok(parser)
    }

    /// Byte segments of a run list. `None` for sparse runs and for runs
    /// that overflow or leave the volume.
    fn segments(boot: &NtfsBootSector, total_clusters: u64, runs: &[DataRun]) -> Option<Vec<(u64, u64)>> {
        let cluster = boot.cluster_size as u64;
        runs.iter()
            .map(|run| {
                let lcn = run.lcn?;
                let end = lcn.checked_add(run.cluster_count)?;
                (end <= total_clusters).then_some((lcn * cluster, run.cluster_count * cluster))
            })
            .collect()
    }

    /// Whether every allocated run of the record lies inside the volume.
    fn runs_in_volume(&self, record: &MftRecord) -> bool {
        let Some((_, runs)) = &record.data else {
            return true;
        };
        runs.iter().all(|run| match run.lcn {
            Some(lcn) => lcn
                .checked_add(run.cluster_count)
                .is_some_and(|end| end <= self.total_clusters),
            None => run.cluster_count.checked_mul(self.boot.cluster_size as u64).is_some(),
        })
    }

    /// Read `len` bytes at logical offset `pos` of a stream laid out in `segments`.
    fn read_stream(
        ctx: &ScanContext,
        segments: &[(u64, u64)],
        mut pos: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        for &(start, seg_len) in segments {
            if out.len() == len {
                break;
            }
            if pos >= seg_len {
                pos -= seg_len;
                continue;
            }
            let take = ((seg_len - pos) as usize).min(len - out.len());
            out.extend(ctx.read_bytes(start + pos, take)?);
            pos = 0;
        }
        if out.len() < len {
            return Err(RecoveryError::corrupt("MFT", "stream shorter than requested"));
        }
        Ok(out)
    }

    fn read_record(&self, ctx: &ScanContext, number: u64) -> Result<RecordParse> {
        if number >= self.record_count {
            return Err(RecoveryError::corrupt(
                format!("record {}", number),
                "reference past the end of the MFT",
            ));
        }
        let size = self.boot.mft_record_size as u64;
        let raw = Self::read_stream(ctx, &self.mft_segments, number * size, size as usize)?;
        Ok(parse_mft_record(&raw, number, self.boot.bytes_per_sector as usize))
    }

    fn read_bitmap(&self, ctx: &ScanContext) -> Result<AllocationMap> {
        let record = match self.read_record(ctx, BITMAP_RECORD)? {
            RecordParse::Parsed(record) => record,
            _ => return Err(RecoveryError::corrupt("$Bitmap record", "unreadable record")),
        };
        let (size, runs) = record
            .data
            .ok_or_else(|| RecoveryError::corrupt("$Bitmap record", "no $DATA runs"))?;
        let segments = Self::segments(&self.boot, self.total_clusters, &runs)
            .ok_or_else(|| RecoveryError::corrupt("$Bitmap record", "sparse or out-of-volume run"))?;

        let total = self.total_clusters;
        let bits = Self::read_stream(ctx, &segments, 0, size.min(total.div_ceil(8)) as usize)?;
        let mut allocation = AllocationMap::bounded(
            0,
            0,
            self.boot.cluster_size as u64,
            total,
            ctx.volume_bytes(),
        );
        for (index, byte) in bits.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    allocation.mark(index as u64 * 8 + bit);
                }
            }
        }
        Ok(allocation)
    }

    /// Turn the runs of a deleted record into extents trimmed to `size`.
    /// Records with holes before the end of the data are not recoverable
    /// as a byte stream and are skipped.
    fn record_extents(&self, size: u64, runs: &[DataRun], sector_size: u32) -> Option<Vec<Extent>> {
        let cluster = self.boot.cluster_size as u64;
        let mut remaining = size;
        let mut extents = Vec::new();
        for run in runs {
            if remaining == 0 {
                break;
            }
            let lcn = run.lcn?;
            let end = lcn.checked_add(run.cluster_count)?;
            if run.cluster_count == 0 || end > self.total_clusters {
                return None;
            }
            let length = (run.cluster_count * cluster).min(remaining);
            let extent = Extent::new(lcn * cluster / sector_size as u64, length);
            extents.extend(self.allocation.split_extent(extent, sector_size));
            remaining -= length;
        }
        (remaining == 0).then_some(extents)
    }

    fn directory_entry(&self, ctx: &ScanContext, record: u64) -> Option<(String, u64)> {
        let cached = self
            .directory_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&record)
            .cloned();
        if let Some(entry) = cached {
            return entry;
        }
        let entry = match self.read_record(ctx, record) {
            Ok(RecordParse::Parsed(parsed)) if parsed.is_directory => {
                parsed.file_name.map(|name| (name, parsed.parent_record))
            }
            _ => None,
        };
        self.directory_names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record, entry.clone());
        entry
    }

    /// Resolve a directory record to an absolute path through parent references.
    fn directory_path(&self, ctx: &ScanContext, record: u64) -> Option<String> {
        let mut components = Vec::new();
        let mut current = record;
        for _ in 0..MAX_PATH_DEPTH {
            if current == ROOT_RECORD {
                components.reverse();
                return Some(format!("/{}", components.join("/")));
            }
            let (name, parent) = self.directory_entry(ctx, current)?;
            components.push(name);
            current = parent;
        }
        None
    }

    /// Children listed by the `$I30` index of directory record `dir`,
    /// including entries lingering in the slack of its index blocks.
    fn directory_index(&self, ctx: &ScanContext, dir: u64) -> Result<Vec<IndexEntry>> {
        let label = format!("directory record {}", dir);
        let record = match self.read_record(ctx, dir)? {
            RecordParse::Parsed(record) if record.is_directory => record,
            _ => return Err(RecoveryError::corrupt(label, "not a readable directory")),
        };
        let root = record
            .index_root
            .ok_or_else(|| RecoveryError::corrupt(label.as_str(), "no $INDEX_ROOT"))?;
        let mut entries = Vec::new();
        index_node_entries(&root, 16, dir, false, &mut entries);

        let Some(runs) = record.index_allocation else {
            return Ok(entries);
        };
        let block_size = le_u32(&root, 8).unwrap_or(0) as usize;
        if !(512..=65536).contains(&block_size) || !block_size.is_power_of_two() {
            return Err(RecoveryError::corrupt(label, "bad index block size"));
        }
        let segments = Self::segments(&self.boot, self.total_clusters, &runs)
            .ok_or_else(|| RecoveryError::corrupt(label.as_str(), "sparse or out-of-volume index"))?;
        let stream: u64 = segments.iter().map(|(_, len)| *len).sum();
        let mut pos = 0u64;
        while pos + block_size as u64 <= stream {
            let mut block = Self::read_stream(ctx, &segments, pos, block_size)?;
            pos += block_size as u64;
            if &block[0..4] != INDX_SIGNATURE
                || !apply_fixup(&mut block, self.boot.bytes_per_sector as usize)
            {
                debug!("NTFS: {} has an unreadable index block at {}", label, pos - block_size as u64);
                continue;
            }
            index_node_entries(&block, INDEX_NODE_HEADER, dir, true, &mut entries);
        }
        Ok(entries)
    }

    /// Records named by the indexes of the well-known folders and their
    /// subfolders, live or stale. `None` when the root index is unusable.
    fn quick_records(&self, ctx: &ScanContext) -> Option<BTreeSet<u64>> {
        let mut wanted = BTreeSet::new();
        let mut visited = HashSet::new();
        let mut pending = vec![(ROOT_RECORD, "/".to_string(), 0usize)];
        while let Some((dir, path, depth)) = pending.pop() {
            if depth > MAX_PATH_DEPTH || !visited.insert(dir) {
                continue;
            }
            let entries = match self.directory_index(ctx, dir) {
                Ok(entries) => entries,
                Err(e) if dir == ROOT_RECORD => {
                    warn!("NTFS: {}", e);
                    return None;
                }
                Err(e) => {
                    debug!("NTFS: skipping {}: {}", path, e);
                    continue;
                }
            };
            let inside = in_quick_scope(&path, ctx.config);
            for entry in entries {
                let child = join_path(&path, &entry.name);
                if entry.is_directory && !entry.stale {
                    if inside || leads_to_quick_scope(&child) || in_quick_scope(&child, ctx.config) {
                        pending.push((entry.record, child, depth + 1));
                    }
                } else if inside {
                    wanted.insert(entry.record);
                }
            }
        }
        Some(wanted)
    }

    fn candidate(&self, ctx: &ScanContext, record: MftRecord) -> Option<DiscoveredFile> {
        if record.in_use || record.is_directory || record.record_number < FIRST_USER_RECORD {
            return None;
        }
        let name = record.file_name.filter(|n| !n.is_empty() && !n.starts_with('$'))?;
        let (size, runs) = record.data?;
        if size == 0 || runs.is_empty() {
            return None;
        }
        let extents = self.record_extents(size, &runs, ctx.sector_size())?;
        debug!("NTFS: deleted record {} {} ({} bytes)", record.record_number, name, size);
        Some(DiscoveredFile {
            locator: EntryLocator::MftRecord(record.record_number),
            path: self.directory_path(ctx, record.parent_record),
            name: Some(name),
            size,
            extents,
            modified: record.modified,
            layout_verified: true,
        })
    }
}

impl MetadataParser for NtfsParser {
    fn kind(&self) -> FilesystemKind {
        FilesystemKind::Ntfs
    }

    fn regions(&self, ctx: &ScanContext, scope: ScanScope) -> Result<Vec<MetadataRegion>> {
        let per_region = ctx.config.records_per_region;
        if scope == ScanScope::WellKnown {
            match self.quick_records(ctx) {
                Some(records) => {
                    let records = records
                        .into_iter()
                        .filter(|n| (FIRST_USER_RECORD..self.record_count).contains(n));
                    let regions = MetadataRegion::record_runs(records, per_region);
                    debug!("NTFS: quick scan reads {} record regions", regions.len());
                    return Ok(regions);
                }
                None => warn!("NTFS: root index unusable, quick scan reads the whole MFT"),
            }
        }
        let mut regions = Vec::new();
        let mut first = FIRST_USER_RECORD.min(self.record_count);
        while first < self.record_count {
            let count = per_region.min(self.record_count - first);
            regions.push(MetadataRegion::records(first, count));
            first += count;
        }
        Ok(regions)
    }

    fn parse_region(
        &self,
        ctx: &ScanContext,
        region: &MetadataRegion,
        scope: ScanScope,
    ) -> Result<Vec<DiscoveredFile>> {
        let (first, count) = match region.spec {
            RegionSpec::Records { first, count } => (first, count),
            RegionSpec::Directory { .. } => {
                return Err(RecoveryError::corrupt(region.label(), "not a record region"))
            }
        };

        let mut found = Vec::new();
        let (mut parsed, mut corrupt) = (0u64, 0u64);
        for number in first..first + count {
            if ctx.is_cancelled() {
                break;
            }
            let record = match self.read_record(ctx, number)? {
                RecordParse::Unused => continue,
                RecordParse::Corrupt(reason) => {
                    debug!("NTFS: record {} damaged: {}", number, reason);
                    corrupt += 1;
                    continue;
                }
                RecordParse::Parsed(record) if !self.runs_in_volume(&record) => {
                    debug!("NTFS: record {} has runs outside the volume", number);
                    corrupt += 1;
                    continue;
                }
                RecordParse::Parsed(record) => record,
            };
            parsed += 1;
            if let Some(file) = self.candidate(ctx, record) {
                let keep = scope == ScanScope::Full
                    || file.path.as_deref().is_some_and(|p| in_quick_scope(p, ctx.config));
                if keep {
                    found.push(file);
                }
            }
        }

        if corrupt > 0 && corrupt >= parsed {
            warn!("NTFS: {} of {} records damaged in {}", corrupt, corrupt + parsed, region.label());
            return Err(RecoveryError::corrupt(
                region.label(),
                format!("{} damaged records, {} intact", corrupt, parsed),
            ));
        }
        Ok(found)
    }

    fn allocation(&self) -> &AllocationMap {
        &self.allocation
    }
}
