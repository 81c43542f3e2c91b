//! FAT32 Directory Parser Module
//! Walks directory clusters for deleted slots and rebuilds their cluster chains

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, info, warn};

use crate::error::{RecoveryError, Result};
use crate::filesystem::{
    in_quick_scope, join_path, le_u16, le_u32, AllocationMap, DiscoveredFile, MetadataParser,
    MetadataRegion, RegionSpec, ScanContext, ScanScope,
};
use crate::types::{EntryLocator, Extent, FilesystemKind};

const DIR_ENTRY_SIZE: usize = 32;
const DELETED_MARKER: u8 = 0xE5;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;
const MAX_DIR_DEPTH: usize = 32;
const MAX_DELETED_DIR_CLUSTERS: u64 = 256;

/// Cluster arithmetic shared by FAT32 and exFAT.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClusterGeometry {
    pub cluster_bytes: u64,
    /// Byte offset of cluster 2.
    pub heap_offset: u64,
    pub cluster_count: u64,
}

impl ClusterGeometry {
    pub fn is_valid(&self, cluster: u64) -> bool {
        cluster >= 2 && cluster < self.cluster_count + 2
    }

    pub fn offset(&self, cluster: u64) -> u64 {
        self.heap_offset + (cluster - 2) * self.cluster_bytes
    }

    pub fn allocation_map(&self) -> AllocationMap {
        AllocationMap::new(2, self.heap_offset, self.cluster_bytes, self.cluster_count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FatLink {
    Free,
    Next(u64),
    End,
    Bad,
}

/// An in-memory copy of the first allocation table.
pub(crate) struct FatTable {
    entries: Vec<u32>,
    mask: u32,
}

impl FatTable {
    pub fn fat32(raw: &[u8]) -> Self {
        Self::from_bytes(raw, 0x0FFF_FFFF)
    }

    pub fn exfat(raw: &[u8]) -> Self {
        Self::from_bytes(raw, 0xFFFF_FFFF)
    }

    fn from_bytes(raw: &[u8], mask: u32) -> Self {
        let entries = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) & mask)
            .collect();
        FatTable { entries, mask }
    }

    pub fn link(&self, cluster: u64) -> FatLink {
        let value = match self.entries.get(cluster as usize) {
            Some(v) => *v,
            None => return FatLink::Bad,
        };
        let bad = self.mask - 8;
        match value {
            0 => FatLink::Free,
            v if v == bad => FatLink::Bad,
            v if v > bad => FatLink::End,
            1 => FatLink::Bad,
            v => FatLink::Next(v as u64),
        }
    }

    /// Follow a live chain to its end marker. Broken links are corruption.
    pub fn live_chain(&self, geometry: &ClusterGeometry, first: u64) -> Result<Vec<u64>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cluster = first;
        loop {
            if !geometry.is_valid(cluster) || !seen.insert(cluster) {
                return Err(RecoveryError::corrupt(
                    format!("cluster chain from {}", first),
                    format!("invalid or looping cluster {}", cluster),
                ));
            }
            chain.push(cluster);
            match self.link(cluster) {
                FatLink::Next(next) => cluster = next,
                FatLink::End => return Ok(chain),
                FatLink::Free | FatLink::Bad => {
                    return Err(RecoveryError::corrupt(
                        format!("cluster chain from {}", first),
                        format!("chain broken at cluster {}", cluster),
                    ))
                }
            }
        }
    }

    /// The stale chain of a deleted file, if the table still holds exactly
    /// `needed` clusters from `first` and none of them is live.
    pub fn stale_chain(
        &self,
        geometry: &ClusterGeometry,
        allocation: &AllocationMap,
        first: u64,
        needed: u64,
    ) -> Option<Vec<u64>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cluster = first;
        loop {
            if !geometry.is_valid(cluster) || allocation.is_allocated(cluster) {
                return None;
            }
            if !seen.insert(cluster) {
                return None;
            }
            chain.push(cluster);
            match self.link(cluster) {
                FatLink::End if chain.len() as u64 == needed => return Some(chain),
                FatLink::Next(next) if (chain.len() as u64) < needed => cluster = next,
                _ => return None,
            }
        }
    }
}

/// Cluster list for a deleted file: the stale chain when the table still has
/// it, otherwise the contiguous run from the first cluster.
pub(crate) fn deleted_file_clusters(
    geometry: &ClusterGeometry,
    fat: &FatTable,
    allocation: &AllocationMap,
    first: u64,
    size: u64,
) -> Option<(Vec<u64>, bool)> {
    let needed = size.div_ceil(geometry.cluster_bytes);
    if needed == 0 || !geometry.is_valid(first) {
        return None;
    }
    if let Some(chain) = fat.stale_chain(geometry, allocation, first, needed) {
        return Some((chain, true));
    }
    contiguous_clusters(geometry, first, needed).map(|run| (run, false))
}

pub(crate) fn contiguous_clusters(
    geometry: &ClusterGeometry,
    first: u64,
    count: u64,
) -> Option<Vec<u64>> {
    if count == 0 || !geometry.is_valid(first) || !geometry.is_valid(first + count - 1) {
        return None;
    }
    Some((first..first + count).collect())
}

/// One extent per cluster, the last trimmed to the file size.
pub(crate) fn cluster_extents(
    geometry: &ClusterGeometry,
    allocation: &AllocationMap,
    clusters: &[u64],
    size: u64,
    sector_size: u32,
) -> Vec<Extent> {
    let mut remaining = size;
    let mut extents = Vec::with_capacity(clusters.len());
    for &cluster in clusters {
        if remaining == 0 {
            break;
        }
        let length = remaining.min(geometry.cluster_bytes);
        extents.push(Extent {
            start_sector: geometry.offset(cluster) / sector_size as u64,
            length,
            overwritten: allocation.is_allocated(cluster),
        });
        remaining -= length;
    }
    extents
}

/// Read the listed clusters back to back.
pub(crate) fn read_clusters(
    ctx: &ScanContext,
    geometry: &ClusterGeometry,
    clusters: &[u64],
) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(clusters.len() * geometry.cluster_bytes as usize);
    for &cluster in clusters {
        data.extend(ctx.read_bytes(geometry.offset(cluster), geometry.cluster_bytes as usize)?);
    }
    Ok(data)
}

/// Byte offset on the volume of `offset` within a directory read cluster by cluster.
pub(crate) fn slot_offset(geometry: &ClusterGeometry, clusters: &[u64], offset: usize) -> u64 {
    let index = offset as u64 / geometry.cluster_bytes;
    let within = offset as u64 % geometry.cluster_bytes;
    clusters
        .get(index as usize)
        .map(|c| geometry.offset(*c) + within)
        .unwrap_or(0)
}

/// Convert packed DOS date and time words.
pub(crate) fn dos_datetime(date: u16, time: u16) -> Option<DateTime<Utc>> {
    let year = 1980 + (date >> 9) as i32;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;
    let hour = (time >> 11) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = ((time & 0x1F) * 2) as u32;
    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)
        .map(|naive| naive.and_utc())
}

/// A parsed short directory entry with any long name that preceded it.
#[derive(Debug, Clone)]
struct DirEntry {
    offset: usize,
    name: String,
    deleted: bool,
    is_dir: bool,
    first_cluster: u64,
    size: u64,
    modified: Option<DateTime<Utc>>,
}

fn parse_directory(buf: &[u8]) -> Vec<DirEntry> {
    let mut entries = Vec::new();
    let mut long_name: Vec<[u16; 13]> = Vec::new();

    for (index, slot) in buf.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
        let marker = slot[0];
        if marker == 0x00 {
            break;
        }
        let attr = slot[11];
        if attr == ATTR_LONG_NAME {
            long_name.push(long_name_chars(slot));
            continue;
        }
        let parts = std::mem::take(&mut long_name);
        if attr & ATTR_VOLUME_ID != 0 || marker == b'.' {
            continue;
        }

        let deleted = marker == DELETED_MARKER;
        let name = if parts.is_empty() {
            short_name(slot, deleted)
        } else {
            assemble_long_name(&parts)
        };
        let hi = le_u16(slot, 20).unwrap_or(0) as u64;
        let lo = le_u16(slot, 26).unwrap_or(0) as u64;
        entries.push(DirEntry {
            offset: index * DIR_ENTRY_SIZE,
            name,
            deleted,
            is_dir: attr & ATTR_DIRECTORY != 0,
            first_cluster: (hi << 16) | lo,
            size: le_u32(slot, 28).unwrap_or(0) as u64,
            modified: dos_datetime(le_u16(slot, 24).unwrap_or(0), le_u16(slot, 22).unwrap_or(0)),
        });
    }
    entries
}

fn long_name_chars(slot: &[u8]) -> [u16; 13] {
    let mut chars = [0u16; 13];
    let offsets = (1..11).step_by(2).chain((14..26).step_by(2)).chain((28..32).step_by(2));
    for (i, off) in offsets.enumerate() {
        chars[i] = u16::from_le_bytes([slot[off], slot[off + 1]]);
    }
    chars
}

/// Long-name slots are stored last part first.
fn assemble_long_name(parts: &[[u16; 13]]) -> String {
    let units: Vec<u16> = parts
        .iter()
        .rev()
        .flat_map(|p| p.iter().copied())
        .take_while(|c| *c != 0x0000 && *c != 0xFFFF)
        .collect();
    String::from_utf16_lossy(&units)
}

fn short_name(slot: &[u8], deleted: bool) -> String {
    let mut base: Vec<u8> = slot[0..8].to_vec();
    if deleted {
        base[0] = b'_';
    } else if base[0] == 0x05 {
        base[0] = DELETED_MARKER;
    }
    let base = String::from_utf8_lossy(&base).trim_end().to_string();
    let ext = String::from_utf8_lossy(&slot[8..11]).trim_end().to_string();
    if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}

#[derive(Debug, Clone)]
struct LiveDirectory {
    cluster: u64,
    path: String,
}

pub struct FatParser {
    geometry: ClusterGeometry,
    fat: FatTable,
    allocation: AllocationMap,
    root_cluster: u64,
    directories: Vec<LiveDirectory>,
}

impl FatParser {
    pub fn open(ctx: &ScanContext) -> Result<Self> {
        let boot = ctx.read_bytes(0, 512)?;
        let corrupt = |reason: &str| RecoveryError::corrupt("FAT32 boot sector", reason);

        let bytes_per_sector = le_u16(&boot, 11).unwrap_or(0) as u64;
        let sectors_per_cluster = boot[13] as u64;
        let reserved = le_u16(&boot, 14).unwrap_or(0) as u64;
        let fat_count = boot[16] as u64;
        let total_sectors = le_u32(&boot, 32).unwrap_or(0) as u64;
        let fat_sectors = le_u32(&boot, 36).unwrap_or(0) as u64;
        let root_cluster = le_u32(&boot, 44).unwrap_or(0) as u64;

        if bytes_per_sector == 0 || sectors_per_cluster == 0 || fat_count == 0 || fat_sectors == 0
        {
            return Err(corrupt("zero geometry field"));
        }
        let heap_sector = reserved + fat_count * fat_sectors;
        if total_sectors <= heap_sector {
            return Err(corrupt("data area starts past the volume end"));
        }
        let geometry = ClusterGeometry {
            cluster_bytes: bytes_per_sector * sectors_per_cluster,
            heap_offset: heap_sector * bytes_per_sector,
            cluster_count: (total_sectors - heap_sector) / sectors_per_cluster,
        };
        if geometry.cluster_bytes % ctx.sector_size() as u64 != 0 {
            return Err(corrupt("cluster size is not a multiple of the sector size"));
        }
        if !geometry.is_valid(root_cluster) {
            return Err(corrupt("root cluster outside the data area"));
        }

        let fat_bytes = (fat_sectors * bytes_per_sector)
            .min((geometry.cluster_count + 2) * 4) as usize;
        let fat = FatTable::fat32(&ctx.read_bytes(reserved * bytes_per_sector, fat_bytes)?);

        let mut parser = FatParser {
            geometry,
            fat,
            allocation: geometry.allocation_map(),
            root_cluster,
            directories: Vec::new(),
        };
        parser.walk_live_tree(ctx);
        info!(
            "FAT32: {} clusters of {} bytes, {} live directories",
            geometry.cluster_count,
            geometry.cluster_bytes,
            parser.directories.len()
        );
        Ok(parser)
    }

    /// Mark every cluster owned by a live file or directory and remember the
    /// live directories for region planning.
    fn walk_live_tree(&mut self, ctx: &ScanContext) {
        for cluster in 0..self.geometry.cluster_count + 2 {
            if self.fat.link(cluster) == FatLink::Bad {
                self.allocation.mark(cluster);
            }
        }

        let mut queue = VecDeque::from([(self.root_cluster, "/".to_string(), 0usize)]);
        let mut visited = HashSet::new();

        while let Some((cluster, path, depth)) = queue.pop_front() {
            if ctx.is_cancelled() || !visited.insert(cluster) {
                continue;
            }
            self.directories.push(LiveDirectory {
                cluster,
                path: path.clone(),
            });
            let chain = match self.fat.live_chain(&self.geometry, cluster) {
                Ok(chain) => chain,
                Err(e) => {
                    warn!("FAT32 directory {} unreadable: {}", path, e);
                    continue;
                }
            };
            for &c in &chain {
                self.allocation.mark(c);
            }
            let data = match read_clusters(ctx, &self.geometry, &chain) {
                Ok(data) => data,
                Err(e) => {
                    warn!("FAT32 directory {} unreadable: {}", path, e);
                    continue;
                }
            };
            for entry in parse_directory(&data).into_iter().filter(|e| !e.deleted) {
                if !self.geometry.is_valid(entry.first_cluster) {
                    continue;
                }
                if entry.is_dir {
                    if depth < MAX_DIR_DEPTH {
                        queue.push_back((entry.first_cluster, join_path(&path, &entry.name), depth + 1));
                    }
                } else if let Ok(file_chain) = self.fat.live_chain(&self.geometry, entry.first_cluster) {
                    for c in file_chain {
                        self.allocation.mark(c);
                    }
                }
            }
        }
    }

    fn scan_directory(
        &self,
        ctx: &ScanContext,
        clusters: &[u64],
        path: &str,
        depth: usize,
        visited: &mut HashSet<u64>,
        found: &mut Vec<DiscoveredFile>,
    ) -> Result<()> {
        let data = read_clusters(ctx, &self.geometry, clusters)?;
        for entry in parse_directory(&data) {
            if ctx.is_cancelled() {
                break;
            }
            if !entry.deleted || entry.first_cluster == 0 {
                continue;
            }
            if entry.is_dir {
                if depth < MAX_DIR_DEPTH && visited.insert(entry.first_cluster) {
                    if let Some(sub) = self.deleted_directory_clusters(ctx, entry.first_cluster) {
                        let sub_path = join_path(path, &entry.name);
                        debug!("FAT32: descending into deleted directory {}", sub_path);
                        self.scan_directory(ctx, &sub, &sub_path, depth + 1, visited, found)?;
                    }
                }
                continue;
            }
            if entry.size == 0 {
                continue;
            }
            let layout = deleted_file_clusters(
                &self.geometry,
                &self.fat,
                &self.allocation,
                entry.first_cluster,
                entry.size,
            );
            let (chain, verified) = match layout {
                Some(layout) => layout,
                None => continue,
            };
            let extents = cluster_extents(
                &self.geometry,
                &self.allocation,
                &chain,
                entry.size,
                ctx.sector_size(),
            );
            debug!("FAT32: deleted {} ({} bytes, {} clusters)", entry.name, entry.size, chain.len());
            found.push(DiscoveredFile {
                locator: EntryLocator::DirectorySlot(slot_offset(&self.geometry, clusters, entry.offset)),
                name: Some(entry.name),
                path: Some(path.to_string()),
                size: entry.size,
                extents,
                modified: entry.modified,
                layout_verified: verified,
            });
        }
        Ok(())
    }

    /// Clusters of a deleted directory, if its first cluster still holds a
    /// directory (leading `.` entry).
    fn deleted_directory_clusters(&self, ctx: &ScanContext, first: u64) -> Option<Vec<u64>> {
        if !self.geometry.is_valid(first) || self.allocation.is_allocated(first) {
            return None;
        }
        let head = ctx.read_bytes(self.geometry.offset(first), DIR_ENTRY_SIZE).ok()?;
        if head[0] != b'.' || head[11] & ATTR_DIRECTORY == 0 {
            return None;
        }
        let mut clusters = vec![first];
        let mut cluster = first;
        while let FatLink::Next(next) = self.fat.link(cluster) {
            if clusters.len() as u64 >= MAX_DELETED_DIR_CLUSTERS
                || !self.geometry.is_valid(next)
                || self.allocation.is_allocated(next)
                || clusters.contains(&next)
            {
                break;
            }
            clusters.push(next);
            cluster = next;
        }
        Some(clusters)
    }
}

impl MetadataParser for FatParser {
    fn kind(&self) -> FilesystemKind {
        FilesystemKind::Fat32
    }

    fn regions(&self, ctx: &ScanContext, scope: ScanScope) -> Result<Vec<MetadataRegion>> {
        Ok(self
            .directories
            .iter()
            .filter(|d| scope == ScanScope::Full || in_quick_scope(&d.path, ctx.config))
            .map(|d| MetadataRegion::directory(d.cluster, d.path.clone(), false))
            .collect())
    }

    fn parse_region(
        &self,
        ctx: &ScanContext,
        region: &MetadataRegion,
        _scope: ScanScope,
    ) -> Result<Vec<DiscoveredFile>> {
        let (cluster, path) = match &region.spec {
            RegionSpec::Directory { locator, path, .. } => (*locator, path.as_str()),
            RegionSpec::Records { .. } => {
                return Err(RecoveryError::corrupt(region.label(), "not a directory region"))
            }
        };
        let chain = self
            .fat
            .live_chain(&self.geometry, cluster)
            .map_err(|e| RecoveryError::corrupt(region.label(), e.to_string()))?;

        let mut found = Vec::new();
        let mut visited = HashSet::new();
        self.scan_directory(ctx, &chain, path, 0, &mut visited, &mut found)?;
        Ok(found)
    }

    fn allocation(&self) -> &AllocationMap {
        &self.allocation
    }
}
