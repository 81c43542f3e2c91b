//! exFAT Entry-Set Parser Module
//! Finds deleted file entry sets and maps their clusters through the allocation bitmap

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::error::{RecoveryError, Result};
use crate::fat_parser::{
    cluster_extents, contiguous_clusters, deleted_file_clusters, dos_datetime, read_clusters,
    slot_offset, ClusterGeometry, FatLink, FatTable,
};
use crate::filesystem::{
    in_quick_scope, join_path, le_u16, le_u32, le_u64, AllocationMap, DiscoveredFile,
    MetadataParser, MetadataRegion, RegionSpec, ScanContext, ScanScope,
};
use crate::types::{EntryLocator, FilesystemKind};

const ENTRY_SIZE: usize = 32;
const TYPE_IN_USE: u8 = 0x80;
const TYPE_FILE: u8 = 0x05;
const TYPE_STREAM: u8 = 0x40;
const TYPE_NAME: u8 = 0x41;
const TYPE_BITMAP: u8 = 0x81;
const FLAG_NO_FAT_CHAIN: u8 = 0x02;
const ATTR_DIRECTORY: u16 = 0x10;
const MAX_DIR_DEPTH: usize = 32;

#[derive(Debug, Clone)]
struct EntrySet {
    offset: usize,
    in_use: bool,
    is_dir: bool,
    name: String,
    first_cluster: u64,
    data_length: u64,
    contiguous: bool,
    modified: Option<DateTime<Utc>>,
}

fn parse_entry_sets(buf: &[u8]) -> Vec<EntrySet> {
    let slots: Vec<&[u8]> = buf.chunks_exact(ENTRY_SIZE).collect();
    let mut sets = Vec::new();
    let mut i = 0;

    while i < slots.len() {
        let entry_type = slots[i][0];
        if entry_type == 0x00 {
            break;
        }
        if entry_type & 0x7F != TYPE_FILE {
            i += 1;
            continue;
        }
        let secondary = slots[i][1] as usize;
        match parse_set(&slots, i, secondary) {
            Some(set) => {
                sets.push(set);
                i += 1 + secondary;
            }
            None => i += 1,
        }
    }
    sets
}

fn parse_set(slots: &[&[u8]], index: usize, secondary: usize) -> Option<EntrySet> {
    if secondary < 2 || index + secondary >= slots.len() {
        return None;
    }
    let file = slots[index];
    let in_use = file[0] & TYPE_IN_USE != 0;
    let stream = slots[index + 1];
    if stream[0] & 0x7F != TYPE_STREAM {
        return None;
    }

    let mut units: Vec<u16> = Vec::new();
    for slot in &slots[index + 2..=index + secondary] {
        if slot[0] & 0x7F != TYPE_NAME {
            return None;
        }
        // A deleted set whose secondaries were reused is not a set anymore.
        if (slot[0] & TYPE_IN_USE != 0) != in_use {
            return None;
        }
        units.extend(slot[2..32].chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])));
    }
    if (stream[0] & TYPE_IN_USE != 0) != in_use {
        return None;
    }
    let name_length = stream[3] as usize;
    units.truncate(name_length);

    let timestamp = le_u32(file, 12).unwrap_or(0);
    Some(EntrySet {
        offset: index * ENTRY_SIZE,
        in_use,
        is_dir: le_u16(file, 4).unwrap_or(0) & ATTR_DIRECTORY != 0,
        name: String::from_utf16_lossy(&units),
        first_cluster: le_u32(stream, 20).unwrap_or(0) as u64,
        data_length: le_u64(stream, 24).unwrap_or(0),
        contiguous: stream[1] & FLAG_NO_FAT_CHAIN != 0,
        modified: dos_datetime((timestamp >> 16) as u16, timestamp as u16),
    })
}

#[derive(Debug, Clone)]
struct ExfatDirectory {
    first_cluster: u64,
    clusters: Vec<u64>,
    path: String,
}

pub struct ExfatParser {
    geometry: ClusterGeometry,
    fat: FatTable,
    allocation: AllocationMap,
    directories: Vec<ExfatDirectory>,
}

impl ExfatParser {
    pub fn open(ctx: &ScanContext) -> Result<Self> {
        let boot = ctx.read_bytes(0, 512)?;
        let corrupt = |reason: &str| RecoveryError::corrupt("exFAT boot sector", reason);

        let fat_offset = le_u32(&boot, 80).unwrap_or(0) as u64;
        let fat_length = le_u32(&boot, 84).unwrap_or(0) as u64;
        let heap_sector = le_u32(&boot, 88).unwrap_or(0) as u64;
        let cluster_count = le_u32(&boot, 92).unwrap_or(0) as u64;
        let root_cluster = le_u32(&boot, 96).unwrap_or(0) as u64;
        let sector_shift = boot[108] as u32;
        let cluster_shift = boot[109] as u32;

        if !(9..=12).contains(&sector_shift) || sector_shift + cluster_shift > 25 {
            return Err(corrupt("sector or cluster shift out of range"));
        }
        if fat_offset == 0 || fat_length == 0 || heap_sector == 0 || cluster_count == 0 {
            return Err(corrupt("zero layout field"));
        }
        let bytes_per_sector = 1u64 << sector_shift;
        let geometry = ClusterGeometry {
            cluster_bytes: bytes_per_sector << cluster_shift,
            heap_offset: heap_sector * bytes_per_sector,
            cluster_count,
        };
        if geometry.cluster_bytes % ctx.sector_size() as u64 != 0 {
            return Err(corrupt("cluster size is not a multiple of the sector size"));
        }
        if !geometry.is_valid(root_cluster) {
            return Err(corrupt("root cluster outside the cluster heap"));
        }

        let fat_bytes = (fat_length * bytes_per_sector).min((cluster_count + 2) * 4) as usize;
        let fat = FatTable::exfat(&ctx.read_bytes(fat_offset * bytes_per_sector, fat_bytes)?);

        let root_chain = fat.live_chain(&geometry, root_cluster)?;
        let root = read_clusters(ctx, &geometry, &root_chain)?;
        let allocation = Self::read_bitmap(ctx, &geometry, &fat, &root)?;

        let mut parser = ExfatParser {
            geometry,
            fat,
            allocation,
            directories: Vec::new(),
        };
        parser.walk_live_tree(ctx, root_cluster, root_chain);
        info!(
            "exFAT: {} clusters of {} bytes, {} live directories",
            geometry.cluster_count,
            geometry.cluster_bytes,
            parser.directories.len()
        );
        Ok(parser)
    }

    fn read_bitmap(
        ctx: &ScanContext,
        geometry: &ClusterGeometry,
        fat: &FatTable,
        root: &[u8],
    ) -> Result<AllocationMap> {
        let entry = root
            .chunks_exact(ENTRY_SIZE)
            .take_while(|slot| slot[0] != 0x00)
            .find(|slot| slot[0] == TYPE_BITMAP)
            .ok_or_else(|| RecoveryError::corrupt("exFAT root directory", "no allocation bitmap"))?;
        let first = le_u32(entry, 20).unwrap_or(0) as u64;
        let length = le_u64(entry, 24).unwrap_or(0);
        if length < geometry.cluster_count.div_ceil(8) {
            return Err(RecoveryError::corrupt("exFAT allocation bitmap", "bitmap too short"));
        }

        let clusters = match fat.live_chain(geometry, first) {
            Ok(chain) => chain,
            Err(_) => contiguous_clusters(geometry, first, length.div_ceil(geometry.cluster_bytes))
                .ok_or_else(|| {
                    RecoveryError::corrupt("exFAT allocation bitmap", "bitmap outside the heap")
                })?,
        };
        let bits = read_clusters(ctx, geometry, &clusters)?;

        let mut allocation = geometry.allocation_map();
        for index in 0..geometry.cluster_count {
            if bits[(index / 8) as usize] & (1 << (index % 8)) != 0 {
                allocation.mark(index + 2);
            }
        }
        Ok(allocation)
    }

    fn directory_clusters(&self, set: &EntrySet) -> Result<Vec<u64>> {
        if set.contiguous {
            let count = set.data_length.div_ceil(self.geometry.cluster_bytes).max(1);
            contiguous_clusters(&self.geometry, set.first_cluster, count).ok_or_else(|| {
                RecoveryError::corrupt(
                    format!("exFAT directory {}", set.name),
                    "contiguous directory runs past the heap",
                )
            })
        } else {
            self.fat.live_chain(&self.geometry, set.first_cluster)
        }
    }

    fn walk_live_tree(&mut self, ctx: &ScanContext, root_cluster: u64, root_chain: Vec<u64>) {
        let mut queue = VecDeque::from([(root_cluster, root_chain, "/".to_string(), 0usize)]);
        let mut visited = HashSet::new();

        while let Some((first, clusters, path, depth)) = queue.pop_front() {
            if ctx.is_cancelled() || !visited.insert(first) {
                continue;
            }
            let data = match read_clusters(ctx, &self.geometry, &clusters) {
                Ok(data) => data,
                Err(e) => {
                    warn!("exFAT directory {} unreadable: {}", path, e);
                    continue;
                }
            };
            self.directories.push(ExfatDirectory {
                first_cluster: first,
                clusters,
                path: path.clone(),
            });
            if depth >= MAX_DIR_DEPTH {
                continue;
            }
            for set in parse_entry_sets(&data) {
                if !set.in_use || !set.is_dir {
                    continue;
                }
                match self.directory_clusters(&set) {
                    Ok(sub) => queue.push_back((
                        set.first_cluster,
                        sub,
                        join_path(&path, &set.name),
                        depth + 1,
                    )),
                    Err(e) => warn!("exFAT directory {} skipped: {}", set.name, e),
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
        for set in parse_entry_sets(&data) {
            if ctx.is_cancelled() {
                break;
            }
            if set.in_use || set.first_cluster == 0 || set.data_length == 0 {
                continue;
            }
            if set.is_dir {
                if depth < MAX_DIR_DEPTH && visited.insert(set.first_cluster) {
                    if let Some(sub) = self.deleted_directory_clusters(ctx, &set) {
                        let sub_path = join_path(path, &set.name);
                        debug!("exFAT: descending into deleted directory {}", sub_path);
                        self.scan_directory(ctx, &sub, &sub_path, depth + 1, visited, found)?;
                    }
                }
                continue;
            }

            let layout = if set.contiguous {
                let count = set.data_length.div_ceil(self.geometry.cluster_bytes);
                contiguous_clusters(&self.geometry, set.first_cluster, count).map(|c| (c, true))
            } else {
                deleted_file_clusters(
                    &self.geometry,
                    &self.fat,
                    &self.allocation,
                    set.first_cluster,
                    set.data_length,
                )
            };
            let (chain, verified) = match layout {
                Some(layout) => layout,
                None => continue,
            };
            debug!("exFAT: deleted {} ({} bytes)", set.name, set.data_length);
            found.push(DiscoveredFile {
                locator: EntryLocator::DirectorySlot(slot_offset(&self.geometry, clusters, set.offset)),
                extents: cluster_extents(
                    &self.geometry,
                    &self.allocation,
                    &chain,
                    set.data_length,
                    ctx.sector_size(),
                ),
                name: Some(set.name),
                path: Some(path.to_string()),
                size: set.data_length,
                modified: set.modified,
                layout_verified: verified,
            });
        }
        Ok(())
    }

    fn deleted_directory_clusters(&self, ctx: &ScanContext, set: &EntrySet) -> Option<Vec<u64>> {
        let count = set.data_length.div_ceil(self.geometry.cluster_bytes).max(1);
        let clusters = if set.contiguous {
            contiguous_clusters(&self.geometry, set.first_cluster, count)?
        } else {
            self.fat
                .stale_chain(&self.geometry, &self.allocation, set.first_cluster, count)
                .or_else(|| match self.fat.link(set.first_cluster) {
                    FatLink::Free => Some(vec![set.first_cluster]),
                    _ => None,
                })?
        };
        if clusters.iter().any(|c| self.allocation.is_allocated(*c)) {
            return None;
        }
        let head = ctx.read_bytes(self.geometry.offset(clusters[0]), 1).ok()?;
        (head[0] & 0x7F == TYPE_FILE).then_some(clusters)
    }
}

impl MetadataParser for ExfatParser {
    fn kind(&self) -> FilesystemKind {
        FilesystemKind::ExFat
    }

    fn regions(&self, ctx: &ScanContext, scope: ScanScope) -> Result<Vec<MetadataRegion>> {
        Ok(self
            .directories
            .iter()
            .filter(|d| scope == ScanScope::Full || in_quick_scope(&d.path, ctx.config))
            .map(|d| MetadataRegion::directory(d.first_cluster, d.path.clone(), false))
            .collect())
    }

    fn parse_region(
        &self,
        ctx: &ScanContext,
        region: &MetadataRegion,
        _scope: ScanScope,
    ) -> Result<Vec<DiscoveredFile>> {
        let directory = match &region.spec {
            RegionSpec::Directory { locator, .. } => self
                .directories
                .iter()
                .find(|d| d.first_cluster == *locator),
            RegionSpec::Records { .. } => None,
        }
        .ok_or_else(|| RecoveryError::corrupt(region.label(), "unknown directory"))?;

        let mut found = Vec::new();
        let mut visited = HashSet::new();
        self.scan_directory(ctx, &directory.clusters, &directory.path, 0, &mut visited, &mut found)
            .map_err(|e| match e {
                RecoveryError::Io { .. } | RecoveryError::OutOfRange { .. } => {
                    RecoveryError::corrupt(region.label(), e.to_string())
                }
                other => other,
            })?;
        Ok(found)
    }

    fn allocation(&self) -> &AllocationMap {
        &self.allocation
    }
}
