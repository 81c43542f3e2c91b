//! HFS+ Catalog Parser Module
//! Recovers file records left behind in catalog B-tree leaf nodes

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::error::{RecoveryError, Result};
use crate::filesystem::{
    be_u16, be_u32, be_u64, in_quick_scope, join_path, AllocationMap, DiscoveredFile,
    MetadataParser, MetadataRegion, RegionSpec, ScanContext, ScanScope,
};
use crate::types::{EntryLocator, Extent, FilesystemKind};

const VOLUME_HEADER_OFFSET: u64 = 1024;
const SIGNATURE_HFS_PLUS: u16 = 0x482B;
const SIGNATURE_HFSX: u16 = 0x4858;
const ALLOCATION_FORK: usize = 112;
const CATALOG_FORK: usize = 272;
const NODE_DESCRIPTOR_LEN: usize = 14;
const KIND_LEAF: i8 = -1;
const RECORD_FOLDER: u16 = 1;
const RECORD_FILE: u16 = 2;
const FILE_RECORD_LEN: usize = 248;
const DATA_FORK: usize = 88;
const ROOT_PARENT: u32 = 1;
const ROOT_FOLDER: u32 = 2;
/// Seconds between 1904-01-01 and 1970-01-01.
const HFS_EPOCH_OFFSET: i64 = 2_082_844_800;
const MAX_PATH_DEPTH: usize = 64;

#[derive(Debug, Clone, Default)]
struct ForkData {
    logical_size: u64,
    extents: Vec<(u64, u64)>,
}

impl ForkData {
    fn parse(raw: &[u8]) -> Option<ForkData> {
        let logical_size = be_u64(raw, 0)?;
        let mut extents = Vec::new();
        for i in 0..8 {
            let start = be_u32(raw, 16 + i * 8)? as u64;
            let count = be_u32(raw, 20 + i * 8)? as u64;
            if count == 0 {
                break;
            }
            extents.push((start, count));
        }
        Some(ForkData {
            logical_size,
            extents,
        })
    }

    fn allocated_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.1).sum()
    }
}

struct CatalogKey {
    parent: u32,
    name: String,
    /// Offset of the record body within the node.
    body: usize,
}

fn parse_key(node: &[u8], offset: usize) -> Option<CatalogKey> {
    let key_length = be_u16(node, offset)? as usize;
    let name_len = be_u16(node, offset + 6)? as usize;
    if key_length < 6 || key_length != 6 + name_len * 2 {
        return None;
    }
    let parent = be_u32(node, offset + 2)?;
    let units: Vec<u16> = node
        .get(offset + 8..offset + 8 + name_len * 2)?
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Some(CatalogKey {
        parent,
        name: String::from_utf16_lossy(&units),
        body: offset + 2 + key_length,
    })
}

fn hfs_date(seconds: u32) -> Option<DateTime<Utc>> {
    if seconds == 0 {
        return None;
    }
    DateTime::from_timestamp(seconds as i64 - HFS_EPOCH_OFFSET, 0)
}

/// Record offsets of a node, or `None` when its offset table is inconsistent.
fn record_offsets(node: &[u8]) -> Option<Vec<usize>> {
    let count = be_u16(node, 10)? as usize;
    let table_start = node.len().checked_sub(2 * (count + 1))?;
    let mut offsets = Vec::with_capacity(count + 1);
    for i in 0..=count {
        offsets.push(be_u16(node, node.len() - 2 * (i + 1))? as usize);
    }
    let free = offsets[count];
    let ordered = offsets.windows(2).all(|w| w[0] < w[1]);
    let bounded = offsets[0] >= NODE_DESCRIPTOR_LEN && free <= table_start;
    (ordered && bounded).then(|| {
        offsets.truncate(count);
        offsets
    })
}

pub struct HfsParser {
    block_size: u64,
    total_blocks: u64,
    catalog: ForkData,
    node_size: u64,
    total_nodes: u64,
    live_files: HashSet<u32>,
    live_leaves: HashSet<u32>,
    /// Live leaves in chain order with the parent id of their first key.
    leaf_chain: Vec<(u32, u32)>,
    folders: HashMap<u32, (u32, String)>,
    allocation: AllocationMap,
}

impl HfsParser {
    pub fn open(ctx: &ScanContext) -> Result<Self> {
        let header = ctx.read_bytes(VOLUME_HEADER_OFFSET, 512)?;
        let signature = be_u16(&header, 0).unwrap_or(0);
        if signature != SIGNATURE_HFS_PLUS && signature != SIGNATURE_HFSX {
            return Err(RecoveryError::corrupt("HFS+ volume header", "bad signature"));
        }
        let block_size = be_u32(&header, 40).unwrap_or(0) as u64;
        let total_blocks = be_u32(&header, 44).unwrap_or(0) as u64;
        if block_size < 512
            || !block_size.is_power_of_two()
            || total_blocks == 0
            || total_blocks * block_size > ctx.volume_bytes()
        {
            return Err(RecoveryError::corrupt("HFS+ volume header", "bad geometry"));
        }
        let parse_fork = |offset: usize| {
            header
                .get(offset..offset + 80)
                .and_then(ForkData::parse)
                .ok_or_else(|| RecoveryError::corrupt("HFS+ volume header", "truncated fork"))
        };
        let allocation_fork = parse_fork(ALLOCATION_FORK)?;
        let catalog = parse_fork(CATALOG_FORK)?;

        let mut parser = HfsParser {
            block_size,
            total_blocks,
            catalog,
            node_size: 0,
            total_nodes: 0,
            live_files: HashSet::new(),
            live_leaves: HashSet::new(),
            leaf_chain: Vec::new(),
            folders: HashMap::new(),
            allocation: AllocationMap::bounded(0, 0, block_size, total_blocks, ctx.volume_bytes()),
        };
        parser.read_allocation_file(ctx, &allocation_fork)?;

        let header_node = parser.read_fork(ctx, &parser.catalog, 0, 512)?;
        let node_size = be_u16(&header_node, 32).unwrap_or(0) as u64;
        if node_size < 512 || !node_size.is_power_of_two() {
            return Err(RecoveryError::corrupt("HFS+ catalog header", "bad node size"));
        }
        parser.node_size = node_size;
        let catalog_bytes = parser
            .catalog
            .logical_size
            .min(parser.catalog.allocated_blocks() * block_size);
        parser.total_nodes = (be_u32(&header_node, 36).unwrap_or(0) as u64).min(catalog_bytes / node_size);
        let first_leaf = be_u32(&header_node, 24).unwrap_or(0);
        parser.collect_live_set(ctx, first_leaf);

        info!(
            "HFS+: {} blocks of {} bytes, catalog of {} nodes, {} live files",
            total_blocks,
            block_size,
            parser.total_nodes,
            parser.live_files.len()
        );
        Ok(parser)
    }

    /// Reads `len` bytes at `offset` within a fork, following its extents.
    fn read_fork(&self, ctx: &ScanContext, fork: &ForkData, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut fork_pos = 0u64;
        let mut want = offset;
        for &(start, count) in &fork.extents {
            let extent_bytes = count * self.block_size;
            if want < fork_pos + extent_bytes && out.len() < len {
                let inner = want - fork_pos;
                let take = ((extent_bytes - inner) as usize).min(len - out.len());
                out.extend(ctx.read_bytes(start * self.block_size + inner, take)?);
                want += take as u64;
            }
            fork_pos += extent_bytes;
        }
        if out.len() < len {
            return Err(RecoveryError::OutOfRange {
                start: offset,
                count: len as u64,
                total: fork_pos,
            });
        }
        Ok(out)
    }

    fn read_node(&self, ctx: &ScanContext, node: u32) -> Result<Vec<u8>> {
        self.read_fork(ctx, &self.catalog, node as u64 * self.node_size, self.node_size as usize)
    }

    fn read_allocation_file(&mut self, ctx: &ScanContext, fork: &ForkData) -> Result<()> {
        let len = self.total_blocks.div_ceil(8).min(fork.logical_size) as usize;
        let bitmap = self.read_fork(ctx, fork, 0, len)?;
        for block in 0..self.total_blocks.min(len as u64 * 8) {
            if bitmap[(block / 8) as usize] & (0x80 >> (block % 8)) != 0 {
                self.allocation.mark(block);
            }
        }
        Ok(())
    }

    fn collect_live_set(&mut self, ctx: &ScanContext, first_leaf: u32) {
        let mut node_id = first_leaf;
        while node_id != 0 && (node_id as u64) < self.total_nodes {
            if !self.live_leaves.insert(node_id) {
                warn!("HFS+: leaf chain loops at node {}", node_id);
                break;
            }
            let node = match self.read_node(ctx, node_id) {
                Ok(node) => node,
                Err(e) => {
                    warn!("HFS+: leaf node {} unreadable: {}", node_id, e);
                    break;
                }
            };
            match record_offsets(&node) {
                Some(offsets) => {
                    if let Some(first) = offsets.first().and_then(|off| parse_key(&node, *off)) {
                        self.leaf_chain.push((node_id, first.parent));
                    }
                    for offset in offsets {
                        self.note_live_record(&node, offset);
                    }
                }
                None => warn!("HFS+: leaf node {} has a damaged offset table", node_id),
            }
            node_id = be_u32(&node, 0).unwrap_or(0);
        }
    }

    fn note_live_record(&mut self, node: &[u8], offset: usize) {
        let Some(key) = parse_key(node, offset) else {
            return;
        };
        let record_type = be_u16(node, key.body).unwrap_or(0);
        let id = be_u32(node, key.body + 8).unwrap_or(0);
        match record_type {
            RECORD_FOLDER => {
                self.folders.insert(id, (key.parent, key.name));
            }
            RECORD_FILE => {
                self.live_files.insert(id);
            }
            _ => {}
        }
    }

    fn folder_path(&self, folder: u32) -> Option<String> {
        let mut names: Vec<String> = Vec::new();
        let mut current = folder;
        for _ in 0..MAX_PATH_DEPTH {
            if current == ROOT_FOLDER {
                let mut path = "/".to_string();
                for name in names.iter().rev() {
                    path = join_path(&path, name);
                }
                return Some(path);
            }
            let (parent, name) = self.folders.get(&current)?;
            if *parent == ROOT_PARENT {
                return None;
            }
            names.push(name.clone());
            current = *parent;
        }
        None
    }

    /// A file record at `offset` whose file ID is no longer in the catalog.
    fn stale_file_at(&self, ctx: &ScanContext, node_id: u32, node: &[u8], offset: usize) -> Option<(u32, DiscoveredFile, usize)> {
        let key = parse_key(node, offset)?;
        let body = node.get(key.body..key.body + FILE_RECORD_LEN)?;
        if be_u16(body, 0)? != RECORD_FILE || key.name.is_empty() {
            return None;
        }
        let file_id = be_u32(body, 8)?;
        if file_id <= ROOT_FOLDER || self.live_files.contains(&file_id) {
            return None;
        }
        let fork = ForkData::parse(&body[DATA_FORK..DATA_FORK + 80])?;
        if fork.logical_size == 0 {
            return None;
        }
        let in_volume = fork
            .extents
            .iter()
            .all(|&(start, count)| start + count <= self.total_blocks);
        // Forks needing the extents overflow file are not followed.
        if !in_volume || fork.allocated_blocks() * self.block_size < fork.logical_size {
            debug!("HFS+: stale record for file {} has an incomplete fork", file_id);
            return None;
        }

        let sector_size = ctx.sector_size();
        let mut remaining = fork.logical_size;
        let mut extents: Vec<Extent> = Vec::new();
        for &(start, count) in &fork.extents {
            if remaining == 0 {
                break;
            }
            let length = (count * self.block_size).min(remaining);
            let extent = Extent::new(start * self.block_size / sector_size as u64, length);
            extents.extend(self.allocation.split_extent(extent, sector_size));
            remaining -= length;
        }

        let file = DiscoveredFile {
            locator: EntryLocator::CatalogRecord {
                node: node_id,
                offset: offset as u32,
            },
            name: Some(key.name),
            path: self.folder_path(key.parent),
            size: fork.logical_size,
            extents,
            modified: hfs_date(be_u32(body, 16)?),
            layout_verified: true,
        };
        Some((file_id, file, key.body + FILE_RECORD_LEN - offset))
    }

    /// Live leaves whose key range can hold records of well-known folders.
    /// Catalog keys sort by parent id, so a folder's stale records stay in
    /// the leaves covering that id.
    fn quick_regions(&self, ctx: &ScanContext) -> Vec<MetadataRegion> {
        let wanted: Vec<u32> = self
            .folders
            .keys()
            .copied()
            .filter(|id| {
                self.folder_path(*id)
                    .is_some_and(|path| in_quick_scope(&path, ctx.config))
            })
            .collect();

        let nodes: Vec<u64> = self
            .leaf_chain
            .iter()
            .enumerate()
            .filter(|(i, (_, first))| {
                let last = self.leaf_chain.get(i + 1).map_or(u32::MAX, |(_, next)| *next);
                wanted.iter().any(|id| first <= id && *id <= last)
            })
            .map(|(_, (node, _))| *node as u64)
            .collect();
        let regions = MetadataRegion::record_runs(nodes, ctx.config.records_per_region);
        debug!("HFS+: quick scan covers {} folders in {} regions", wanted.len(), regions.len());
        regions
    }

    /// Scans `[start, end)` of a leaf node for stale file records.
    fn scan_span(
        &self,
        ctx: &ScanContext,
        node_id: u32,
        node: &[u8],
        start: usize,
        end: usize,
        seen: &mut HashSet<u32>,
        out: &mut Vec<DiscoveredFile>,
    ) {
        let mut pos = start + (start & 1);
        while pos + 8 < end {
            match self.stale_file_at(ctx, node_id, node, pos) {
                Some((file_id, file, len)) => {
                    if seen.insert(file_id) {
                        out.push(file);
                    }
                    pos += len;
                }
                None => pos += 2,
            }
        }
    }
}

impl MetadataParser for HfsParser {
    fn kind(&self) -> FilesystemKind {
        FilesystemKind::HfsPlus
    }

    fn regions(&self, ctx: &ScanContext, scope: ScanScope) -> Result<Vec<MetadataRegion>> {
        if scope == ScanScope::WellKnown {
            return Ok(self.quick_regions(ctx));
        }
        let per_region = ctx.config.records_per_region.max(1);
        let mut regions = Vec::new();
        let mut first = 1;
        while first < self.total_nodes {
            let count = per_region.min(self.total_nodes - first);
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
        let RegionSpec::Records { first, count } = region.spec else {
            return Ok(Vec::new());
        };

        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let (mut intact, mut damaged) = (0u64, 0u64);
        for node_id in first..(first + count).min(self.total_nodes) {
            if ctx.is_cancelled() {
                break;
            }
            let node_id = node_id as u32;
            let node = self.read_node(ctx, node_id)?;
            let live = self.live_leaves.contains(&node_id);
            if !live && node.get(8).map(|kind| *kind as i8) != Some(KIND_LEAF) {
                continue;
            }
            let area_end = match record_offsets(&node) {
                Some(_) => {
                    intact += 1;
                    node.len() - 2 * (be_u16(&node, 10).unwrap_or(0) as usize + 1)
                }
                None if live => {
                    damaged += 1;
                    continue;
                }
                // Unlinked leaves are scanned whole.
                None => node.len(),
            };
            self.scan_span(ctx, node_id, &node, NODE_DESCRIPTOR_LEN, area_end, &mut seen, &mut found);
        }

        if damaged > 0 && damaged >= intact {
            return Err(RecoveryError::corrupt(
                region.label(),
                format!("{} leaf nodes with damaged offset tables", damaged),
            ));
        }
        if scope == ScanScope::WellKnown {
            found.retain(|file| {
                file.path
                    .as_deref()
                    .is_some_and(|path| in_quick_scope(path, ctx.config))
            });
        }
        Ok(found)
    }

    fn allocation(&self) -> &AllocationMap {
        &self.allocation
    }
}
