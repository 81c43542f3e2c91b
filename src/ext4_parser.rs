//! EXT4 Inode Parser Module
//! Scans inode tables for freed inodes whose block pointers survived deletion

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::error::{RecoveryError, Result};
use crate::filesystem::{
    in_quick_scope, join_path, le_u16, le_u32, leads_to_quick_scope, AllocationMap,
    DiscoveredFile, MetadataParser, MetadataRegion, RegionSpec, ScanContext, ScanScope,
    SectorRange,
};
use crate::types::{EntryLocator, Extent, FilesystemKind};

const SUPERBLOCK_OFFSET: u64 = 1024;
const EXT4_MAGIC: u16 = 0xEF53;
const EXTENT_MAGIC: u16 = 0xF30A;
const INCOMPAT_64BIT: u32 = 0x80;
const INODE_FLAG_EXTENTS: u32 = 0x80000;
const MODE_TYPE_MASK: u16 = 0xF000;
const MODE_REGULAR: u16 = 0x8000;
const MODE_DIRECTORY: u16 = 0x4000;
const GROUP_INODE_UNINIT: u16 = 0x1;
const GROUP_BLOCK_UNINIT: u16 = 0x2;
const ROOT_INODE: u64 = 2;
const MAX_EXTENT_DEPTH: u16 = 2;
const UNINIT_EXTENT_LEN: u16 = 32768;
const DIRECT_BLOCKS: usize = 12;
const MAX_DIR_DEPTH: usize = 32;
const FILE_TYPE_DIRECTORY: u8 = 2;

#[derive(Debug, Clone)]
struct Superblock {
    block_size: u64,
    blocks_count: u64,
    first_data_block: u64,
    blocks_per_group: u64,
    inodes_per_group: u64,
    inodes_count: u64,
    inode_size: u64,
    first_inode: u64,
    desc_size: u64,
    is_64bit: bool,
}

impl Superblock {
    /// `None` unless the fields describe a filesystem that fits in
    /// `volume_bytes`.
    fn parse(raw: &[u8], volume_bytes: u64) -> Option<Superblock> {
        if le_u16(raw, 56)? != EXT4_MAGIC {
            return None;
        }
        let log_block_size = le_u32(raw, 24)?;
        if log_block_size > 6 {
            return None;
        }
        let rev_level = le_u32(raw, 76)?;
        let is_64bit = le_u32(raw, 96)? & INCOMPAT_64BIT != 0;
        let blocks_hi = if is_64bit { le_u32(raw, 336)? as u64 } else { 0 };
        let (inode_size, first_inode) = if rev_level >= 1 {
            (le_u16(raw, 88)? as u64, le_u32(raw, 84)? as u64)
        } else {
            (128, 11)
        };
        let desc_size = match le_u16(raw, 254)? as u64 {
            size if is_64bit && size >= 64 => size,
            _ => 32,
        };
        let sb = Superblock {
            block_size: 1024 << log_block_size,
            blocks_count: (blocks_hi << 32) | le_u32(raw, 4)? as u64,
            first_data_block: le_u32(raw, 20)? as u64,
            blocks_per_group: le_u32(raw, 32)? as u64,
            inodes_per_group: le_u32(raw, 40)? as u64,
            inodes_count: le_u32(raw, 0)? as u64,
            inode_size,
            first_inode,
            desc_size,
            is_64bit,
        };
        let sane = sb.blocks_per_group > 0
            && sb.inodes_per_group > 0
            && sb.inode_size >= 128
            && sb.inode_size <= sb.block_size
            && sb.blocks_per_group <= sb.block_size * 8
            && sb.inodes_per_group <= sb.block_size * 8
            && sb.blocks_count > sb.first_data_block
            && sb
                .blocks_count
                .checked_mul(sb.block_size)
                .is_some_and(|bytes| bytes <= volume_bytes);
        sane.then_some(sb)
    }

    fn group_count(&self) -> u64 {
        (self.blocks_count - self.first_data_block).div_ceil(self.blocks_per_group)
    }

    fn group_first_block(&self, group: u64) -> u64 {
        self.first_data_block + group * self.blocks_per_group
    }
}

#[derive(Debug, Clone, Copy)]
struct GroupDescriptor {
    block_bitmap: u64,
    inode_bitmap: u64,
    inode_table: u64,
    flags: u16,
}

impl GroupDescriptor {
    fn parse(raw: &[u8], is_64bit: bool) -> Option<GroupDescriptor> {
        let hi = |off: usize| -> Option<u64> {
            if is_64bit && raw.len() >= 64 {
                Some((le_u32(raw, off)? as u64) << 32)
            } else {
                Some(0)
            }
        };
        Some(GroupDescriptor {
            block_bitmap: le_u32(raw, 0)? as u64 | hi(0x20)?,
            inode_bitmap: le_u32(raw, 4)? as u64 | hi(0x24)?,
            inode_table: le_u32(raw, 8)? as u64 | hi(0x28)?,
            flags: le_u16(raw, 0x12)?,
        })
    }
}

/// (logical block, physical block, length in blocks)
type BlockRun = (u64, u64, u64);

/// A directory record. Entries recovered from record slack are `deleted`.
#[derive(Debug, Clone)]
struct DirRecord {
    inode: u64,
    name: String,
    file_type: u8,
    deleted: bool,
}

fn align4(n: usize) -> usize {
    n.div_ceil(4) * 4
}

fn parse_dir_block(block: &[u8]) -> Vec<DirRecord> {
    let mut records = Vec::new();
    let mut off = 0;
    while off + 8 <= block.len() {
        let inode = le_u32(block, off).unwrap_or(0) as u64;
        let rec_len = le_u16(block, off + 4).unwrap_or(0) as usize;
        let name_len = block[off + 6] as usize;
        if rec_len < 8 || rec_len % 4 != 0 || off + rec_len > block.len() {
            break;
        }
        let mut used = 8;
        if inode != 0 && name_len > 0 && 8 + name_len <= rec_len {
            let name = String::from_utf8_lossy(&block[off + 8..off + 8 + name_len]).to_string();
            if name != "." && name != ".." {
                records.push(DirRecord {
                    inode,
                    name,
                    file_type: block[off + 7],
                    deleted: false,
                });
            }
            used = align4(8 + name_len);
        }
        scan_slack(&block[off..off + rec_len], used, &mut records);
        off += rec_len;
    }
    records
}

/// Unlinked entries survive inside the record length of the entry before them.
fn scan_slack(record: &[u8], mut pos: usize, out: &mut Vec<DirRecord>) {
    while pos + 12 <= record.len() {
        let inode = le_u32(record, pos).unwrap_or(0) as u64;
        let rec_len = le_u16(record, pos + 4).unwrap_or(0) as usize;
        let name_len = record[pos + 6] as usize;
        let plausible = inode != 0
            && name_len > 0
            && rec_len >= 12
            && rec_len % 4 == 0
            && 8 + name_len <= rec_len
            && pos + 8 + name_len <= record.len();
        if plausible {
            let raw_name = &record[pos + 8..pos + 8 + name_len];
            if let Ok(name) = std::str::from_utf8(raw_name) {
                if !name.contains(['/', '\0']) {
                    out.push(DirRecord {
                        inode,
                        name: name.to_string(),
                        file_type: record[pos + 7],
                        deleted: true,
                    });
                    pos += align4(8 + name_len);
                    continue;
                }
            }
        }
        pos += 4;
    }
}

pub struct Ext4Parser {
    sb: Superblock,
    groups: Vec<GroupDescriptor>,
    allocation: AllocationMap,
}

impl Ext4Parser {
    pub fn open(ctx: &ScanContext) -> Result<Self> {
        let raw = ctx.read_bytes(SUPERBLOCK_OFFSET, 1024)?;
        let sb = Superblock::parse(&raw, ctx.volume_bytes()).ok_or_else(|| {
            RecoveryError::corrupt("ext4 superblock", "invalid superblock or geometry")
        })?;
        if sb.block_size % ctx.sector_size() as u64 != 0 {
            return Err(RecoveryError::corrupt(
                "ext4 superblock",
                "block size is not a multiple of the sector size",
            ));
        }

        let group_count = sb.group_count();
        let table_block = sb.first_data_block + 1;
        let table_len = usize::try_from(group_count * sb.desc_size)
            .map_err(|_| RecoveryError::corrupt("ext4 group descriptors", "table too large"))?;
        let table = ctx.read_bytes(table_block * sb.block_size, table_len)?;
        let groups = table
            .chunks_exact(sb.desc_size as usize)
            .map(|raw| GroupDescriptor::parse(raw, sb.is_64bit))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| RecoveryError::corrupt("ext4 group descriptors", "truncated table"))?;

        let mut parser = Ext4Parser {
            allocation: AllocationMap::bounded(
                0,
                0,
                sb.block_size,
                sb.blocks_count,
                ctx.volume_bytes(),
            ),
            sb,
            groups,
        };
        parser.read_block_bitmaps(ctx);
        info!(
            "EXT4: {} groups, {} blocks of {} bytes, {} inodes",
            group_count, parser.sb.blocks_count, parser.sb.block_size, parser.sb.inodes_count
        );
        Ok(parser)
    }

    fn read_block_bitmaps(&mut self, ctx: &ScanContext) {
        self.allocation.mark_run(0, self.sb.first_data_block);
        for (group, desc) in self.groups.iter().enumerate() {
            if desc.flags & GROUP_BLOCK_UNINIT != 0 || desc.block_bitmap >= self.sb.blocks_count {
                continue;
            }
            let bitmap = match self.read_block(ctx, desc.block_bitmap) {
                Ok(bitmap) => bitmap,
                Err(e) => {
                    warn!("EXT4: block bitmap of group {} unreadable: {}", group, e);
                    continue;
                }
            };
            let first = self.sb.group_first_block(group as u64);
            let count = self.sb.blocks_per_group.min(self.sb.blocks_count - first);
            for index in 0..count {
                if bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0 {
                    self.allocation.mark(first + index);
                }
            }
        }
    }

    fn block_offset(&self, block: u64) -> Option<u64> {
        (block < self.sb.blocks_count).then(|| block * self.sb.block_size)
    }

    fn read_block(&self, ctx: &ScanContext, block: u64) -> Result<Vec<u8>> {
        let offset = self.block_offset(block).ok_or_else(|| {
            RecoveryError::corrupt("ext4 block pointer", format!("block {} is past the end", block))
        })?;
        ctx.read_bytes(offset, self.sb.block_size as usize)
    }

    fn group_span(&self, group: u64, sector_size: u32) -> SectorRange {
        let first = self.sb.group_first_block(group);
        let count = self.sb.blocks_per_group.min(self.sb.blocks_count - first);
        let per_block = self.sb.block_size / sector_size as u64;
        SectorRange::new(first * per_block, count * per_block)
    }

    fn read_inode(&self, ctx: &ScanContext, ino: u64) -> Option<(Vec<u8>, bool)> {
        if ino == 0 || ino > self.sb.inodes_count {
            return None;
        }
        let group = ((ino - 1) / self.sb.inodes_per_group) as usize;
        let index = (ino - 1) % self.sb.inodes_per_group;
        let desc = self.groups.get(group)?;
        let table = self.block_offset(desc.inode_table)?;
        let raw = ctx
            .read_bytes(table + index * self.sb.inode_size, self.sb.inode_size as usize)
            .ok()?;
        let bitmap = ctx
            .read_bytes(self.block_offset(desc.inode_bitmap)? + index / 8, 1)
            .ok()?;
        let in_use = bitmap[0] & (1 << (index % 8)) != 0;
        Some((raw, in_use))
    }

    /// Runs of an extent tree node. `None` when the tree is damaged.
    fn extent_runs(&self, ctx: &ScanContext, node: &[u8], max_depth: u16) -> Option<Vec<BlockRun>> {
        if le_u16(node, 0)? != EXTENT_MAGIC {
            return None;
        }
        let entries = le_u16(node, 2)? as usize;
        let depth = le_u16(node, 6)?;
        if depth > max_depth {
            return None;
        }

        let mut runs = Vec::new();
        for i in 0..entries {
            let entry = node.get(12 + i * 12..24 + i * 12)?;
            if depth == 0 {
                let logical = le_u32(entry, 0)? as u64;
                let mut len = le_u16(entry, 4)?;
                if len > UNINIT_EXTENT_LEN {
                    len -= UNINIT_EXTENT_LEN;
                }
                let physical = ((le_u16(entry, 6)? as u64) << 32) | le_u32(entry, 8)? as u64;
                runs.push((logical, physical, len as u64));
            } else {
                let child = ((le_u16(entry, 8)? as u64) << 32) | le_u32(entry, 4)? as u64;
                if child == 0 || child >= self.sb.blocks_count {
                    return None;
                }
                let block = self.read_block(ctx, child).ok()?;
                if le_u16(&block, 6)? != depth - 1 {
                    return None;
                }
                runs.extend(self.extent_runs(ctx, &block, depth - 1)?);
            }
        }
        Some(runs)
    }

    /// Direct, indirect and double-indirect pointers, coalesced into runs.
    fn block_map_runs(&self, ctx: &ScanContext, i_block: &[u8], needed: u64) -> Option<Vec<BlockRun>> {
        let per_block = self.sb.block_size / 4;
        if needed > DIRECT_BLOCKS as u64 + per_block + per_block * per_block {
            return None;
        }
        let pointer = |buf: &[u8], i: usize| le_u32(buf, i * 4).map(|p| p as u64);

        let mut blocks: Vec<u64> = Vec::new();
        for i in 0..DIRECT_BLOCKS {
            if blocks.len() as u64 == needed {
                break;
            }
            blocks.push(pointer(i_block, i)?);
        }
        if (blocks.len() as u64) < needed {
            let indirect = self.read_block(ctx, pointer(i_block, 12)?).ok()?;
            for i in 0..per_block as usize {
                if blocks.len() as u64 == needed {
                    break;
                }
                blocks.push(pointer(&indirect, i)?);
            }
        }
        if (blocks.len() as u64) < needed {
            let double = self.read_block(ctx, pointer(i_block, 13)?).ok()?;
            'outer: for i in 0..per_block as usize {
                let inner = self.read_block(ctx, pointer(&double, i)?).ok()?;
                for j in 0..per_block as usize {
                    if blocks.len() as u64 == needed {
                        break 'outer;
                    }
                    blocks.push(pointer(&inner, j)?);
                }
            }
        }
        if blocks.contains(&0) {
            return None;
        }

        let mut runs: Vec<BlockRun> = Vec::new();
        for (logical, physical) in blocks.into_iter().enumerate() {
            match runs.last_mut() {
                Some((_, start, len)) if *start + *len == physical => *len += 1,
                _ => runs.push((logical as u64, physical, 1)),
            }
        }
        Some(runs)
    }

    /// Block runs covering the first `size` bytes of an inode.
    fn inode_runs(&self, ctx: &ScanContext, raw: &[u8], size: u64) -> Option<Vec<BlockRun>> {
        let needed = size.div_ceil(self.sb.block_size);
        if needed > self.sb.blocks_count {
            return None;
        }
        let flags = le_u32(raw, 32)?;
        let i_block = raw.get(40..100)?;
        let mut runs = if flags & INODE_FLAG_EXTENTS != 0 {
            self.extent_runs(ctx, i_block, MAX_EXTENT_DEPTH)?
        } else {
            self.block_map_runs(ctx, i_block, needed)?
        };
        runs.sort_unstable();

        // Holes before the end of the data make the stream unrecoverable.
        let mut next_logical = 0;
        let mut covered = Vec::new();
        for (logical, physical, len) in runs {
            if next_logical >= needed {
                break;
            }
            if logical != next_logical
                || len == 0
                || physical == 0
                || physical + len > self.sb.blocks_count
            {
                return None;
            }
            let take = len.min(needed - next_logical);
            covered.push((logical, physical, take));
            next_logical += take;
        }
        (next_logical == needed).then_some(covered)
    }

    fn deleted_inode(&self, ctx: &ScanContext, ino: u64, raw: &[u8]) -> Option<DiscoveredFile> {
        let mode = le_u16(raw, 0)?;
        let dtime = le_u32(raw, 20)?;
        if mode & MODE_TYPE_MASK != MODE_REGULAR || dtime == 0 {
            return None;
        }
        let size = le_u32(raw, 4)? as u64 | ((le_u32(raw, 108)? as u64) << 32);
        if size == 0 {
            return None;
        }
        let runs = self.inode_runs(ctx, raw, size)?;

        let sector_size = ctx.sector_size();
        let mut remaining = size;
        let mut extents: Vec<Extent> = Vec::new();
        for (_, physical, len) in runs {
            let length = (len * self.sb.block_size).min(remaining);
            let extent = Extent::new(physical * self.sb.block_size / sector_size as u64, length);
            extents.extend(self.allocation.split_extent(extent, sector_size));
            remaining -= length;
        }
        let modified: Option<DateTime<Utc>> =
            DateTime::from_timestamp(le_u32(raw, 16)? as i64, 0);

        debug!("EXT4: freed inode {} ({} bytes, {} extents)", ino, size, extents.len());
        Some(DiscoveredFile {
            locator: EntryLocator::Inode(ino),
            name: None,
            path: None,
            size,
            extents,
            modified,
            layout_verified: true,
        })
    }

    fn scan_group(&self, ctx: &ScanContext, region: &MetadataRegion, group: u64) -> Result<Vec<DiscoveredFile>> {
        let desc = self
            .groups
            .get(group as usize)
            .ok_or_else(|| RecoveryError::corrupt(region.label(), "no such block group"))?;
        if desc.flags & GROUP_INODE_UNINIT != 0 {
            return Ok(Vec::new());
        }
        let table_blocks = (self.sb.inodes_per_group * self.sb.inode_size).div_ceil(self.sb.block_size);
        if desc.inode_bitmap >= self.sb.blocks_count
            || desc.inode_table == 0
            || desc
                .inode_table
                .checked_add(table_blocks)
                .map_or(true, |end| end > self.sb.blocks_count)
        {
            return Err(RecoveryError::corrupt(
                region.label(),
                "group descriptor points outside the volume",
            ));
        }

        let bitmap = self.read_block(ctx, desc.inode_bitmap)?;
        let table = ctx.read_bytes(
            desc.inode_table * self.sb.block_size,
            (self.sb.inodes_per_group * self.sb.inode_size) as usize,
        )?;

        let mut found = Vec::new();
        let (mut consistent, mut damaged) = (0u64, 0u64);
        for index in 0..self.sb.inodes_per_group {
            if ctx.is_cancelled() {
                break;
            }
            let ino = group * self.sb.inodes_per_group + index + 1;
            if ino > self.sb.inodes_count {
                break;
            }
            let start = (index * self.sb.inode_size) as usize;
            let raw = &table[start..start + self.sb.inode_size as usize];
            let in_use = bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0;

            if in_use {
                if ino >= self.sb.first_inode {
                    // An allocated inode with no type and no links is a torn table.
                    let mode = le_u16(raw, 0).unwrap_or(0);
                    let links = le_u16(raw, 26).unwrap_or(0);
                    if mode == 0 && links == 0 {
                        damaged += 1;
                    } else {
                        consistent += 1;
                    }
                }
                continue;
            }
            if let Some(file) = self.deleted_inode(ctx, ino, raw) {
                found.push(file);
            }
        }

        if damaged > 0 && damaged >= consistent {
            warn!("EXT4: group {} inode table damaged ({} bad inodes)", group, damaged);
            return Err(RecoveryError::corrupt(
                region.label(),
                format!("{} allocated inodes are blank", damaged),
            ));
        }
        Ok(found)
    }

    /// Blocks of a live directory inode.
    fn directory_blocks(&self, ctx: &ScanContext, ino: u64) -> Option<Vec<Vec<u8>>> {
        let (raw, in_use) = self.read_inode(ctx, ino)?;
        if !in_use || le_u16(&raw, 0)? & MODE_TYPE_MASK != MODE_DIRECTORY {
            return None;
        }
        let size = le_u32(&raw, 4)? as u64;
        let runs = self.inode_runs(ctx, &raw, size)?;
        let mut blocks = Vec::new();
        for (_, physical, len) in runs {
            for block in physical..physical + len {
                blocks.push(self.read_block(ctx, block).ok()?);
            }
        }
        Some(blocks)
    }

    fn directory_records(&self, ctx: &ScanContext, ino: u64) -> Option<Vec<DirRecord>> {
        let blocks = self.directory_blocks(ctx, ino)?;
        Some(blocks.iter().flat_map(|b| parse_dir_block(b)).collect())
    }

    /// Live directories in quick scope, found by walking only the paths that
    /// can lead to them.
    fn quick_directories(&self, ctx: &ScanContext) -> Vec<(u64, String)> {
        let mut targets = Vec::new();
        let mut queue = VecDeque::from([(ROOT_INODE, "/".to_string())]);
        while let Some((ino, path)) = queue.pop_front() {
            let records = match self.directory_records(ctx, ino) {
                Some(records) => records,
                None => {
                    warn!("EXT4: directory {} unreadable", path);
                    continue;
                }
            };
            for record in records {
                if record.deleted || record.file_type != FILE_TYPE_DIRECTORY {
                    continue;
                }
                let child = join_path(&path, &record.name);
                if in_quick_scope(&child, ctx.config) {
                    targets.push((record.inode, child));
                } else if leads_to_quick_scope(&child) {
                    queue.push_back((record.inode, child));
                }
            }
        }
        targets
    }

    fn scan_directory_tree(
        &self,
        ctx: &ScanContext,
        region: &MetadataRegion,
        root: u64,
        root_path: &str,
        recursive: bool,
    ) -> Result<Vec<DiscoveredFile>> {
        let mut found = Vec::new();
        let mut seen_inodes = HashSet::new();
        let mut visited = HashSet::from([root]);
        let mut queue = VecDeque::from([(root, root_path.to_string(), 0usize)]);

        while let Some((ino, path, depth)) = queue.pop_front() {
            if ctx.is_cancelled() {
                break;
            }
            let records = self.directory_records(ctx, ino).ok_or_else(|| {
                RecoveryError::corrupt(region.label(), format!("directory {} unreadable", path))
            })?;
            for record in records {
                if !record.deleted {
                    let descend = recursive
                        && record.file_type == FILE_TYPE_DIRECTORY
                        && depth < MAX_DIR_DEPTH
                        && visited.insert(record.inode);
                    if descend {
                        queue.push_back((record.inode, join_path(&path, &record.name), depth + 1));
                    }
                    continue;
                }
                if !seen_inodes.insert(record.inode) {
                    continue;
                }
                let (raw, in_use) = match self.read_inode(ctx, record.inode) {
                    Some(inode) => inode,
                    None => continue,
                };
                if in_use {
                    continue;
                }
                if let Some(mut file) = self.deleted_inode(ctx, record.inode, &raw) {
                    file.name = Some(record.name);
                    file.path = Some(path.clone());
                    found.push(file);
                }
            }
        }
        Ok(found)
    }
}

impl MetadataParser for Ext4Parser {
    fn kind(&self) -> FilesystemKind {
        FilesystemKind::Ext4
    }

    fn regions(&self, ctx: &ScanContext, scope: ScanScope) -> Result<Vec<MetadataRegion>> {
        match scope {
            ScanScope::Full => Ok((0..self.groups.len() as u64)
                .map(|group| MetadataRegion {
                    fallback: Some(self.group_span(group, ctx.sector_size())),
                    ..MetadataRegion::records(group, 1)
                })
                .collect()),
            ScanScope::WellKnown => Ok(self
                .quick_directories(ctx)
                .into_iter()
                .map(|(ino, path)| MetadataRegion::directory(ino, path, true))
                .collect()),
        }
    }

    fn parse_region(
        &self,
        ctx: &ScanContext,
        region: &MetadataRegion,
        _scope: ScanScope,
    ) -> Result<Vec<DiscoveredFile>> {
        match &region.spec {
            RegionSpec::Records { first, .. } => self.scan_group(ctx, region, *first),
            RegionSpec::Directory {
                locator,
                path,
                recursive,
            } => self.scan_directory_tree(ctx, region, *locator, path, *recursive),
        }
    }

    fn allocation(&self) -> &AllocationMap {
        &self.allocation
    }
}
