//! Synthetic volume images for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::config::EngineConfig;
use crate::disk_reader::{DiskReader, MemoryImage, SectorSource};
use crate::filesystem::ScanContext;

pub const SECTOR: usize = 512;

pub fn scan_context<'a>(
    reader: &'a DiskReader,
    config: &'a EngineConfig,
    cancel: &'a AtomicBool,
    progress: &'a AtomicU64,
) -> ScanContext<'a> {
    ScanContext::new(reader, config, cancel, progress)
}

pub fn memory_reader(data: Vec<u8>, label: &str) -> DiskReader {
    DiskReader::from_source(Arc::new(MemoryImage::new(data)), label)
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// NTFS update sequence: each sector tail moves to the array at `usa` and
/// is replaced by the sequence number.
fn protect(buf: &mut [u8], usa: usize) {
    put_u16(buf, usa, 1);
    for i in 1..=buf.len() / SECTOR {
        let tail = i * SECTOR - 2;
        let saved = [buf[tail], buf[tail + 1]];
        buf[usa + i * 2..usa + i * 2 + 2].copy_from_slice(&saved);
        put_u16(buf, tail, 1);
    }
}

fn put_be_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_be_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

fn put_be_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_be_bytes());
}

/// In-memory image whose first read reaching `gate_from` or beyond parks
/// until the test releases it.
pub struct GatedImage {
    inner: MemoryImage,
    gate_from: u64,
    reached: Mutex<Option<Sender<()>>>,
    release: Mutex<Receiver<()>>,
}

impl GatedImage {
    /// Returns the image, a receiver told when the gate is hit, and the
    /// sender that lets the parked read continue.
    pub fn new(data: Vec<u8>, gate_from: u64) -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (reached_tx, reached_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let image = GatedImage {
            inner: MemoryImage::new(data),
            gate_from,
            reached: Mutex::new(Some(reached_tx)),
            release: Mutex::new(release_rx),
        };
        (Arc::new(image), reached_rx, release_tx)
    }
}

impl SectorSource for GatedImage {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if offset + buf.len() as u64 > self.gate_from {
            let reached = self.reached.lock().ok().and_then(|mut tx| tx.take());
            if let Some(tx) = reached {
                let _ = tx.send(());
                if let Ok(release) = self.release.lock() {
                    let _ = release.recv();
                }
            }
        }
        self.inner.read_exact_at(offset, buf)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

/// Zero-filled image that panics when read past `limit`.
pub struct PanickingImage {
    len: u64,
    limit: u64,
}

impl PanickingImage {
    pub fn new(len: u64, limit: u64) -> Arc<Self> {
        Arc::new(PanickingImage { len, limit })
    }
}

impl SectorSource for PanickingImage {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if offset + buf.len() as u64 > self.limit {
            panic!("read at {} crossed {}", offset, self.limit);
        }
        buf.fill(0);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// A minimal JPEG: SOI, one APP0 segment, SOS with entropy data, EOI.
pub fn sample_jpeg(payload_len: usize) -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    data.extend_from_slice(b"JFIF\0");
    data.extend_from_slice(&[1, 1, 0, 0, 1, 0, 1, 0, 0]);
    data.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x08, 1, 1, 0, 0, 0x3F, 0]);
    data.extend((0..payload_len).map(|i| (i % 200) as u8 + 1));
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

// ---------------------------------------------------------------------------
// FAT32

const FAT_RESERVED: usize = 32;
const FAT_SECTORS: usize = 4;
const FAT_TOTAL_SECTORS: usize = 512;
const FAT_HEAP_SECTOR: usize = FAT_RESERVED + 2 * FAT_SECTORS;
const FAT_EOC: u32 = 0x0FFF_FFFF;

/// FAT32 with 512-byte clusters, one cluster per directory.
pub struct FatImageBuilder {
    data: Vec<u8>,
    next_cluster: u64,
    next_slot: HashMap<u64, usize>,
}

impl FatImageBuilder {
    pub fn new() -> Self {
        let mut data = vec![0u8; FAT_TOTAL_SECTORS * SECTOR];
        data[0..3].copy_from_slice(&[0xEB, 0x58, 0x90]);
        data[3..11].copy_from_slice(b"MSWIN4.1");
        put_u16(&mut data, 11, SECTOR as u16);
        data[13] = 1;
        put_u16(&mut data, 14, FAT_RESERVED as u16);
        data[16] = 2;
        data[21] = 0xF8;
        put_u32(&mut data, 32, FAT_TOTAL_SECTORS as u32);
        put_u32(&mut data, 36, FAT_SECTORS as u32);
        put_u32(&mut data, 44, 2);
        data[82..90].copy_from_slice(b"FAT32   ");
        data[510] = 0x55;
        data[511] = 0xAA;

        let mut builder = FatImageBuilder {
            data,
            next_cluster: 3,
            next_slot: HashMap::new(),
        };
        builder.set_fat(0, 0x0FFF_FFF8);
        builder.set_fat(1, FAT_EOC);
        builder.set_fat(2, FAT_EOC);
        builder
    }

    pub fn root(&self) -> u64 {
        2
    }

    pub fn cluster_offset(cluster: u64) -> usize {
        FAT_HEAP_SECTOR * SECTOR + (cluster as usize - 2) * SECTOR
    }

    pub fn set_fat(&mut self, cluster: u64, value: u32) {
        put_u32(&mut self.data, FAT_RESERVED * SECTOR + cluster as usize * 4, value);
    }

    fn allocate(&mut self, count: u64) -> u64 {
        let first = self.next_cluster;
        self.next_cluster += count.max(1);
        first
    }

    fn padded_name(name: &str) -> [u8; 11] {
        let mut raw = [b' '; 11];
        for (i, b) in name.bytes().take(11).enumerate() {
            raw[i] = b;
        }
        raw
    }

    fn write_entry(
        &mut self,
        dir: u64,
        name: &str,
        attr: u8,
        cluster: u64,
        size: u32,
        deleted: bool,
    ) {
        let slot = self.next_slot.entry(dir).or_insert(0);
        let off = Self::cluster_offset(dir) + *slot * 32;
        *slot += 1;
        let mut raw = Self::padded_name(name);
        if deleted {
            raw[0] = 0xE5;
        }
        self.data[off..off + 11].copy_from_slice(&raw);
        self.data[off + 11] = attr;
        put_u16(&mut self.data, off + 20, (cluster >> 16) as u16);
        put_u16(&mut self.data, off + 22, (13 << 11) | (45 << 5));
        put_u16(&mut self.data, off + 24, ((2021 - 1980) << 9) | (6 << 5) | 15);
        put_u16(&mut self.data, off + 26, cluster as u16);
        put_u32(&mut self.data, off + 28, size);
    }

    pub fn add_dir(&mut self, parent: u64, name: &str) -> u64 {
        let cluster = self.allocate(1);
        self.set_fat(cluster, FAT_EOC);
        self.write_entry(cluster, ".", 0x10, cluster, 0, false);
        self.write_entry(cluster, "..", 0x10, parent, 0, false);
        self.write_entry(parent, name, 0x10, cluster, 0, false);
        cluster
    }

    /// Deleted files keep their FAT chain only when `keep_chain` is set.
    pub fn add_file(
        &mut self,
        parent: u64,
        name: &str,
        content: &[u8],
        deleted: bool,
        keep_chain: bool,
    ) -> u64 {
        let count = (content.len() as u64).div_ceil(SECTOR as u64);
        let first = self.allocate(count);
        let off = Self::cluster_offset(first);
        self.data[off..off + content.len()].copy_from_slice(content);
        if !deleted || keep_chain {
            for c in first..first + count {
                let next = if c + 1 == first + count { FAT_EOC } else { (c + 1) as u32 };
                self.set_fat(c, next);
            }
        }
        self.write_entry(parent, name, 0x20, first, content.len() as u32, deleted);
        first
    }

    /// A live single-cluster file at a fixed cluster.
    pub fn add_file_at(&mut self, parent: u64, name: &str, cluster: u64, content: &[u8]) {
        let off = Self::cluster_offset(cluster);
        self.data[off..off + content.len()].copy_from_slice(content);
        self.set_fat(cluster, FAT_EOC);
        self.write_entry(parent, name, 0x20, cluster, content.len() as u32, false);
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        let fat_start = FAT_RESERVED * SECTOR;
        let fat_len = FAT_SECTORS * SECTOR;
        let fat = self.data[fat_start..fat_start + fat_len].to_vec();
        self.data[fat_start + fat_len..fat_start + 2 * fat_len].copy_from_slice(&fat);
        self.data
    }

    pub fn finish(self) -> (DiskReader, EngineConfig) {
        (memory_reader(self.into_bytes(), "fat32.img"), EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// exFAT

const EXFAT_FAT_SECTOR: usize = 24;
const EXFAT_FAT_SECTORS: usize = 4;
const EXFAT_HEAP_SECTOR: usize = 32;
const EXFAT_CLUSTERS: usize = 400;
const EXFAT_BITMAP_CLUSTER: u64 = 2;
const EXFAT_ROOT_CLUSTER: u64 = 4;

/// exFAT with 512-byte clusters and single-cluster directories.
pub struct ExfatImageBuilder {
    data: Vec<u8>,
    next_cluster: u64,
    next_slot: HashMap<u64, usize>,
}

impl ExfatImageBuilder {
    pub fn new() -> Self {
        let total = EXFAT_HEAP_SECTOR + EXFAT_CLUSTERS;
        let mut data = vec![0u8; total * SECTOR];
        data[0..3].copy_from_slice(&[0xEB, 0x76, 0x90]);
        data[3..11].copy_from_slice(b"EXFAT   ");
        put_u64(&mut data, 72, total as u64);
        put_u32(&mut data, 80, EXFAT_FAT_SECTOR as u32);
        put_u32(&mut data, 84, EXFAT_FAT_SECTORS as u32);
        put_u32(&mut data, 88, EXFAT_HEAP_SECTOR as u32);
        put_u32(&mut data, 92, EXFAT_CLUSTERS as u32);
        put_u32(&mut data, 96, EXFAT_ROOT_CLUSTER as u32);
        data[108] = 9;
        data[109] = 0;
        data[110] = 1;
        data[510] = 0x55;
        data[511] = 0xAA;

        let mut builder = ExfatImageBuilder {
            data,
            next_cluster: 5,
            next_slot: HashMap::new(),
        };
        for cluster in 2..5 {
            builder.set_fat(cluster, 0xFFFF_FFFF);
            builder.set_allocated(cluster);
        }
        // Allocation bitmap entry at the head of the root directory.
        let slot = builder.next_slot(EXFAT_ROOT_CLUSTER);
        builder.data[slot] = 0x81;
        put_u32(&mut builder.data, slot + 20, EXFAT_BITMAP_CLUSTER as u32);
        put_u64(&mut builder.data, slot + 24, (EXFAT_CLUSTERS as u64).div_ceil(8));
        builder
    }

    pub fn root(&self) -> u64 {
        EXFAT_ROOT_CLUSTER
    }

    fn cluster_offset(cluster: u64) -> usize {
        EXFAT_HEAP_SECTOR * SECTOR + (cluster as usize - 2) * SECTOR
    }

    fn set_fat(&mut self, cluster: u64, value: u32) {
        put_u32(&mut self.data, EXFAT_FAT_SECTOR * SECTOR + cluster as usize * 4, value);
    }

    fn set_allocated(&mut self, cluster: u64) {
        let bit = (cluster - 2) as usize;
        let off = Self::cluster_offset(EXFAT_BITMAP_CLUSTER) + bit / 8;
        self.data[off] |= 1 << (bit % 8);
    }

    fn next_slot(&mut self, dir: u64) -> usize {
        let slot = self.next_slot.entry(dir).or_insert(0);
        let off = Self::cluster_offset(dir) + *slot * 32;
        *slot += 1;
        off
    }

    fn write_set(
        &mut self,
        dir: u64,
        name: &str,
        attr: u16,
        cluster: u64,
        length: u64,
        contiguous: bool,
        deleted: bool,
    ) {
        let units: Vec<u16> = name.encode_utf16().collect();
        let name_slots = units.len().div_ceil(15);
        let live = if deleted { 0 } else { 0x80 };

        let file = self.next_slot(dir);
        self.data[file] = 0x05 | live;
        self.data[file + 1] = (1 + name_slots) as u8;
        put_u16(&mut self.data, file + 4, attr);
        let timestamp = (((2022 - 1980) << 25) | (3 << 21) | (9 << 16) | (10 << 11)) as u32;
        put_u32(&mut self.data, file + 12, timestamp);

        let stream = self.next_slot(dir);
        self.data[stream] = 0x40 | live;
        self.data[stream + 1] = 0x01 | if contiguous { 0x02 } else { 0 };
        self.data[stream + 3] = units.len() as u8;
        put_u64(&mut self.data, stream + 8, length);
        put_u32(&mut self.data, stream + 20, cluster as u32);
        put_u64(&mut self.data, stream + 24, length);

        for chunk in units.chunks(15) {
            let slot = self.next_slot(dir);
            self.data[slot] = 0x41 | live;
            for (i, unit) in chunk.iter().enumerate() {
                put_u16(&mut self.data, slot + 2 + i * 2, *unit);
            }
        }
    }

    pub fn add_dir(&mut self, parent: u64, name: &str) -> u64 {
        let cluster = self.next_cluster;
        self.next_cluster += 1;
        self.set_allocated(cluster);
        self.write_set(parent, name, 0x10, cluster, SECTOR as u64, true, false);
        cluster
    }

    /// Chained files keep their FAT chain even when deleted, as exFAT does.
    pub fn add_file(
        &mut self,
        parent: u64,
        name: &str,
        content: &[u8],
        deleted: bool,
        contiguous: bool,
    ) -> u64 {
        let count = (content.len() as u64).div_ceil(SECTOR as u64).max(1);
        let first = self.next_cluster;
        self.next_cluster += count;
        let off = Self::cluster_offset(first);
        self.data[off..off + content.len()].copy_from_slice(content);
        for c in first..first + count {
            if !contiguous {
                let next = if c + 1 == first + count { 0xFFFF_FFFF } else { (c + 1) as u32 };
                self.set_fat(c, next);
            }
            if !deleted {
                self.set_allocated(c);
            }
        }
        self.write_set(parent, name, 0x20, first, content.len() as u64, contiguous, deleted);
        first
    }

    pub fn finish(self) -> (DiskReader, EngineConfig) {
        (memory_reader(self.data, "exfat.img"), EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// NTFS

const NTFS_TOTAL_SECTORS: usize = 1024;
const NTFS_MFT_CLUSTER: u64 = 16;
const NTFS_MFT_RECORDS: u64 = 64;
const NTFS_RECORD: usize = 1024;
const NTFS_BITMAP_CLUSTER: u64 = 144;
const NTFS_INDEX_BLOCK: usize = 1024;
/// 2020-01-01T00:00:00Z
const NTFS_TIMESTAMP: u64 = 132_223_104_000_000_000;

/// One name a directory's index lists.
struct NtfsChild {
    number: u64,
    name: String,
    is_dir: bool,
    deleted: bool,
}

/// NTFS with 512-byte clusters, 1 KiB records and a 64-record MFT.
/// Directories get a `$I30` index over their children when the image is
/// built; names of deleted children stay in the index block's slack.
pub struct NtfsImageBuilder {
    data: Vec<u8>,
    bitmap: Vec<bool>,
    next_cluster: u64,
    dirs: BTreeMap<u64, (u64, String)>,
    children: HashMap<u64, Vec<NtfsChild>>,
}

impl NtfsImageBuilder {
    pub fn new() -> Self {
        let mut data = vec![0u8; NTFS_TOTAL_SECTORS * SECTOR];
        data[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        data[3..11].copy_from_slice(b"NTFS    ");
        put_u16(&mut data, 11, SECTOR as u16);
        data[13] = 1;
        data[21] = 0xF8;
        put_u64(&mut data, 0x28, NTFS_TOTAL_SECTORS as u64);
        put_u64(&mut data, 0x30, NTFS_MFT_CLUSTER);
        put_u64(&mut data, 0x38, 2);
        data[0x40] = 0xF6;
        data[0x44] = 1;
        data[510] = 0x55;
        data[511] = 0xAA;

        let mut builder = NtfsImageBuilder {
            data,
            bitmap: vec![false; NTFS_TOTAL_SECTORS],
            next_cluster: 150,
            dirs: BTreeMap::new(),
            children: HashMap::new(),
        };
        builder.dirs.insert(5, (5, ".".to_string()));
        for cluster in 0..150 {
            builder.bitmap[cluster] = true;
        }
        let mft_runs = [(NTFS_MFT_CLUSTER, NTFS_MFT_RECORDS * 2)];
        builder.put_record(
            0,
            0x01,
            &[
                Self::file_name_attr(5, "$MFT", false),
                Self::data_attr(&mft_runs, NTFS_MFT_RECORDS * NTFS_RECORD as u64),
            ],
        );
        builder.put_record(5, 0x03, &[Self::std_info_attr(), Self::file_name_attr(5, ".", true)]);
        builder.put_record(
            6,
            0x01,
            &[
                Self::file_name_attr(5, "$Bitmap", false),
                Self::data_attr(&[(NTFS_BITMAP_CLUSTER, 1)], (NTFS_TOTAL_SECTORS / 8) as u64),
            ],
        );
        builder
    }

    fn record_offset(number: u64) -> usize {
        NTFS_MFT_CLUSTER as usize * SECTOR + number as usize * NTFS_RECORD
    }

    fn resident_attr(attr_type: u32, content: &[u8]) -> Vec<u8> {
        let length = (0x18 + content.len()).div_ceil(8) * 8;
        let mut attr = vec![0u8; length];
        put_u32(&mut attr, 0, attr_type);
        put_u32(&mut attr, 4, length as u32);
        put_u16(&mut attr, 10, 0x18);
        put_u32(&mut attr, 16, content.len() as u32);
        put_u16(&mut attr, 20, 0x18);
        attr[0x18..0x18 + content.len()].copy_from_slice(content);
        attr
    }

    fn std_info_attr() -> Vec<u8> {
        let mut content = vec![0u8; 48];
        for i in 0..4 {
            put_u64(&mut content, i * 8, NTFS_TIMESTAMP);
        }
        Self::resident_attr(0x10, &content)
    }

    fn file_name_attr(parent: u64, name: &str, is_dir: bool) -> Vec<u8> {
        Self::resident_attr(0x30, &Self::file_name_content(parent, name, is_dir))
    }

    fn file_name_content(parent: u64, name: &str, is_dir: bool) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let mut content = vec![0u8; 66 + units.len() * 2];
        put_u64(&mut content, 0, parent | (1 << 48));
        for i in 0..4 {
            put_u64(&mut content, 8 + i * 8, NTFS_TIMESTAMP);
        }
        if is_dir {
            put_u32(&mut content, 56, 0x1000_0000);
        }
        content[64] = units.len() as u8;
        content[65] = 1;
        for (i, unit) in units.iter().enumerate() {
            put_u16(&mut content, 66 + i * 2, *unit);
        }
        content
    }

    fn data_attr(runs: &[(u64, u64)], size: u64) -> Vec<u8> {
        let mut pairs = Vec::new();
        let mut prev = 0i64;
        for &(lcn, count) in runs {
            pairs.push(0x42);
            pairs.extend_from_slice(&(count as u16).to_le_bytes());
            pairs.extend_from_slice(&((lcn as i64 - prev) as i32).to_le_bytes());
            prev = lcn as i64;
        }
        pairs.push(0);
        let clusters: u64 = runs.iter().map(|r| r.1).sum();
        Self::mapping_pairs_attr(0x80, &pairs, clusters, size)
    }

    fn mapping_pairs_attr(attr_type: u32, pairs: &[u8], clusters: u64, size: u64) -> Vec<u8> {
        let length = (0x40 + pairs.len()).div_ceil(8) * 8;
        let mut attr = vec![0u8; length];
        put_u32(&mut attr, 0, attr_type);
        put_u32(&mut attr, 4, length as u32);
        attr[8] = 1;
        put_u16(&mut attr, 10, 0x40);
        put_u64(&mut attr, 24, clusters.saturating_sub(1));
        put_u16(&mut attr, 32, 0x40);
        put_u64(&mut attr, 40, clusters * SECTOR as u64);
        put_u64(&mut attr, 48, size);
        put_u64(&mut attr, 56, size);
        attr[0x40..0x40 + pairs.len()].copy_from_slice(pairs);
        attr
    }

    fn put_record(&mut self, number: u64, flags: u16, attrs: &[Vec<u8>]) {
        let mut record = vec![0u8; NTFS_RECORD];
        record[0..4].copy_from_slice(b"FILE");
        put_u16(&mut record, 4, 0x30);
        put_u16(&mut record, 6, 3);
        put_u16(&mut record, 16, 1);
        put_u16(&mut record, 18, 1);
        put_u16(&mut record, 20, 0x38);
        put_u16(&mut record, 22, flags);
        put_u32(&mut record, 28, NTFS_RECORD as u32);
        put_u32(&mut record, 44, number as u32);

        let mut offset = 0x38;
        for attr in attrs {
            record[offset..offset + attr.len()].copy_from_slice(attr);
            offset += attr.len();
        }
        put_u32(&mut record, offset, 0xFFFF_FFFF);
        put_u32(&mut record, 24, (offset + 8) as u32);

        protect(&mut record, 0x30);
        let off = Self::record_offset(number);
        self.data[off..off + NTFS_RECORD].copy_from_slice(&record);
    }

    fn list_child(&mut self, parent: u64, number: u64, name: &str, is_dir: bool, deleted: bool) {
        self.children.entry(parent).or_default().push(NtfsChild {
            number,
            name: name.to_string(),
            is_dir,
            deleted,
        });
    }

    pub fn add_dir(&mut self, number: u64, parent: u64, name: &str) {
        self.put_record(
            number,
            0x03,
            &[Self::std_info_attr(), Self::file_name_attr(parent, name, true)],
        );
        self.dirs.insert(number, (parent, name.to_string()));
        self.list_child(parent, number, name, true, false);
    }

    pub fn write_clusters(&mut self, cluster: u64, bytes: &[u8]) {
        let off = cluster as usize * SECTOR;
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
    }

    pub fn add_file_runs(
        &mut self,
        number: u64,
        parent: u64,
        name: &str,
        runs: &[(u64, u64)],
        size: u64,
        deleted: bool,
    ) {
        if !deleted {
            for &(lcn, count) in runs {
                for cluster in lcn..lcn + count {
                    self.bitmap[cluster as usize] = true;
                }
            }
        }
        let flags = if deleted { 0 } else { 1 };
        self.put_record(
            number,
            flags,
            &[
                Self::std_info_attr(),
                Self::file_name_attr(parent, name, false),
                Self::data_attr(runs, size),
            ],
        );
        self.list_child(parent, number, name, false, deleted);
    }

    /// A deleted file whose `$DATA` carries the given mapping pairs verbatim.
    pub fn add_file_raw_runs(&mut self, number: u64, parent: u64, name: &str, pairs: &[u8], size: u64) {
        self.put_record(
            number,
            0,
            &[
                Self::std_info_attr(),
                Self::file_name_attr(parent, name, false),
                Self::mapping_pairs_attr(0x80, pairs, 1, size),
            ],
        );
        self.list_child(parent, number, name, false, true);
    }

    /// Content goes to fresh contiguous clusters. Returns the first cluster.
    pub fn add_file(
        &mut self,
        number: u64,
        parent: u64,
        name: &str,
        content: &[u8],
        deleted: bool,
    ) -> u64 {
        let count = (content.len() as u64).div_ceil(SECTOR as u64).max(1);
        let first = self.next_cluster;
        self.next_cluster += count;
        self.write_clusters(first, content);
        self.add_file_runs(number, parent, name, &[(first, count)], content.len() as u64, deleted);
        first
    }

    pub fn add_resident_file(
        &mut self,
        number: u64,
        parent: u64,
        name: &str,
        content: &[u8],
        deleted: bool,
    ) {
        let flags = if deleted { 0 } else { 1 };
        self.put_record(
            number,
            flags,
            &[
                Self::std_info_attr(),
                Self::file_name_attr(parent, name, false),
                Self::resident_attr(0x80, content),
            ],
        );
        self.list_child(parent, number, name, false, deleted);
    }

    /// Tear the record's second sector so its fixup no longer matches.
    pub fn break_fixup(&mut self, number: u64) {
        let off = Self::record_offset(number);
        if self.data[off..off + 4] != *b"FILE" {
            self.put_record(number, 0x01, &[Self::std_info_attr()]);
        }
        self.dirs.remove(&number);
        self.data[off + NTFS_RECORD - 2] ^= 0xFF;
    }

    fn index_entry(number: u64, parent: u64, name: &str, is_dir: bool) -> Vec<u8> {
        let content = Self::file_name_content(parent, name, is_dir);
        let length = (16 + content.len()).div_ceil(8) * 8;
        let mut entry = vec![0u8; length];
        put_u64(&mut entry, 0, number | (1 << 48));
        put_u16(&mut entry, 8, length as u16);
        put_u16(&mut entry, 10, content.len() as u16);
        entry[16..16 + content.len()].copy_from_slice(&content);
        entry
    }

    /// `INDX` block listing the live children; entries of deleted children
    /// follow the end marker, past the used size.
    fn index_block(dir: u64, children: &[NtfsChild]) -> Vec<u8> {
        const HEADER: usize = 0x18;
        let mut block = vec![0u8; NTFS_INDEX_BLOCK];
        block[0..4].copy_from_slice(b"INDX");
        put_u16(&mut block, 4, 0x28);
        put_u16(&mut block, 6, (NTFS_INDEX_BLOCK / SECTOR + 1) as u16);
        put_u32(&mut block, HEADER, 0x40 - HEADER as u32);

        let mut pos = 0x40;
        for child in children.iter().filter(|c| !c.deleted) {
            let entry = Self::index_entry(child.number, dir, &child.name, child.is_dir);
            block[pos..pos + entry.len()].copy_from_slice(&entry);
            pos += entry.len();
        }
        put_u16(&mut block, pos + 8, 16);
        put_u16(&mut block, pos + 12, 0x02);
        pos += 16;
        put_u32(&mut block, HEADER + 4, (pos - HEADER) as u32);
        put_u32(&mut block, HEADER + 8, (NTFS_INDEX_BLOCK - HEADER) as u32);

        for child in children.iter().filter(|c| c.deleted) {
            let entry = Self::index_entry(child.number, dir, &child.name, child.is_dir);
            block[pos..pos + entry.len()].copy_from_slice(&entry);
            pos += entry.len();
        }
        protect(&mut block, 0x28);
        block
    }

    /// `$INDEX_ROOT` holding only an end entry that points at VCN 0.
    fn index_root_attr() -> Vec<u8> {
        let mut content = vec![0u8; 56];
        put_u32(&mut content, 0, 0x30);
        put_u32(&mut content, 4, 1);
        put_u32(&mut content, 8, NTFS_INDEX_BLOCK as u32);
        content[12] = (NTFS_INDEX_BLOCK / SECTOR) as u8;
        put_u32(&mut content, 16, 16);
        put_u32(&mut content, 20, 40);
        put_u32(&mut content, 24, 40);
        content[28] = 1;
        put_u16(&mut content, 40, 24);
        put_u16(&mut content, 44, 0x03);
        Self::resident_attr(0x90, &content)
    }

    /// Give every directory with children an index block in fresh clusters.
    fn write_indexes(&mut self) {
        let clusters = (NTFS_INDEX_BLOCK / SECTOR) as u64;
        let dirs: Vec<(u64, (u64, String))> =
            self.dirs.iter().map(|(k, v)| (*k, v.clone())).collect();
        for (dir, (parent, name)) in dirs {
            let Some(children) = self.children.get(&dir) else {
                continue;
            };
            let block = Self::index_block(dir, children);
            let lcn = self.next_cluster;
            self.next_cluster += clusters;
            self.write_clusters(lcn, &block);
            for cluster in lcn..lcn + clusters {
                self.bitmap[cluster as usize] = true;
            }

            let mut pairs = vec![0x42];
            pairs.extend_from_slice(&(clusters as u16).to_le_bytes());
            pairs.extend_from_slice(&(lcn as i32).to_le_bytes());
            pairs.push(0);
            self.put_record(
                dir,
                0x03,
                &[
                    Self::std_info_attr(),
                    Self::file_name_attr(parent, &name, true),
                    Self::index_root_attr(),
                    Self::mapping_pairs_attr(0xA0, &pairs, clusters, NTFS_INDEX_BLOCK as u64),
                ],
            );
        }
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.write_indexes();
        let off = NTFS_BITMAP_CLUSTER as usize * SECTOR;
        for (cluster, used) in self.bitmap.iter().enumerate() {
            if *used {
                self.data[off + cluster / 8] |= 1 << (cluster % 8);
            }
        }
        self.data
    }

    pub fn finish(self) -> (DiskReader, EngineConfig) {
        (memory_reader(self.into_bytes(), "ntfs.img"), EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// EXT4

const EXT4_BLOCK: usize = 1024;
const EXT4_BLOCKS: usize = 1024;
const EXT4_INODES: u64 = 128;
const EXT4_INODE_SIZE: usize = 128;
const EXT4_BLOCK_BITMAP: usize = 3;
const EXT4_INODE_BITMAP: usize = 4;
const EXT4_INODE_TABLE: usize = 5;
const EXT4_ROOT_BLOCK: u64 = 21;
/// 2021-03-04T05:06:07Z
const EXT4_MTIME: u32 = 1_614_834_367;

struct Ext4DirEntry {
    inode: u64,
    name: String,
    file_type: u8,
    deleted: bool,
}

/// ext4 with 1 KiB blocks and a single block group. Directories hold one block.
pub struct Ext4ImageBuilder {
    data: Vec<u8>,
    next_block: u64,
    next_inode: u64,
    dirs: HashMap<u64, (u64, Vec<Ext4DirEntry>)>,
}

impl Ext4ImageBuilder {
    pub fn new() -> Self {
        let mut data = vec![0u8; EXT4_BLOCKS * EXT4_BLOCK];
        let sb = 1024;
        put_u32(&mut data, sb, EXT4_INODES as u32);
        put_u32(&mut data, sb + 4, EXT4_BLOCKS as u32);
        put_u32(&mut data, sb + 20, 1);
        put_u32(&mut data, sb + 24, 0);
        put_u32(&mut data, sb + 32, 8192);
        put_u32(&mut data, sb + 40, EXT4_INODES as u32);
        put_u16(&mut data, sb + 56, 0xEF53);
        put_u32(&mut data, sb + 76, 1);
        put_u32(&mut data, sb + 84, 11);
        put_u16(&mut data, sb + 88, EXT4_INODE_SIZE as u16);
        put_u32(&mut data, sb + 96, 0x40);

        let gdt = 2 * EXT4_BLOCK;
        put_u32(&mut data, gdt, EXT4_BLOCK_BITMAP as u32);
        put_u32(&mut data, gdt + 4, EXT4_INODE_BITMAP as u32);
        put_u32(&mut data, gdt + 8, EXT4_INODE_TABLE as u32);

        let mut builder = Ext4ImageBuilder {
            data,
            next_block: EXT4_ROOT_BLOCK + 1,
            next_inode: 11,
            dirs: HashMap::new(),
        };
        for block in 1..=EXT4_ROOT_BLOCK {
            builder.set_block_used(block, true);
        }
        for ino in 1..=10 {
            builder.set_inode_used(ino, true);
        }
        builder.write_inode(2, 0x41ED, 2, EXT4_BLOCK as u64, &[(EXT4_ROOT_BLOCK, 1)], false);
        builder.dirs.insert(2, (EXT4_ROOT_BLOCK, Vec::new()));
        builder.write_dir(2, 2);
        builder
    }

    fn set_block_used(&mut self, block: u64, used: bool) {
        let bit = (block - 1) as usize;
        let off = EXT4_BLOCK_BITMAP * EXT4_BLOCK + bit / 8;
        if used {
            self.data[off] |= 1 << (bit % 8);
        } else {
            self.data[off] &= !(1 << (bit % 8));
        }
    }

    fn set_inode_used(&mut self, ino: u64, used: bool) {
        let bit = (ino - 1) as usize;
        let off = EXT4_INODE_BITMAP * EXT4_BLOCK + bit / 8;
        if used {
            self.data[off] |= 1 << (bit % 8);
        } else {
            self.data[off] &= !(1 << (bit % 8));
        }
    }

    fn inode_offset(ino: u64) -> usize {
        EXT4_INODE_TABLE * EXT4_BLOCK + (ino as usize - 1) * EXT4_INODE_SIZE
    }

    /// Writes an inode whose data lives in one extent per `(block, count)` run.
    fn write_inode(&mut self, ino: u64, mode: u16, links: u16, size: u64, runs: &[(u64, u64)], deleted: bool) {
        let off = Self::inode_offset(ino);
        let raw = &mut self.data[off..off + EXT4_INODE_SIZE];
        put_u16(raw, 0, mode);
        put_u32(raw, 4, size as u32);
        put_u32(raw, 16, EXT4_MTIME);
        put_u32(raw, 20, if deleted { EXT4_MTIME + 60 } else { 0 });
        put_u16(raw, 26, if deleted { 0 } else { links });
        put_u32(raw, 32, 0x80000);
        put_u32(raw, 108, (size >> 32) as u32);

        put_u16(raw, 40, 0xF30A);
        put_u16(raw, 42, runs.len() as u16);
        put_u16(raw, 44, 4);
        let mut logical = 0u32;
        for (i, &(block, count)) in runs.iter().enumerate() {
            let entry = 52 + i * 12;
            put_u32(raw, entry, logical);
            put_u16(raw, entry + 4, count as u16);
            put_u32(raw, entry + 8, block as u32);
            logical += count as u32;
        }
    }

    /// Entries are laid out back to back. Each live entry's record length
    /// runs up to the next live entry, so deleted ones sit in its slack.
    fn write_dir(&mut self, ino: u64, parent: u64) {
        let Some((block, entries)) = self.dirs.get(&ino) else {
            return;
        };
        let mut all = vec![
            (ino, ".".to_string(), 2u8, false),
            (parent, "..".to_string(), 2u8, false),
        ];
        all.extend(entries.iter().map(|e| (e.inode, e.name.clone(), e.file_type, e.deleted)));

        let mut offsets = Vec::with_capacity(all.len());
        let mut pos = 0;
        for (_, name, _, _) in &all {
            offsets.push(pos);
            pos += (8 + name.len()).div_ceil(4) * 4;
        }

        let start = *block as usize * EXT4_BLOCK;
        let buf = &mut self.data[start..start + EXT4_BLOCK];
        buf.fill(0);
        for (i, (inode, name, file_type, deleted)) in all.iter().enumerate() {
            let off = offsets[i];
            let actual = (8 + name.len()).div_ceil(4) * 4;
            let rec_len = if *deleted {
                actual
            } else {
                (i + 1..all.len())
                    .find(|&j| !all[j].3)
                    .map(|j| offsets[j])
                    .unwrap_or(EXT4_BLOCK)
                    - off
            };
            put_u32(buf, off, *inode as u32);
            put_u16(buf, off + 4, rec_len as u16);
            buf[off + 6] = name.len() as u8;
            buf[off + 7] = *file_type;
            buf[off + 8..off + 8 + name.len()].copy_from_slice(name.as_bytes());
        }
    }

    fn parent_of(&self, dir: u64) -> u64 {
        self.dirs
            .iter()
            .find_map(|(parent, (_, entries))| {
                entries
                    .iter()
                    .any(|e| e.inode == dir && e.file_type == 2)
                    .then_some(*parent)
            })
            .unwrap_or(2)
    }

    fn link(&mut self, dir: u64, inode: u64, name: &str, file_type: u8, deleted: bool) {
        if let Some((_, entries)) = self.dirs.get_mut(&dir) {
            entries.push(Ext4DirEntry {
                inode,
                name: name.to_string(),
                file_type,
                deleted,
            });
        }
        let parent = self.parent_of(dir);
        self.write_dir(dir, parent);
    }

    pub fn add_dir(&mut self, parent: u64, name: &str) -> u64 {
        let ino = self.next_inode;
        self.next_inode += 1;
        let block = self.next_block;
        self.next_block += 1;
        self.set_inode_used(ino, true);
        self.set_block_used(block, true);
        self.write_inode(ino, 0x41ED, 2, EXT4_BLOCK as u64, &[(block, 1)], false);
        self.dirs.insert(ino, (block, Vec::new()));
        self.link(parent, ino, name, 2, false);
        self.write_dir(ino, parent);
        ino
    }

    fn store(&mut self, content: &[u8], deleted: bool) -> (u64, u64) {
        let count = (content.len() as u64).div_ceil(EXT4_BLOCK as u64).max(1);
        let first = self.next_block;
        self.next_block += count;
        let off = first as usize * EXT4_BLOCK;
        self.data[off..off + content.len()].copy_from_slice(content);
        for block in first..first + count {
            self.set_block_used(block, !deleted);
        }
        (first, count)
    }

    /// Deleted files keep their extent tree. Returns the inode number.
    pub fn add_file(&mut self, parent: Option<u64>, name: &str, content: &[u8], deleted: bool) -> u64 {
        let ino = self.next_inode;
        self.next_inode += 1;
        let (first, count) = self.store(content, deleted);
        self.set_inode_used(ino, !deleted);
        self.write_inode(ino, 0x81A4, 1, content.len() as u64, &[(first, count)], deleted);
        if let Some(dir) = parent {
            self.link(dir, ino, name, 1, deleted);
        }
        ino
    }

    /// An unlinked file addressed through direct block pointers.
    pub fn add_blockmap_file(&mut self, content: &[u8], deleted: bool) -> u64 {
        let ino = self.add_file(None, "", content, deleted);
        let first = self.next_block - (content.len() as u64).div_ceil(EXT4_BLOCK as u64).max(1);
        let off = Self::inode_offset(ino);
        let raw = &mut self.data[off..off + EXT4_INODE_SIZE];
        put_u32(raw, 32, 0);
        raw[40..100].fill(0);
        let count = (content.len() as u64).div_ceil(EXT4_BLOCK as u64);
        for i in 0..count {
            put_u32(raw, 40 + i as usize * 4, (first + i) as u32);
        }
        ino
    }

    /// Claim a 64-bit filesystem far larger than the image.
    pub fn inflate_geometry(&mut self) {
        let sb = 1024;
        put_u32(&mut self.data, sb + 96, 0x40 | 0x80);
        put_u32(&mut self.data, sb + 336, 1 << 18);
        put_u16(&mut self.data, sb + 254, 64);
    }

    pub fn set_inode_table(&mut self, block: u32) {
        put_u32(&mut self.data, 2 * EXT4_BLOCK + 8, block);
    }

    pub fn finish(self) -> (DiskReader, EngineConfig) {
        (memory_reader(self.data, "ext4.img"), EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// HFS+

const HFS_BLOCK: usize = 512;
const HFS_TOTAL_BLOCKS: u64 = 512;
const HFS_ALLOCATION_BLOCK: u64 = 4;
const HFS_CATALOG_BLOCK: u64 = 8;
const HFS_NODE: usize = 4096;
const HFS_NODES: u64 = 4;
const HFS_DATA_BLOCK: u64 = HFS_CATALOG_BLOCK + HFS_NODES * (HFS_NODE / HFS_BLOCK) as u64;
/// 2024-01-01T00:00:00Z in seconds since 1904.
const HFS_DATE: u32 = 3_786_912_000;

enum HfsBody {
    Folder { id: u32 },
    File { id: u32, start: u64, blocks: u64, size: u64 },
}

struct HfsRecord {
    parent: u32,
    name: String,
    body: HfsBody,
    live: bool,
}

impl HfsRecord {
    fn encode(&self) -> Vec<u8> {
        let units: Vec<u16> = self.name.encode_utf16().collect();
        let mut raw = vec![0u8; 8 + units.len() * 2];
        put_be_u16(&mut raw, 0, (6 + units.len() * 2) as u16);
        put_be_u32(&mut raw, 2, self.parent);
        put_be_u16(&mut raw, 6, units.len() as u16);
        for (i, unit) in units.iter().enumerate() {
            put_be_u16(&mut raw, 8 + i * 2, *unit);
        }
        let mut body = match self.body {
            HfsBody::Folder { id } => {
                let mut body = vec![0u8; 88];
                put_be_u16(&mut body, 0, 1);
                put_be_u32(&mut body, 8, id);
                body
            }
            HfsBody::File { id, start, blocks, size } => {
                let mut body = vec![0u8; 248];
                put_be_u16(&mut body, 0, 2);
                put_be_u32(&mut body, 8, id);
                put_be_u32(&mut body, 12, HFS_DATE);
                put_be_u32(&mut body, 16, HFS_DATE);
                put_be_u64(&mut body, 88, size);
                put_be_u32(&mut body, 88 + 12, blocks as u32);
                put_be_u32(&mut body, 88 + 16, start as u32);
                put_be_u32(&mut body, 88 + 20, blocks as u32);
                body
            }
        };
        raw.append(&mut body);
        raw
    }
}

/// HFS+ with 512-byte blocks and a catalog of one 4 KiB leaf node. Deleted
/// files become stale records in that leaf's free space.
pub struct HfsImageBuilder {
    data: Vec<u8>,
    records: Vec<HfsRecord>,
    next_id: u32,
    next_block: u64,
    break_leaf: bool,
}

impl HfsImageBuilder {
    pub fn new() -> Self {
        let mut data = vec![0u8; HFS_TOTAL_BLOCKS as usize * HFS_BLOCK];
        let vh = 1024;
        put_be_u16(&mut data, vh, 0x482B);
        put_be_u16(&mut data, vh + 2, 4);
        put_be_u32(&mut data, vh + 40, HFS_BLOCK as u32);
        put_be_u32(&mut data, vh + 44, HFS_TOTAL_BLOCKS as u32);

        let alloc = vh + 112;
        put_be_u64(&mut data, alloc, HFS_TOTAL_BLOCKS / 8);
        put_be_u32(&mut data, alloc + 12, 1);
        put_be_u32(&mut data, alloc + 16, HFS_ALLOCATION_BLOCK as u32);
        put_be_u32(&mut data, alloc + 20, 1);

        let catalog_blocks = HFS_DATA_BLOCK - HFS_CATALOG_BLOCK;
        let catalog = vh + 272;
        put_be_u64(&mut data, catalog, HFS_NODES * HFS_NODE as u64);
        put_be_u32(&mut data, catalog + 12, catalog_blocks as u32);
        put_be_u32(&mut data, catalog + 16, HFS_CATALOG_BLOCK as u32);
        put_be_u32(&mut data, catalog + 20, catalog_blocks as u32);

        let mut builder = HfsImageBuilder {
            data,
            records: Vec::new(),
            next_id: 16,
            next_block: HFS_DATA_BLOCK,
            break_leaf: false,
        };
        for block in 0..HFS_DATA_BLOCK {
            builder.set_allocated(block);
        }
        builder.records.push(HfsRecord {
            parent: 1,
            name: "Macintosh HD".to_string(),
            body: HfsBody::Folder { id: 2 },
            live: true,
        });
        builder
    }

    fn set_allocated(&mut self, block: u64) {
        let off = HFS_ALLOCATION_BLOCK as usize * HFS_BLOCK + block as usize / 8;
        self.data[off] |= 0x80 >> (block % 8);
    }

    pub fn add_folder(&mut self, parent: u32, name: &str) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.records.push(HfsRecord {
            parent,
            name: name.to_string(),
            body: HfsBody::Folder { id },
            live: true,
        });
        id
    }

    pub fn add_file(&mut self, parent: u32, name: &str, content: &[u8], live: bool) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        let blocks = (content.len() as u64).div_ceil(HFS_BLOCK as u64).max(1);
        let start = self.next_block;
        self.next_block += blocks;
        let off = start as usize * HFS_BLOCK;
        self.data[off..off + content.len()].copy_from_slice(content);
        if live {
            for block in start..start + blocks {
                self.set_allocated(block);
            }
        }
        self.records.push(HfsRecord {
            parent,
            name: name.to_string(),
            body: HfsBody::File {
                id,
                start,
                blocks,
                size: content.len() as u64,
            },
            live,
        });
        id
    }

    /// Claims a logical size beyond what the fork's extents hold.
    pub fn inflate_logical_size(&mut self, id: u32, new_size: u64) {
        for record in &mut self.records {
            if let HfsBody::File { id: file_id, size, .. } = &mut record.body {
                if *file_id == id {
                    *size = new_size;
                }
            }
        }
    }

    pub fn break_leaf_offsets(&mut self) {
        self.break_leaf = true;
    }

    pub fn finish(mut self) -> (DiskReader, EngineConfig) {
        let catalog = HFS_CATALOG_BLOCK as usize * HFS_BLOCK;

        let header = &mut self.data[catalog..catalog + HFS_NODE];
        header[8] = 1;
        put_be_u16(header, 10, 3);
        put_be_u16(header, 14, 1);
        put_be_u32(header, 16, 1);
        put_be_u32(header, 20, self.records.iter().filter(|r| r.live).count() as u32);
        put_be_u32(header, 24, 1);
        put_be_u32(header, 28, 1);
        put_be_u16(header, 32, HFS_NODE as u16);
        put_be_u16(header, 34, 516);
        put_be_u32(header, 36, HFS_NODES as u32);
        put_be_u32(header, 40, (HFS_NODES - 2) as u32);

        let leaf_start = catalog + HFS_NODE;
        let leaf = &mut self.data[leaf_start..leaf_start + HFS_NODE];
        leaf[8] = 0xFF;
        leaf[9] = 1;
        let mut offsets = Vec::new();
        let mut pos = 14;
        for record in self.records.iter().filter(|r| r.live) {
            let raw = record.encode();
            offsets.push(pos);
            leaf[pos..pos + raw.len()].copy_from_slice(&raw);
            pos += raw.len();
        }
        offsets.push(pos);
        put_be_u16(leaf, 10, (offsets.len() - 1) as u16);
        for (i, offset) in offsets.iter().enumerate() {
            put_be_u16(leaf, HFS_NODE - 2 * (i + 1), *offset as u16);
        }
        if self.break_leaf {
            put_be_u16(leaf, HFS_NODE - 2, 2);
        }

        pos += 64;
        for record in self.records.iter().filter(|r| !r.live) {
            let raw = record.encode();
            leaf[pos..pos + raw.len()].copy_from_slice(&raw);
            pos += raw.len() + 6;
        }

        (memory_reader(self.data, "hfsplus.img"), EngineConfig::default())
    }
}
