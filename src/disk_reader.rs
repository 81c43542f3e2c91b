//! Raw Volume Reader Module
//! Read-only sector access to block devices and disk images for data recovery.
//!
//! Every read is positional (explicit offset, explicit length) so a single
//! `DiskReader` can be shared by any number of scan workers.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, Result};
use crate::types::DeviceIdentity;

#[cfg(windows)]
use std::os::windows::fs::OpenOptionsExt;

pub const DEFAULT_SECTOR_SIZE: u32 = 512;
const MBR_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_TABLE_OFFSET: usize = 446;

/// Anything that can serve bytes at an absolute offset without a cursor.
pub trait SectorSource: Send + Sync {
    /// Fill `buf` from `offset`. Short sources fail with `UnexpectedEof`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Total length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Disk image mapped into memory.
pub struct MappedImage {
    map: Mmap,
}

impl MappedImage {
    pub fn new(file: &File) -> io::Result<Self> {
        // SAFETY: the mapping is read-only; the image is not modified by this process.
        let map = unsafe { Mmap::map(file)? };
        Ok(MappedImage { map })
    }
}

impl SectorSource for MappedImage {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        copy_from_slice_at(&self.map, offset, buf)
    }

    fn len(&self) -> u64 {
        self.map.len() as u64
    }
}

/// Block device read through positional reads on the handle.
pub struct RawDevice {
    file: File,
    size: u64,
}

impl SectorSource for RawDevice {
    #[cfg(unix)]
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut done = 0usize;
        while done < buf.len() {
            let n = self.file.seek_read(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
            done += n;
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.size
    }
}

/// In-memory volume. Used by embedders that already hold an image in RAM,
/// and by tests, which can make chosen byte ranges fail a number of times.
pub struct MemoryImage {
    data: Vec<u8>,
    faults: Mutex<Vec<InjectedFault>>,
}

struct InjectedFault {
    start: u64,
    end: u64,
    remaining: u32,
}

impl MemoryImage {
    pub fn new(data: Vec<u8>) -> Self {
        MemoryImage {
            data,
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Make reads touching `[start, start + len)` fail `times` times.
    pub fn inject_fault(&self, start: u64, len: u64, times: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push(InjectedFault {
                start,
                end: start + len,
                remaining: times,
            });
        }
    }
}

impl SectorSource for MemoryImage {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let end = offset + buf.len() as u64;
        if let Ok(mut faults) = self.faults.lock() {
            for fault in faults.iter_mut() {
                if fault.remaining > 0 && offset < fault.end && end > fault.start {
                    fault.remaining -= 1;
                    return Err(io::Error::new(io::ErrorKind::Other, "injected read fault"));
                }
            }
        }
        copy_from_slice_at(&self.data, offset, buf)
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

fn copy_from_slice_at(data: &[u8], offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let start = usize::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::UnexpectedEof))?;
    let end = start
        .checked_add(buf.len())
        .filter(|end| *end <= data.len())
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
    buf.copy_from_slice(&data[start..end]);
    Ok(())
}

/// Logical sector sizes a reader can be switched to.
pub fn is_supported_sector_size(size: u32) -> bool {
    size.is_power_of_two() && (512..=4096).contains(&size)
}

/// A primary partition found in an MBR.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub index: u32,
    pub bootable: bool,
    pub partition_type: u8,
    pub start_lba: u64,
    pub sector_count: u64,
}

/// Read-only view of one volume: a whole source, or a partition inside it.
pub struct DiskReader {
    source: Arc<dyn SectorSource>,
    base_offset: u64,
    length: u64,
    sector_size: u32,
    path: PathBuf,
    identity: DeviceIdentity,
}

impl fmt::Debug for DiskReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskReader")
            .field("path", &self.path)
            .field("base_offset", &self.base_offset)
            .field("length", &self.length)
            .field("sector_size", &self.sector_size)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl DiskReader {
    /// Open a block device or disk image for reading. Never opens for write.
    /// For Windows: device paths look like "\\.\PhysicalDrive0" or "\\.\C:".
    pub fn open(path: &Path) -> Result<Self> {
        let (source, identity) = open_source(path)?;
        if source.is_empty() {
            return Err(RecoveryError::UnsupportedMedium(format!(
                "{} is empty",
                path.display()
            )));
        }
        let length = source.len();
        debug!("Opened {} ({} bytes, {:?})", path.display(), length, identity);

        Ok(DiskReader {
            source,
            base_offset: 0,
            length,
            sector_size: DEFAULT_SECTOR_SIZE,
            path: path.to_path_buf(),
            identity,
        })
    }

    /// Wrap an already-constructed source (in-memory images, custom devices).
    pub fn from_source(source: Arc<dyn SectorSource>, label: impl Into<PathBuf>) -> Self {
        let length = source.len();
        DiskReader {
            source,
            base_offset: 0,
            length,
            sector_size: DEFAULT_SECTOR_SIZE,
            path: label.into(),
            identity: DeviceIdentity::Detached,
        }
    }

    /// Same source, different logical sector size.
    pub fn with_sector_size(mut self, sector_size: u32) -> Result<Self> {
        if !is_supported_sector_size(sector_size) {
            return Err(RecoveryError::UnsupportedMedium(format!(
                "unsupported sector size {}",
                sector_size
            )));
        }
        self.sector_size = sector_size;
        Ok(self)
    }

    /// View restricted to one partition, sharing the underlying source.
    pub fn partition(&self, entry: &PartitionEntry) -> Result<DiskReader> {
        let start = entry.start_lba * DEFAULT_SECTOR_SIZE as u64;
        let length = entry.sector_count * DEFAULT_SECTOR_SIZE as u64;
        if start + length > self.length {
            return Err(RecoveryError::OutOfRange {
                start: entry.start_lba,
                count: entry.sector_count,
                total: self.length / DEFAULT_SECTOR_SIZE as u64,
            });
        }
        Ok(DiskReader {
            source: Arc::clone(&self.source),
            base_offset: self.base_offset + start,
            length,
            sector_size: DEFAULT_SECTOR_SIZE,
            path: self.path.clone(),
            identity: self.identity,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    /// Get total volume size in bytes
    pub fn size(&self) -> u64 {
        self.length
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Get total number of whole sectors
    pub fn total_sectors(&self) -> u64 {
        self.length / self.sector_size as u64
    }

    /// Read `count` sectors starting at `start`.
    pub fn read_sectors(&self, start: u64, count: u64) -> Result<Vec<u8>> {
        let total = self.total_sectors();
        if count == 0 || start.checked_add(count).map_or(true, |end| end > total) {
            return Err(RecoveryError::OutOfRange { start, count, total });
        }
        let len = usize::try_from(count * self.sector_size as u64).map_err(|_| {
            RecoveryError::OutOfRange { start, count, total }
        })?;
        let mut buffer = vec![0u8; len];
        self.read_at(start * self.sector_size as u64, &mut buffer)?;
        Ok(buffer)
    }

    /// Read `len` bytes at a byte offset inside the volume. The span is
    /// checked before the buffer is allocated.
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_span(offset, len as u64)?;
        let mut buffer = vec![0u8; len];
        self.read_at(offset, &mut buffer)?;
        Ok(buffer)
    }

    fn check_span(&self, offset: u64, len: u64) -> Result<()> {
        let end = offset.checked_add(len);
        if end.map_or(true, |end| end > self.length) {
            let ss = self.sector_size as u64;
            return Err(RecoveryError::OutOfRange {
                start: offset / ss,
                count: len.div_ceil(ss),
                total: self.total_sectors(),
            });
        }
        Ok(())
    }

    /// Fill `buf` from a byte offset inside the volume. A failing read is
    /// retried once before the error is surfaced.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_span(offset, buf.len() as u64)?;

        let absolute = self.base_offset + offset;
        match self.source.read_exact_at(absolute, buf) {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(
                    "Read of {} bytes at offset {} failed ({}), retrying once",
                    buf.len(),
                    offset,
                    first
                );
                self.source
                    .read_exact_at(absolute, buf)
                    .map_err(|source| RecoveryError::Io { offset, source })
            }
        }
    }

    /// Parse the MBR partition table at sector 0, if there is one.
    pub fn list_partitions(&self) -> Result<Vec<PartitionEntry>> {
        let sector = self.read_bytes(0, 512)?;
        Ok(parse_mbr(&sector, self.length / DEFAULT_SECTOR_SIZE as u64))
    }
}

/// Decode the four primary MBR entries, keeping the plausible ones.
pub fn parse_mbr(sector: &[u8], disk_sectors: u64) -> Vec<PartitionEntry> {
    let mut partitions = Vec::new();
    if sector.len() < 512 || sector[510..512] != MBR_SIGNATURE {
        return partitions;
    }

    for index in 0..4 {
        let entry = &sector[MBR_TABLE_OFFSET + index * 16..MBR_TABLE_OFFSET + (index + 1) * 16];
        let status = entry[0];
        let partition_type = entry[4];
        let start_lba = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]) as u64;
        let sector_count = u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]) as u64;

        if partition_type == 0 || (status != 0x00 && status != 0x80) {
            continue;
        }
        if start_lba == 0 || sector_count == 0 || start_lba + sector_count > disk_sectors {
            continue;
        }

        partitions.push(PartitionEntry {
            index: index as u32,
            bootable: status == 0x80,
            partition_type,
            start_lba,
            sector_count,
        });
    }

    partitions
}

#[cfg(unix)]
fn open_source(path: &Path) -> Result<(Arc<dyn SectorSource>, DeviceIdentity)> {
    use std::io::{Seek, SeekFrom};
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let mut file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| RecoveryError::from_open(path, e))?;
    let metadata = file.metadata().map_err(|e| RecoveryError::from_open(path, e))?;
    let file_type = metadata.file_type();

    if file_type.is_block_device() || file_type.is_char_device() {
        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|source| RecoveryError::Io { offset: 0, source })?;
        let identity = DeviceIdentity::Device {
            rdev: metadata.rdev(),
        };
        Ok((Arc::new(RawDevice { file, size }), identity))
    } else if file_type.is_file() {
        let identity = DeviceIdentity::ImageFile {
            dev: metadata.dev(),
            ino: metadata.ino(),
        };
        if metadata.len() == 0 {
            return Ok((Arc::new(MemoryImage::new(Vec::new())), identity));
        }
        let image = MappedImage::new(&file).map_err(|e| RecoveryError::from_open(path, e))?;
        Ok((Arc::new(image), identity))
    } else {
        Err(RecoveryError::UnsupportedMedium(format!(
            "{} is not a block device or image file",
            path.display()
        )))
    }
}

#[cfg(windows)]
fn open_source(path: &Path) -> Result<(Arc<dyn SectorSource>, DeviceIdentity)> {
    use windows_sys::Win32::Storage::FileSystem::{FILE_SHARE_READ, FILE_SHARE_WRITE};

    let is_device = path.to_string_lossy().starts_with(r"\\.\");
    let file = OpenOptions::new()
        .read(true)
        .share_mode(FILE_SHARE_READ | FILE_SHARE_WRITE)
        .open(path)
        .map_err(|e| RecoveryError::from_open(path, e))?;

    if is_device {
        let size = device_length(&file, path)?;
        return Ok((Arc::new(RawDevice { file, size }), DeviceIdentity::Detached));
    }

    let metadata = file.metadata().map_err(|e| RecoveryError::from_open(path, e))?;
    if !metadata.is_file() {
        return Err(RecoveryError::UnsupportedMedium(format!(
            "{} is not a device or image file",
            path.display()
        )));
    }
    if metadata.len() == 0 {
        return Ok((Arc::new(MemoryImage::new(Vec::new())), DeviceIdentity::Detached));
    }
    let image = MappedImage::new(&file).map_err(|e| RecoveryError::from_open(path, e))?;
    Ok((Arc::new(image), DeviceIdentity::Detached))
}

/// Get device length using the Windows length ioctl
#[cfg(windows)]
fn device_length(file: &File, path: &Path) -> Result<u64> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::System::Ioctl::{GET_LENGTH_INFORMATION, IOCTL_DISK_GET_LENGTH_INFO};
    use windows_sys::Win32::System::IO::DeviceIoControl;

    let mut info = GET_LENGTH_INFORMATION { Length: 0 };
    let mut returned: u32 = 0;
    // SAFETY: the handle is valid for the lifetime of `file` and the output
    // buffer is a properly sized GET_LENGTH_INFORMATION.
    let ok = unsafe {
        DeviceIoControl(
            file.as_raw_handle() as _,
            IOCTL_DISK_GET_LENGTH_INFO,
            std::ptr::null(),
            0,
            &mut info as *mut _ as *mut _,
            std::mem::size_of::<GET_LENGTH_INFORMATION>() as u32,
            &mut returned,
            std::ptr::null_mut(),
        )
    };
    if ok != 0 && info.Length > 0 {
        return Ok(info.Length as u64);
    }
    Err(RecoveryError::UnsupportedMedium(format!(
        "could not determine size of {}",
        path.display()
    )))
}
