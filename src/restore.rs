//! Restore Writer
//! Streams candidate content to a destination off the source volume

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use rayon::prelude::*;

use crate::disk_reader::DiskReader;
use crate::error::{RecoveryError, Result};
use crate::types::{CandidateEntry, RestoreJob, RestoreOutcome};

const COPY_CHUNK: usize = 1024 * 1024;
const MAX_NAME_SUFFIX: u32 = 10_000;

/// Nearest existing path at or above `path`.
fn nearest_existing(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.exists() {
            return Some(candidate.to_path_buf());
        }
        current = candidate.parent();
    }
    None
}

/// Fails with `DestinationOnSourceVolume` when `destination` resolves onto
/// the volume `reader` reads from.
pub fn check_destination(reader: &DiskReader, destination: &Path) -> Result<()> {
    let conflict = || RecoveryError::DestinationOnSourceVolume(destination.to_path_buf());
    let Some(existing) = nearest_existing(destination) else {
        return Ok(());
    };

    if let (Ok(dest), Ok(source)) = (existing.canonicalize(), reader.path().canonicalize()) {
        if dest == source {
            return Err(conflict());
        }
    }

    #[cfg(unix)]
    {
        use crate::types::DeviceIdentity;
        use std::os::unix::fs::MetadataExt;
        let metadata = fs::metadata(&existing).map_err(|e| RecoveryError::from_open(&existing, e))?;
        match reader.identity() {
            DeviceIdentity::Device { rdev } if metadata.dev() == rdev => return Err(conflict()),
            DeviceIdentity::ImageFile { dev, ino } if metadata.dev() == dev && metadata.ino() == ino => {
                return Err(conflict())
            }
            _ => {}
        }
    }
    Ok(())
}

/// File name for a restored entry, stripped of path separators and reserved characters.
pub fn output_name(entry: &CandidateEntry) -> String {
    let cleaned: String = entry
        .display_name()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').to_string();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return entry.id.locator.to_string();
    }
    cleaned
}

/// Create a new file, adding ` (n)` before the extension while names collide.
fn create_unique(dir: &Path, name: &str) -> io::Result<(PathBuf, File)> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    for n in 0..MAX_NAME_SUFFIX {
        let file_name = match (n, ext) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{} ({}).{}", stem, n, ext),
            (n, None) => format!("{} ({})", stem, n),
        };
        let path = dir.join(file_name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(ErrorKind::AlreadyExists, format!("no free name for {}", name)))
}

fn file_crc(path: &Path) -> io::Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Write one entry's extents, in order, into `file`. Overwritten or
/// unreadable extents are zero-filled so later offsets stay put.
fn copy_extents(
    reader: &DiskReader,
    entry: &CandidateEntry,
    file: File,
    job: &mut RestoreJob,
) -> io::Result<u32> {
    let ss = reader.sector_size();
    let mut out = BufWriter::new(file);
    let mut hasher = crc32fast::Hasher::new();
    let mut remaining = entry.size;

    for extent in &entry.extents {
        if remaining == 0 {
            break;
        }
        let length = extent.length.min(remaining);
        let mut done = 0u64;
        let mut zero_filled = extent.overwritten;
        while done < length {
            let len = (length - done).min(COPY_CHUNK as u64) as usize;
            let chunk = if zero_filled {
                vec![0u8; len]
            } else {
                match reader.read_bytes(extent.start_byte(ss) + done, len) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Restore of {}: sector {} unreadable: {}", entry.id, extent.start_sector, e);
                        job.notes.push(format!("unreadable extent at sector {} zero-filled", extent.start_sector));
                        job.low_confidence = true;
                        zero_filled = true;
                        vec![0u8; len]
                    }
                }
            };
            out.write_all(&chunk)?;
            hasher.update(&chunk);
            done += len as u64;
        }
        if extent.overwritten {
            job.notes.push(format!("overwritten extent at sector {} zero-filled", extent.start_sector));
            job.low_confidence = true;
        }
        job.bytes_written += length;
        remaining -= length;
    }

    let file = out.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(hasher.finalize())
}

/// Restore one entry into `dest_dir`. Failures are reported on the job, never raised.
pub fn restore_entry(reader: &DiskReader, entry: &CandidateEntry, dest_dir: &Path) -> RestoreJob {
    let name = output_name(entry);
    let (path, file) = match create_unique(dest_dir, &name) {
        Ok(created) => created,
        Err(e) => return RestoreJob::pending(entry.id, dest_dir.join(&name)).fail(e.to_string()),
    };
    let mut job = RestoreJob::pending(entry.id, path.clone());

    let written = match copy_extents(reader, entry, file, &mut job) {
        Ok(crc) => crc,
        Err(e) => {
            let _ = fs::remove_file(&path);
            return job.fail(format!("write failed: {}", e));
        }
    };

    match file_crc(&path) {
        Ok(read_back) if read_back == written => {}
        Ok(read_back) => {
            let _ = fs::remove_file(&path);
            return job.fail(format!(
                "verification failed: wrote {:08x}, read back {:08x}",
                written, read_back
            ));
        }
        Err(e) => {
            let _ = fs::remove_file(&path);
            return job.fail(format!("verification read failed: {}", e));
        }
    }

    if let Some(stored) = entry.checksum {
        if stored != written {
            warn!("Restore of {}: content changed since the scan", entry.id);
            job.notes.push(format!(
                "checksum differs from scan time ({:08x} vs {:08x})",
                stored, written
            ));
            job.low_confidence = true;
        }
    }

    job.checksum = Some(written);
    job.outcome = RestoreOutcome::Succeeded;
    job
}

/// Restore a batch on a bounded pool. A destination on the source volume
/// fails every job before anything is written.
pub fn restore_batch(
    reader: &DiskReader,
    entries: &[CandidateEntry],
    dest_dir: &Path,
    workers: usize,
) -> Vec<RestoreJob> {
    let fail_all = |reason: String| -> Vec<RestoreJob> {
        entries
            .iter()
            .map(|entry| RestoreJob::pending(entry.id, dest_dir.to_path_buf()).fail(reason.clone()))
            .collect()
    };

    if let Err(e) = check_destination(reader, dest_dir) {
        warn!("Restore refused: {}", e);
        return fail_all(e.to_string());
    }
    if let Err(e) = fs::create_dir_all(dest_dir) {
        return fail_all(format!("cannot create {}: {}", dest_dir.display(), e));
    }

    info!("Restoring {} entries to {}", entries.len(), dest_dir.display());
    let run = || -> Vec<RestoreJob> {
        entries
            .par_iter()
            .map(|entry| restore_entry(reader, entry, dest_dir))
            .collect()
    };
    match rayon::ThreadPoolBuilder::new().num_threads(workers.max(1)).build() {
        Ok(pool) => pool.install(run),
        Err(e) => {
            warn!("Restore pool unavailable ({}), restoring inline", e);
            entries.iter().map(|entry| restore_entry(reader, entry, dest_dir)).collect()
        }
    }
}
