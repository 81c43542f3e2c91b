//! Structure and checksum self-checks over reconstructed file content

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::disk_reader::DiskReader;
use crate::types::{Extent, SourceKind, StructuralCheck};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const ZIP_EOCD: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
const ZIP_MAX_COMMENT: usize = 65535;

fn verdict(ok: bool) -> StructuralCheck {
    if ok {
        StructuralCheck::Passed
    } else {
        StructuralCheck::Failed
    }
}

/// Format validator for `extension`, or `None` when no validator exists.
pub fn validate(extension: &str, data: &[u8]) -> Option<StructuralCheck> {
    let check = match extension {
        "jpg" | "jpeg" => verdict(validate_jpeg(data)),
        "png" => verdict(validate_png(data)),
        "gif" => verdict(validate_gif(data)),
        "bmp" => verdict(validate_bmp(data)),
        "pdf" => verdict(validate_pdf(data)),
        "zip" | "docx" | "xlsx" | "pptx" | "odt" | "jar" => verdict(validate_zip(data)),
        "wav" | "avi" | "webp" => verdict(validate_riff(data)),
        "7z" => verdict(validate_7z(data)),
        "sqlite" | "db" => verdict(validate_sqlite(data)),
        _ => return None,
    };
    Some(check)
}

/// Marker walk from SOI through the entropy-coded scan to an EOI on the last byte.
fn validate_jpeg(data: &[u8]) -> bool {
    if !data.starts_with(&JPEG_SOI) {
        return false;
    }
    let mut pos = 2;
    loop {
        if data.get(pos) != Some(&0xFF) {
            return false;
        }
        while data.get(pos + 1) == Some(&0xFF) {
            pos += 1;
        }
        let Some(&marker) = data.get(pos + 1) else {
            return false;
        };
        match marker {
            0xD9 => return pos + 2 == data.len(),
            0x01 | 0xD0..=0xD7 => pos += 2,
            _ => {
                if pos + 4 > data.len() {
                    return false;
                }
                let length = BigEndian::read_u16(&data[pos + 2..pos + 4]) as usize;
                if length < 2 {
                    return false;
                }
                pos += 2 + length;
                if marker == 0xDA {
                    match skip_entropy(data, pos) {
                        Some(next) => pos = next,
                        None => return false,
                    }
                }
            }
        }
    }
}

/// Position of the next real marker after entropy-coded data.
fn skip_entropy(data: &[u8], mut pos: usize) -> Option<usize> {
    while pos + 1 < data.len() {
        if data[pos] == 0xFF {
            let next = data[pos + 1];
            if next != 0x00 && !(0xD0..=0xD7).contains(&next) && next != 0xFF {
                return Some(pos);
            }
        }
        pos += 1;
    }
    None
}

/// Chunk walk with every chunk's CRC-32 checked; IEND must end the data.
fn validate_png(data: &[u8]) -> bool {
    if !data.starts_with(&PNG_MAGIC) {
        return false;
    }
    let mut pos = PNG_MAGIC.len();
    while pos + 12 <= data.len() {
        let length = BigEndian::read_u32(&data[pos..pos + 4]) as usize;
        let Some(end) = pos.checked_add(12 + length).filter(|end| *end <= data.len()) else {
            return false;
        };
        let typed = &data[pos + 4..pos + 8 + length];
        let stored = BigEndian::read_u32(&data[pos + 8 + length..end]);
        if crc32fast::hash(typed) != stored {
            debug!("PNG chunk at {} fails its CRC", pos);
            return false;
        }
        if &data[pos + 4..pos + 8] == b"IEND" {
            return end == data.len();
        }
        pos = end;
    }
    false
}

fn validate_gif(data: &[u8]) -> bool {
    (data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a")) && data.last() == Some(&0x3B)
}

fn validate_bmp(data: &[u8]) -> bool {
    data.len() >= 26
        && data.starts_with(b"BM")
        && LittleEndian::read_u32(&data[2..6]) as usize == data.len()
}

fn validate_pdf(data: &[u8]) -> bool {
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(0);
    data.starts_with(b"%PDF-") && data[..end].ends_with(b"%%EOF")
}

/// End record at the span end, whose central directory ends where the record starts.
fn validate_zip(data: &[u8]) -> bool {
    if !data.starts_with(&[0x50, 0x4B, 0x03, 0x04]) || data.len() < 22 {
        return false;
    }
    let lowest = data.len().saturating_sub(22 + ZIP_MAX_COMMENT);
    (lowest..=data.len() - 22).rev().any(|pos| {
        if data[pos..pos + 4] != ZIP_EOCD {
            return false;
        }
        let comment = LittleEndian::read_u16(&data[pos + 20..pos + 22]) as usize;
        let cd_size = LittleEndian::read_u32(&data[pos + 12..pos + 16]) as usize;
        let cd_offset = LittleEndian::read_u32(&data[pos + 16..pos + 20]) as usize;
        pos + 22 + comment == data.len() && cd_offset.checked_add(cd_size) == Some(pos)
    })
}

fn validate_riff(data: &[u8]) -> bool {
    data.len() >= 12
        && data.starts_with(b"RIFF")
        && LittleEndian::read_u32(&data[4..8]) as usize + 8 == data.len()
}

/// Start header CRC and a next header that ends the archive.
fn validate_7z(data: &[u8]) -> bool {
    if data.len() < 32 || !data.starts_with(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C]) {
        return false;
    }
    let stored = LittleEndian::read_u32(&data[8..12]);
    let next_offset = LittleEndian::read_u64(&data[12..20]);
    let next_size = LittleEndian::read_u64(&data[20..28]);
    crc32fast::hash(&data[12..32]) == stored
        && 32u64
            .checked_add(next_offset)
            .and_then(|v| v.checked_add(next_size))
            == Some(data.len() as u64)
}

fn validate_sqlite(data: &[u8]) -> bool {
    if data.len() < 100 || !data.starts_with(b"SQLite format 3\0") {
        return false;
    }
    let page_size = match BigEndian::read_u16(&data[16..18]) {
        1 => 65536,
        size => size as usize,
    };
    let pages = BigEndian::read_u32(&data[28..32]) as usize;
    page_size.checked_mul(pages) == Some(data.len())
}

/// What reading a candidate's content back at scan time showed.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentInspection {
    pub readable_fraction: f64,
    pub structural: StructuralCheck,
    pub checksum: Option<u32>,
}

/// Facts about a candidate needed to inspect its content.
pub struct InspectionTarget<'a> {
    pub extents: &'a [Extent],
    pub size: u64,
    pub extension: &'a str,
    pub source: SourceKind,
    pub layout_verified: bool,
}

/// Read a candidate's extents, measure how much is readable and run the
/// structural checks. Content above `verify_limit` is only spot-checked.
pub fn inspect(reader: &DiskReader, target: &InspectionTarget, verify_limit: u64) -> ContentInspection {
    let total: u64 = target.extents.iter().map(|e| e.length).sum();
    if total == 0 {
        return ContentInspection {
            readable_fraction: 0.0,
            structural: StructuralCheck::Failed,
            checksum: None,
        };
    }
    let ss = reader.sector_size();

    if target.size > verify_limit {
        let readable: u64 = target
            .extents
            .iter()
            .filter(|e| !e.overwritten && extent_readable(reader, e, ss))
            .map(|e| e.length)
            .sum();
        return ContentInspection {
            readable_fraction: readable as f64 / total as f64,
            structural: StructuralCheck::Unavailable,
            checksum: None,
        };
    }

    let mut content = Vec::with_capacity(total as usize);
    let mut readable = 0u64;
    for extent in target.extents {
        if extent.overwritten {
            content.resize(content.len() + extent.length as usize, 0);
            continue;
        }
        match reader.read_bytes(extent.start_byte(ss), extent.length as usize) {
            Ok(bytes) => {
                readable += extent.length;
                content.extend_from_slice(&bytes);
            }
            Err(e) => {
                warn!("Extent at sector {} unreadable: {}", extent.start_sector, e);
                content.resize(content.len() + extent.length as usize, 0);
            }
        }
    }
    content.truncate(target.size as usize);

    let structural = if content.iter().all(|b| *b == 0) {
        StructuralCheck::Failed
    } else if let Some(check) = validate(target.extension, &content) {
        check
    } else {
        allocation_check(target, total)
    };

    ContentInspection {
        readable_fraction: readable as f64 / total as f64,
        structural,
        checksum: Some(crc32fast::hash(&content)),
    }
}

/// For content no format validator knows: intact allocation metadata that
/// covers exactly the declared size passes.
fn allocation_check(target: &InspectionTarget, total: u64) -> StructuralCheck {
    match target.source {
        SourceKind::Carved => StructuralCheck::Unavailable,
        SourceKind::Metadata if !target.layout_verified => StructuralCheck::Unavailable,
        SourceKind::Metadata => verdict(total == target.size),
    }
}

/// Whether the first and last byte of an extent can be read.
fn extent_readable(reader: &DiskReader, extent: &Extent, ss: u32) -> bool {
    if extent.length == 0 {
        return true;
    }
    let start = extent.start_byte(ss);
    reader.read_bytes(start, 1).is_ok()
        && reader.read_bytes(start.saturating_add(extent.length - 1), 1).is_ok()
}
