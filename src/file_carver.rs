//! File Signature Carving Engine
//! Scans free sectors for known file signatures when metadata cannot be trusted

use std::collections::HashMap;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, Result};
use crate::filesystem::{ScanContext, SectorRange};

const FOOTER_CHUNK: usize = 1024 * 1024;
const HEADER_PREVIEW: usize = 16;
/// Bytes inspected for declared lengths.
const HEAD_LEN: usize = 64;

/// Known file signature for carving
#[derive(Clone, Debug)]
pub struct FileSignature {
    pub name: &'static str,
    pub extension: &'static str,
    pub header: &'static [u8],
    pub footer: Option<&'static [u8]>,
    pub max_size: u64,
    pub category: &'static str,
}

/// A carved candidate span
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CarvedFile {
    pub sector_offset: u64,
    pub byte_offset: u64,
    pub estimated_size: u64,
    pub file_type: String,
    pub extension: String,
    pub category: String,
    pub header_match: String,
}

impl CarvedFile {
    pub fn end_byte(&self) -> u64 {
        self.byte_offset + self.estimated_size
    }
}

/// Initialize the signature database
pub fn get_signatures() -> Vec<FileSignature> {
    vec![
        FileSignature {
            name: "JPEG Image",
            extension: "jpg",
            header: &[0xFF, 0xD8, 0xFF],
            footer: Some(&[0xFF, 0xD9]),
            max_size: 50 * 1024 * 1024,
            category: "Images",
        },
        FileSignature {
            name: "PNG Image",
            extension: "png",
            header: &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
            footer: Some(&[0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82]),
            max_size: 50 * 1024 * 1024,
            category: "Images",
        },
        FileSignature {
            name: "GIF Image",
            extension: "gif",
            header: b"GIF8",
            footer: Some(&[0x00, 0x3B]),
            max_size: 20 * 1024 * 1024,
            category: "Images",
        },
        FileSignature {
            name: "BMP Image",
            extension: "bmp",
            header: b"BM",
            footer: None,
            max_size: 100 * 1024 * 1024,
            category: "Images",
        },
        FileSignature {
            name: "PDF Document",
            extension: "pdf",
            header: b"%PDF-",
            footer: Some(b"%%EOF"),
            max_size: 200 * 1024 * 1024,
            category: "Documents",
        },
        FileSignature {
            name: "ZIP Archive",
            extension: "zip",
            header: &[0x50, 0x4B, 0x03, 0x04],
            footer: Some(&[0x50, 0x4B, 0x05, 0x06]),
            max_size: 500 * 1024 * 1024,
            category: "Archives",
        },
        FileSignature {
            name: "RIFF Container",
            extension: "riff",
            header: b"RIFF",
            footer: None,
            max_size: 2 * 1024 * 1024 * 1024,
            category: "Media",
        },
        FileSignature {
            name: "SQLite Database",
            extension: "sqlite",
            header: b"SQLite format 3\0",
            footer: None,
            max_size: 1024 * 1024 * 1024,
            category: "Other",
        },
        FileSignature {
            name: "7-Zip Archive",
            extension: "7z",
            header: &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C],
            footer: None,
            max_size: 1024 * 1024 * 1024,
            category: "Archives",
        },
        FileSignature {
            name: "RAR Archive",
            extension: "rar",
            header: &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07],
            footer: None,
            max_size: 500 * 1024 * 1024,
            category: "Archives",
        },
        FileSignature {
            name: "OLE Compound Document",
            extension: "ole",
            header: &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1],
            footer: None,
            max_size: 100 * 1024 * 1024,
            category: "Documents",
        },
    ]
}

/// Build a lookup table keyed by the first two header bytes
pub fn build_signature_lookup(signatures: &[FileSignature]) -> HashMap<u16, Vec<usize>> {
    let mut lookup: HashMap<u16, Vec<usize>> = HashMap::new();
    for (index, sig) in signatures.iter().enumerate() {
        if sig.header.len() >= 2 {
            let key = u16::from_le_bytes([sig.header[0], sig.header[1]]);
            lookup.entry(key).or_default().push(index);
        }
    }
    lookup
}

/// Signature counts per category
pub fn get_signature_stats() -> HashMap<String, usize> {
    let mut stats: HashMap<String, usize> = HashMap::new();
    for sig in get_signatures() {
        *stats.entry(sig.category.to_string()).or_insert(0) += 1;
    }
    stats
}

/// Length a header declares for its file, when the format records one.
/// `Some(None)` means the format declares nothing; `None` rejects the match.
fn declared_length(sig: &FileSignature, head: &[u8]) -> Option<Option<u64>> {
    let le32 = |off: usize| head.get(off..off + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
    let be16 = |off: usize| head.get(off..off + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));
    let be32 = |off: usize| head.get(off..off + 4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]));
    let le64 = |off: usize| {
        head.get(off..off + 8)
            .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    };

    match sig.extension {
        "bmp" => {
            // Reserved words are zero and the pixel data lies inside the file.
            let size = le32(2)? as u64;
            let reserved = le32(6)?;
            let pixels = le32(10)? as u64;
            (size >= 26 && reserved == 0 && pixels >= 26 && pixels < size).then_some(Some(size))
        }
        "riff" => {
            let form = head.get(8..12)?;
            let known = form == b"WAVE" || form == b"AVI " || form == b"WEBP";
            known.then_some(Some(le32(4)? as u64 + 8))
        }
        "sqlite" => {
            let page_size = match be16(16)? {
                1 => 65536,
                size if size >= 512 && size.is_power_of_two() => size as u64,
                _ => return None,
            };
            match be32(28)? {
                0 => Some(None),
                pages => Some(Some(page_size * pages as u64)),
            }
        }
        "7z" => {
            let next_offset = le64(12)?;
            let next_size = le64(20)?;
            Some(Some(32u64.checked_add(next_offset)?.checked_add(next_size)?))
        }
        "gif" => {
            let version = head.get(4..6)?;
            (version == b"7a" || version == b"9a").then_some(None)
        }
        "pdf" => head.get(5).filter(|b| b.is_ascii_digit()).map(|_| None),
        "zip" => {
            // Local header: a plausible name length.
            let name_len = head.get(26..28).map(|b| u16::from_le_bytes([b[0], b[1]]))?;
            (name_len > 0 && name_len < 1024).then_some(None)
        }
        _ => Some(None),
    }
}

/// Extension to report for a match; RIFF resolves to its form type.
fn refine_extension(sig: &FileSignature, head: &[u8]) -> &'static str {
    match (sig.extension, head.get(8..12)) {
        ("riff", Some(b"WAVE")) => "wav",
        ("riff", Some(b"AVI ")) => "avi",
        ("riff", Some(b"WEBP")) => "webp",
        ("ole", _) => "doc",
        (ext, _) => ext,
    }
}

pub struct Carver {
    signatures: Vec<FileSignature>,
    lookup: HashMap<u16, Vec<usize>>,
}

impl Default for Carver {
    fn default() -> Self {
        Self::new()
    }
}

impl Carver {
    pub fn new() -> Self {
        let signatures = get_signatures();
        let lookup = build_signature_lookup(&signatures);
        Carver { signatures, lookup }
    }

    fn match_header(&self, data: &[u8]) -> Option<&FileSignature> {
        if data.len() < 2 {
            return None;
        }
        let key = u16::from_le_bytes([data[0], data[1]]);
        self.lookup
            .get(&key)?
            .iter()
            .map(|&index| &self.signatures[index])
            .find(|sig| data.starts_with(sig.header))
    }

    /// Carve every span: windows are processed in parallel, then merged.
    pub fn carve_spans(&self, ctx: &ScanContext, spans: &[SectorRange]) -> Result<Vec<CarvedFile>> {
        let window_sectors = (ctx.config.carve_window_bytes / ctx.sector_size() as u64).max(1);
        let work: Vec<(SectorRange, SectorRange)> = spans
            .iter()
            .flat_map(|span| {
                let mut windows = Vec::new();
                let mut start = span.start;
                while start < span.end() {
                    let count = window_sectors.min(span.end() - start);
                    windows.push((*span, SectorRange::new(start, count)));
                    start += count;
                }
                windows
            })
            .collect();

        info!("Carving {} spans in {} windows", spans.len(), work.len());
        let per_window: Vec<Vec<CarvedFile>> = work
            .par_iter()
            .map(|(span, window)| {
                if ctx.is_cancelled() {
                    return Ok(Vec::new());
                }
                match self.carve_window(ctx, *window, *span) {
                    Err(RecoveryError::Io { offset, source }) => {
                        warn!("Skipping carve window at sector {}: read failed at {}: {}", window.start, offset, source);
                        Ok(Vec::new())
                    }
                    other => other,
                }
            })
            .collect::<Result<_>>()?;

        let limit = ctx.config.max_carved_candidates;
        Ok(merge_carved(per_window.into_iter().flatten().collect(), limit))
    }

    /// Every candidate whose header lies in `window`; spans may run on to the
    /// end of `span`. Overlaps are left for `merge_carved` to resolve, so the
    /// result does not depend on where window boundaries fall.
    pub fn carve_window(
        &self,
        ctx: &ScanContext,
        window: SectorRange,
        span: SectorRange,
    ) -> Result<Vec<CarvedFile>> {
        let ss = ctx.sector_size() as u64;
        let data = ctx.read_bytes(window.start * ss, (window.count * ss) as usize)?;
        let mut carved = Vec::new();

        for index in 0..window.count {
            let sector = window.start + index;
            let byte_offset = sector * ss;
            let local = (index * ss) as usize;
            let Some(sig) = self.match_header(&data[local..]) else {
                continue;
            };

            let head = self.head_bytes(ctx, &data, local, byte_offset);
            let Some(declared) = declared_length(sig, &head) else {
                continue;
            };
            let limit = sig.max_size.min((span.end() - sector) * ss);
            let length = match (declared, sig.footer) {
                (Some(len), _) => len.min(limit),
                (None, Some(footer)) => self.find_footer(ctx, sig, footer, byte_offset, limit)?,
                (None, None) => limit,
            };
            if length < sig.header.len() as u64 {
                continue;
            }

            debug!("Carved {} at byte {} ({} bytes)", sig.name, byte_offset, length);
            let preview = &head[..head.len().min(HEADER_PREVIEW)];
            carved.push(CarvedFile {
                sector_offset: sector,
                byte_offset,
                estimated_size: length,
                file_type: sig.name.to_string(),
                extension: refine_extension(sig, &head).to_string(),
                category: sig.category.to_string(),
                header_match: hex::encode(preview),
            });
        }
        Ok(carved)
    }

    fn head_bytes(&self, ctx: &ScanContext, data: &[u8], local: usize, byte_offset: u64) -> Vec<u8> {
        if local + HEAD_LEN <= data.len() {
            return data[local..local + HEAD_LEN].to_vec();
        }
        let available = (ctx.reader.size().saturating_sub(byte_offset) as usize).min(HEAD_LEN);
        ctx.reader
            .read_bytes(byte_offset, available)
            .unwrap_or_else(|_| data[local..].to_vec())
    }

    /// Bytes from `start` to the end of the first footer, or `limit` when
    /// no footer appears in time.
    fn find_footer(
        &self,
        ctx: &ScanContext,
        sig: &FileSignature,
        footer: &[u8],
        start: u64,
        limit: u64,
    ) -> Result<u64> {
        let mut searched = sig.header.len() as u64;
        let mut carry: Vec<u8> = Vec::new();
        while searched < limit {
            if ctx.is_cancelled() {
                return Ok(limit);
            }
            let len = (limit - searched).min(FOOTER_CHUNK as u64) as usize;
            let chunk = ctx.reader.read_bytes(start + searched, len)?;
            let base = searched - carry.len() as u64;
            carry.extend_from_slice(&chunk);
            if let Some(pos) = carry.windows(footer.len()).position(|w| w == footer) {
                let footer_end = base + (pos + footer.len()) as u64;
                return Ok(self.footer_tail(ctx, sig, start, footer_end).min(limit));
            }
            let keep = carry.len().min(footer.len() - 1);
            carry.drain(..carry.len() - keep);
            searched += len as u64;
        }
        Ok(limit)
    }

    /// ZIP's end record carries 18 more bytes and a comment after its signature.
    fn footer_tail(&self, ctx: &ScanContext, sig: &FileSignature, start: u64, footer_end: u64) -> u64 {
        if sig.extension != "zip" {
            return footer_end;
        }
        match ctx.reader.read_bytes(start + footer_end + 16, 2) {
            Ok(raw) => footer_end + 18 + u16::from_le_bytes([raw[0], raw[1]]) as u64,
            Err(_) => footer_end + 18,
        }
    }
}

/// Deterministic merge in start order: a candidate starting strictly inside
/// an already claimed span is dropped.
pub fn merge_carved(mut candidates: Vec<CarvedFile>, limit: usize) -> Vec<CarvedFile> {
    candidates.sort_by(|a, b| {
        a.byte_offset
            .cmp(&b.byte_offset)
            .then(b.estimated_size.cmp(&a.estimated_size))
    });
    let mut merged: Vec<CarvedFile> = Vec::new();
    for candidate in candidates {
        if let Some(last) = merged.last() {
            if candidate.byte_offset < last.end_byte() {
                continue;
            }
        }
        if merged.len() == limit {
            warn!("Carving stopped at {} candidates", limit);
            break;
        }
        merged.push(candidate);
    }
    merged
}

/// Parts of `ranges` that fall inside `within`.
pub fn clip_ranges(ranges: &[SectorRange], within: SectorRange) -> Vec<SectorRange> {
    ranges
        .iter()
        .filter_map(|range| {
            let start = range.start.max(within.start);
            let end = range.end().min(within.end());
            (start < end).then(|| SectorRange::new(start, end - start))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::test_support::{memory_reader, sample_jpeg, scan_context, SECTOR};

    fn carve_image(data: Vec<u8>, config: &EngineConfig) -> Vec<CarvedFile> {
        let total = (data.len() / SECTOR) as u64;
        let reader = memory_reader(data, "raw.img");
        let (cancel, progress) = Default::default();
        let ctx = scan_context(&reader, config, &cancel, &progress);
        Carver::new()
            .carve_spans(&ctx, &[SectorRange::new(0, total)])
            .unwrap()
    }

    #[test]
    fn test_jpeg_bounded_by_footer() {
        let jpeg = sample_jpeg(3000);
        let mut data = vec![0u8; 64 * SECTOR];
        data[8 * SECTOR..8 * SECTOR + jpeg.len()].copy_from_slice(&jpeg);

        let carved = carve_image(data, &EngineConfig::default());
        assert_eq!(carved.len(), 1);
        assert_eq!(carved[0].extension, "jpg");
        assert_eq!(carved[0].sector_offset, 8);
        assert_eq!(carved[0].estimated_size, jpeg.len() as u64);
        assert!(carved[0].header_match.starts_with("ffd8ffe0"));
    }

    #[test]
    fn test_unaligned_headers_are_ignored() {
        let jpeg = sample_jpeg(100);
        let mut data = vec![0u8; 16 * SECTOR];
        data[SECTOR + 7..SECTOR + 7 + jpeg.len()].copy_from_slice(&jpeg);
        assert!(carve_image(data, &EngineConfig::default()).is_empty());
    }

    #[test]
    fn test_nested_header_inside_claimed_span_is_dropped() {
        // A PDF whose body holds a sector-aligned JPEG header.
        let mut data = vec![0u8; 32 * SECTOR];
        data[0..8].copy_from_slice(b"%PDF-1.7");
        let inner = sample_jpeg(200);
        data[4 * SECTOR..4 * SECTOR + inner.len()].copy_from_slice(&inner);
        data[10 * SECTOR..10 * SECTOR + 5].copy_from_slice(b"%%EOF");

        let carved = carve_image(data, &EngineConfig::default());
        assert_eq!(carved.len(), 1);
        assert_eq!(carved[0].extension, "pdf");
        assert_eq!(carved[0].estimated_size, 10 * SECTOR as u64 + 5);
    }

    #[test]
    fn test_windows_merge_without_overlap() {
        let config = EngineConfig {
            carve_window_bytes: 4 * SECTOR as u64,
            ..EngineConfig::default()
        };
        let mut data = vec![0u8; 64 * SECTOR];
        // BMP spanning several windows, then a JPEG after it.
        let bmp_len = 9 * SECTOR as u32;
        data[2 * SECTOR..2 * SECTOR + 2].copy_from_slice(b"BM");
        data[2 * SECTOR + 2..2 * SECTOR + 6].copy_from_slice(&bmp_len.to_le_bytes());
        data[2 * SECTOR + 10..2 * SECTOR + 14].copy_from_slice(&54u32.to_le_bytes());
        let jpeg_in_bmp = sample_jpeg(10);
        data[5 * SECTOR..5 * SECTOR + jpeg_in_bmp.len()].copy_from_slice(&jpeg_in_bmp);
        let jpeg = sample_jpeg(600);
        data[20 * SECTOR..20 * SECTOR + jpeg.len()].copy_from_slice(&jpeg);

        let carved = carve_image(data, &config);
        assert_eq!(carved.len(), 2);
        assert_eq!(carved[0].extension, "bmp");
        assert_eq!(carved[0].estimated_size, bmp_len as u64);
        assert_eq!(carved[1].sector_offset, 20);
        for pair in carved.windows(2) {
            assert!(pair[0].end_byte() <= pair[1].byte_offset);
        }
    }

    #[test]
    fn test_stray_header_does_not_hide_later_file() {
        // BMP over sectors 0..9, a stray JPEG header at 8 and a real JPEG at 12.
        let mut data = vec![0u8; 64 * SECTOR];
        let bmp_len = 9 * SECTOR as u32;
        data[0..2].copy_from_slice(b"BM");
        data[2..6].copy_from_slice(&bmp_len.to_le_bytes());
        data[10..14].copy_from_slice(&54u32.to_le_bytes());
        data[8 * SECTOR..8 * SECTOR + 4].copy_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
        let jpeg = sample_jpeg(700);
        data[12 * SECTOR..12 * SECTOR + jpeg.len()].copy_from_slice(&jpeg);

        let summary = |window: u64| -> Vec<(u64, String)> {
            let config = EngineConfig {
                carve_window_bytes: window,
                ..EngineConfig::default()
            };
            carve_image(data.clone(), &config)
                .into_iter()
                .map(|c| (c.sector_offset, c.extension))
                .collect()
        };
        let wide = summary(1024 * 1024);
        assert_eq!(wide, vec![(0, "bmp".to_string()), (12, "jpg".to_string())]);
        assert_eq!(summary(8 * SECTOR as u64), wide);
        assert_eq!(summary(3 * SECTOR as u64), wide);
    }

    #[test]
    fn test_footer_missing_runs_to_span_end() {
        let mut data = vec![0u8; 16 * SECTOR];
        data[0..4].copy_from_slice(b"GIF8");
        data[4..6].copy_from_slice(b"9a");
        let carved = carve_image(data, &EngineConfig::default());
        assert_eq!(carved.len(), 1);
        assert_eq!(carved[0].estimated_size, 16 * SECTOR as u64);
    }

    #[test]
    fn test_riff_form_type() {
        let mut data = vec![0u8; 8 * SECTOR];
        data[0..4].copy_from_slice(b"RIFF");
        data[4..8].copy_from_slice(&1000u32.to_le_bytes());
        data[8..12].copy_from_slice(b"WAVE");
        let carved = carve_image(data, &EngineConfig::default());
        assert_eq!(carved[0].extension, "wav");
        assert_eq!(carved[0].estimated_size, 1008);
    }

    #[test]
    fn test_clip_ranges() {
        let ranges = [SectorRange::new(0, 10), SectorRange::new(20, 10)];
        let clipped = clip_ranges(&ranges, SectorRange::new(5, 20));
        assert_eq!(clipped, vec![SectorRange::new(5, 5), SectorRange::new(20, 5)]);
    }

    #[test]
    fn test_signature_stats() {
        let stats = get_signature_stats();
        assert_eq!(stats.values().sum::<usize>(), get_signatures().len());
    }
}
