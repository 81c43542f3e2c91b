//! Scan Orchestrator
//! Owns opened volumes and scan sessions, runs quick/deep/forensic scans and restore batches
//!
//! Callers hold plain numeric handles; the engine keeps the tables behind them.
//! A scan runs on its own thread and fans its metadata regions and carving
//! windows out over the engine's worker pool.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::disk_reader::{is_supported_sector_size, DiskReader};
use crate::error::{RecoveryError, Result};
use crate::evaluator::{evaluate, Evaluation};
use crate::exfat_parser::ExfatParser;
use crate::ext4_parser::Ext4Parser;
use crate::fat_parser::FatParser;
use crate::file_carver::{clip_ranges, CarvedFile, Carver};
use crate::filesystem::{
    detect_filesystem, merge_ranges, AllocationMap, DiscoveredFile, MetadataParser, ScanContext,
    ScanScope, SectorRange,
};
use crate::hfs_parser::HfsParser;
use crate::ntfs_parser::NtfsParser;
use crate::restore;
use crate::types::{
    extents_overlap, CandidateEntry, ConfidenceTier, EntryId, EntryLocator, Extent, FileTypeGuess,
    FilesystemKind, ProgressSnapshot, RestoreJob, ResultFilter, ScanMode, ScanState, SourceKind,
    VolumeInfo,
};
use crate::validators::{inspect, InspectionTarget};

pub type VolumeHandle = u64;
pub type ScanSessionId = u64;

/// Summary of a finished scan, as the command line prints it.
#[derive(Serialize, Deserialize, Debug)]
pub struct ScanReport {
    pub success: bool,
    pub message: String,
    pub scan_mode: ScanMode,
    pub volume: VolumeInfo,
    pub state: ScanState,
    pub entries: Vec<CandidateEntry>,
    pub total_files: usize,
    pub total_recoverable_size: u64,
    pub scan_duration_ms: u64,
    pub sectors_scanned: u64,
}

struct OpenVolume {
    reader: Arc<DiskReader>,
    info: VolumeInfo,
}

struct ScanSession {
    volume: VolumeHandle,
    mode: ScanMode,
    filesystem: FilesystemKind,
    reader: Arc<DiskReader>,
    cancel: AtomicBool,
    sectors_scanned: AtomicU64,
    entries_found: AtomicU64,
    state: AtomicU8,
    error: Mutex<Option<String>>,
    /// Append-only; entries are pushed only once fully built.
    results: Mutex<Vec<CandidateEntry>>,
    duration_ms: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScanSession {
    fn new(volume: VolumeHandle, mode: ScanMode, open: &OpenVolume) -> Self {
        ScanSession {
            volume,
            mode,
            filesystem: open.info.filesystem,
            reader: Arc::clone(&open.reader),
            cancel: AtomicBool::new(false),
            sectors_scanned: AtomicU64::new(0),
            entries_found: AtomicU64::new(0),
            state: AtomicU8::new(ScanState::Idle.as_u8()),
            error: Mutex::new(None),
            results: Mutex::new(Vec::new()),
            duration_ms: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    fn state(&self) -> ScanState {
        ScanState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ScanState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            sectors_scanned: self.sectors_scanned.load(Ordering::Relaxed),
            entries_found: self.entries_found.load(Ordering::Relaxed),
            state: self.state(),
            error: lock(&self.error).clone(),
        }
    }

    fn publish(&self, entries: Vec<CandidateEntry>) {
        if entries.is_empty() {
            return;
        }
        let count = entries.len() as u64;
        lock(&self.results).extend(entries);
        self.entries_found.fetch_add(count, Ordering::Relaxed);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Main recovery engine
pub struct RecoveryEngine {
    config: Arc<EngineConfig>,
    pool: Arc<rayon::ThreadPool>,
    carver: Arc<Carver>,
    volumes: Mutex<HashMap<VolumeHandle, Arc<OpenVolume>>>,
    sessions: Mutex<HashMap<ScanSessionId, Arc<ScanSession>>>,
    history: Mutex<Vec<RestoreJob>>,
    next_handle: AtomicU64,
}

impl RecoveryEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.scan_workers)
            .thread_name(|i| format!("scan-worker-{}", i))
            .build()
            .map_err(|e| RecoveryError::Config(format!("cannot start scan workers: {}", e)))?;
        Ok(RecoveryEngine {
            config: Arc::new(config),
            pool: Arc::new(pool),
            carver: Arc::new(Carver::new()),
            volumes: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn allocate_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a whole device or image file.
    pub fn open_volume(&self, path: &Path) -> Result<VolumeHandle> {
        let reader = DiskReader::open(path)?;
        self.register(reader, None)
    }

    /// Open one MBR partition of a device or image file.
    pub fn open_partition(&self, path: &Path, index: u32) -> Result<VolumeHandle> {
        let disk = DiskReader::open(path)?;
        let entry = disk
            .list_partitions()?
            .into_iter()
            .find(|p| p.index == index)
            .ok_or_else(|| {
                RecoveryError::UnsupportedMedium(format!(
                    "{} has no partition {}",
                    path.display(),
                    index
                ))
            })?;
        let reader = disk.partition(&entry)?;
        self.register(reader, Some(index))
    }

    /// Register an already-constructed reader.
    pub fn open_reader(&self, reader: DiskReader) -> Result<VolumeHandle> {
        self.register(reader, None)
    }

    fn register(&self, reader: DiskReader, partition: Option<u32>) -> Result<VolumeHandle> {
        let (filesystem, declared) = detect_filesystem(&reader)?;
        let reader = match declared {
            Some(size) if size == reader.sector_size() => reader,
            Some(size) if is_supported_sector_size(size) => reader.with_sector_size(size)?,
            Some(size) => {
                warn!(
                    "{} declares sector size {}; keeping {}",
                    reader.path().display(),
                    size,
                    reader.sector_size()
                );
                reader
            }
            None => reader,
        };

        let info = VolumeInfo {
            path: reader.path().to_path_buf(),
            partition,
            sector_size: reader.sector_size(),
            total_sectors: reader.total_sectors(),
            filesystem,
            identity: reader.identity(),
        };
        let handle = self.allocate_handle();
        info!(
            "Volume {} opened: {} ({}, {} sectors of {} bytes)",
            handle,
            info.path.display(),
            filesystem.name(),
            info.total_sectors,
            info.sector_size
        );
        lock(&self.volumes).insert(
            handle,
            Arc::new(OpenVolume {
                reader: Arc::new(reader),
                info,
            }),
        );
        Ok(handle)
    }

    fn volume(&self, handle: VolumeHandle) -> Result<Arc<OpenVolume>> {
        lock(&self.volumes)
            .get(&handle)
            .cloned()
            .ok_or(RecoveryError::UnknownVolume(handle))
    }

    pub fn volume_info(&self, handle: VolumeHandle) -> Result<VolumeInfo> {
        Ok(self.volume(handle)?.info.clone())
    }

    /// Forget a volume. Its scan sessions are cancelled and discarded.
    pub fn close_volume(&self, handle: VolumeHandle) -> Result<()> {
        lock(&self.volumes)
            .remove(&handle)
            .ok_or(RecoveryError::UnknownVolume(handle))?;
        self.drop_sessions_of(handle);
        Ok(())
    }

    fn drop_sessions_of(&self, volume: VolumeHandle) {
        lock(&self.sessions).retain(|id, session| {
            if session.volume != volume {
                return true;
            }
            debug!("Discarding scan session {} of volume {}", id, volume);
            session.cancel.store(true, Ordering::SeqCst);
            false
        });
    }

    fn session(&self, id: ScanSessionId) -> Result<Arc<ScanSession>> {
        lock(&self.sessions)
            .get(&id)
            .cloned()
            .ok_or(RecoveryError::UnknownSession(id))
    }

    /// Start a scan in the background. An earlier session on the same volume
    /// is cancelled and discarded.
    pub fn start_scan(&self, handle: VolumeHandle, mode: ScanMode) -> Result<ScanSessionId> {
        let volume = self.volume(handle)?;
        self.drop_sessions_of(handle);

        let id = self.allocate_handle();
        let session = Arc::new(ScanSession::new(handle, mode, &volume));
        session.set_state(ScanState::Running);
        lock(&self.sessions).insert(id, Arc::clone(&session));

        let worker_session = Arc::clone(&session);
        let config = Arc::clone(&self.config);
        let pool = Arc::clone(&self.pool);
        let carver = Arc::clone(&self.carver);
        let spawned = std::thread::Builder::new()
            .name(format!("scan-{}", id))
            .spawn(move || pool.install(|| run_session(&worker_session, &config, &carver)));

        match spawned {
            Ok(worker) => {
                *lock(&session.worker) = Some(worker);
                info!("Scan {} started on volume {} ({:?})", id, handle, mode);
                Ok(id)
            }
            Err(e) => {
                lock(&self.sessions).remove(&id);
                Err(RecoveryError::Io { offset: 0, source: e })
            }
        }
    }

    /// Ask a running scan to stop after its in-flight unit of work.
    pub fn cancel_scan(&self, id: ScanSessionId) -> Result<()> {
        let session = self.session(id)?;
        if !session.state().is_terminal() {
            info!("Cancelling scan {}", id);
            session.cancel.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn poll_progress(&self, id: ScanSessionId) -> Result<ProgressSnapshot> {
        Ok(self.session(id)?.snapshot())
    }

    /// Block until the scan reaches a terminal state.
    pub fn wait_for_scan(&self, id: ScanSessionId) -> Result<ProgressSnapshot> {
        let session = self.session(id)?;
        let worker = lock(&session.worker).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Scan {} worker panicked", id);
                *lock(&session.error) = Some("scan worker panicked".to_string());
                session.set_state(ScanState::Failed);
            }
        }
        Ok(session.snapshot())
    }

    pub fn discard_session(&self, id: ScanSessionId) -> Result<()> {
        let session = lock(&self.sessions)
            .remove(&id)
            .ok_or(RecoveryError::UnknownSession(id))?;
        session.cancel.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Entries ordered by tier, then size (both descending), then identifier.
    pub fn get_results(&self, id: ScanSessionId) -> Result<Vec<CandidateEntry>> {
        let session = self.session(id)?;
        let mut entries = lock(&session.results).clone();
        sort_results(&mut entries);
        Ok(entries)
    }

    pub fn get_results_filtered(
        &self,
        id: ScanSessionId,
        filter: &ResultFilter,
    ) -> Result<Vec<CandidateEntry>> {
        let mut entries = self.get_results(id)?;
        entries.retain(|entry| filter.matches(entry));
        Ok(entries)
    }

    pub fn report(&self, id: ScanSessionId) -> Result<ScanReport> {
        let session = self.session(id)?;
        let volume = self.volume(session.volume)?;
        let entries = self.get_results(id)?;
        let snapshot = session.snapshot();
        let total_recoverable_size = entries
            .iter()
            .filter(|e| e.tier > ConfidenceTier::Low)
            .map(|e| e.size)
            .sum();
        let message = match &snapshot.error {
            Some(reason) => format!("Scan failed: {}", reason),
            None => format!(
                "{:?} scan {:?}. Found {} candidates ({} likely recoverable).",
                session.mode,
                snapshot.state,
                entries.len(),
                format_size(total_recoverable_size)
            ),
        };
        Ok(ScanReport {
            success: snapshot.state != ScanState::Failed,
            message,
            scan_mode: session.mode,
            volume: volume.info.clone(),
            state: snapshot.state,
            total_files: entries.len(),
            entries,
            total_recoverable_size,
            scan_duration_ms: session.duration_ms.load(Ordering::Relaxed),
            sectors_scanned: snapshot.sectors_scanned,
        })
    }

    /// Restore entries of a session into `destination`. Unknown entry ids
    /// reject the whole batch; everything else is reported per job.
    pub fn restore_batch(
        &self,
        id: ScanSessionId,
        entry_ids: &[EntryId],
        destination: &Path,
    ) -> Result<Vec<RestoreJob>> {
        let session = self.session(id)?;
        let entries = {
            let results = lock(&session.results);
            let by_id: HashMap<EntryId, &CandidateEntry> =
                results.iter().map(|entry| (entry.id, entry)).collect();
            entry_ids
                .iter()
                .map(|entry_id| {
                    by_id
                        .get(entry_id)
                        .map(|entry| (*entry).clone())
                        .ok_or_else(|| RecoveryError::UnknownEntry(entry_id.to_string()))
                })
                .collect::<Result<Vec<_>>>()?
        };

        let jobs = restore::restore_batch(
            &session.reader,
            &entries,
            destination,
            self.config.restore_workers,
        );
        lock(&self.history).extend(jobs.iter().cloned());
        Ok(jobs)
    }

    /// Every finished restore job, in completion order.
    pub fn restore_history(&self) -> Vec<RestoreJob> {
        lock(&self.history).clone()
    }
}

pub fn sort_results(entries: &mut [CandidateEntry]) {
    entries.sort_by(|a, b| {
        b.tier
            .cmp(&a.tier)
            .then(b.size.cmp(&a.size))
            .then(a.id.cmp(&b.id))
    });
}

fn run_session(session: &ScanSession, config: &EngineConfig, carver: &Carver) {
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| scan_volume(session, config, carver)));
    let state = match outcome {
        Ok(Ok(())) if session.cancel.load(Ordering::SeqCst) => ScanState::Cancelled,
        Ok(Ok(())) => ScanState::Completed,
        Ok(Err(e)) => {
            error!("Scan of {} failed: {}", session.reader.path().display(), e);
            *lock(&session.error) = Some(e.to_string());
            ScanState::Failed
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!("Scan of {} panicked: {}", session.reader.path().display(), reason);
            *lock(&session.error) = Some(format!("scan worker panicked: {}", reason));
            ScanState::Failed
        }
    };
    session
        .duration_ms
        .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    session.set_state(state);
    info!(
        "Scan of {} {:?}: {} entries, {} sectors read",
        session.reader.path().display(),
        state,
        session.entries_found.load(Ordering::Relaxed),
        session.sectors_scanned.load(Ordering::Relaxed)
    );
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn open_parser(ctx: &ScanContext, kind: FilesystemKind) -> Result<Option<Box<dyn MetadataParser>>> {
    let parser: Box<dyn MetadataParser> = match kind {
        FilesystemKind::Fat32 => Box::new(FatParser::open(ctx)?),
        FilesystemKind::ExFat => Box::new(ExfatParser::open(ctx)?),
        FilesystemKind::Ntfs => Box::new(NtfsParser::open(ctx)?),
        FilesystemKind::Ext4 => Box::new(Ext4Parser::open(ctx)?),
        FilesystemKind::HfsPlus => Box::new(HfsParser::open(ctx)?),
        FilesystemKind::Unknown => return Ok(None),
    };
    Ok(Some(parser))
}

fn scan_volume(session: &ScanSession, config: &EngineConfig, carver: &Carver) -> Result<()> {
    let reader = session.reader.as_ref();
    let ctx = ScanContext::new(reader, config, &session.cancel, &session.sectors_scanned);
    let scope = match session.mode {
        ScanMode::Quick => ScanScope::WellKnown,
        ScanMode::Deep | ScanMode::Forensic => ScanScope::Full,
    };

    let parser = open_parser(&ctx, session.filesystem).unwrap_or_else(|e| {
        warn!("{} metadata unusable: {}", session.filesystem.name(), e);
        None
    });
    let Some(parser) = parser else {
        if session.mode == ScanMode::Quick {
            info!("No readable metadata; a quick scan has nothing to walk");
            return Ok(());
        }
        let whole = AllocationMap::unmapped().free_ranges(ctx.sector_size(), reader.total_sectors());
        return carve_and_publish(session, &ctx, carver, &whole);
    };

    let failed = metadata_pass(session, &ctx, parser.as_ref(), scope);
    if session.mode == ScanMode::Quick || ctx.is_cancelled() {
        return Ok(());
    }

    let free = parser
        .allocation()
        .free_ranges(ctx.sector_size(), reader.total_sectors());
    let spans = match session.mode {
        ScanMode::Forensic => free,
        _ => fallback_spans(&free, &failed),
    };
    if spans.is_empty() {
        return Ok(());
    }
    carve_and_publish(session, &ctx, carver, &spans)
}

/// Parse every region in parallel and publish what it finds. Returns the
/// fallback spans of the regions that could not be parsed.
fn metadata_pass(
    session: &ScanSession,
    ctx: &ScanContext,
    parser: &dyn MetadataParser,
    scope: ScanScope,
) -> Vec<Option<SectorRange>> {
    let regions = match parser.regions(ctx, scope) {
        Ok(regions) => regions,
        Err(e) => {
            warn!("Cannot partition {} metadata: {}", parser.kind().name(), e);
            return vec![None];
        }
    };
    info!("Parsing {} metadata in {} regions", parser.kind().name(), regions.len());

    let failed = Mutex::new(Vec::new());
    regions.par_iter().for_each(|region| {
        if ctx.is_cancelled() {
            return;
        }
        match parser.parse_region(ctx, region, scope) {
            Ok(files) => {
                let entries = files
                    .into_iter()
                    .filter_map(|file| metadata_candidate(ctx, session.volume, file))
                    .collect();
                session.publish(entries);
            }
            Err(e) => {
                warn!("Region {} unusable, carving instead: {}", region.label(), e);
                lock(&failed).push(region.fallback);
            }
        }
    });
    failed.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Free sectors to carve for the failed regions.
fn fallback_spans(free: &[SectorRange], failed: &[Option<SectorRange>]) -> Vec<SectorRange> {
    if failed.iter().any(Option::is_none) {
        return free.to_vec();
    }
    merge_ranges(
        failed
            .iter()
            .flatten()
            .flat_map(|span| clip_ranges(free, *span))
            .collect(),
    )
}

fn carve_and_publish(
    session: &ScanSession,
    ctx: &ScanContext,
    carver: &Carver,
    spans: &[SectorRange],
) -> Result<()> {
    let mut carved = carver.carve_spans(ctx, spans)?;
    let ss = ctx.sector_size();

    // Files the metadata already explains are not reported twice.
    let claimed: Vec<Extent> = lock(&session.results)
        .iter()
        .filter(|entry| entry.source == SourceKind::Metadata)
        .flat_map(|entry| entry.extents.iter().copied())
        .collect();
    let before = carved.len();
    carved.retain(|c| !claimed.iter().any(|e| e.contains_sector(c.sector_offset, ss)));
    if carved.len() < before {
        debug!("{} carved spans already covered by metadata", before - carved.len());
    }

    let entries: Vec<CandidateEntry> = carved
        .par_iter()
        .map(|c| carved_candidate(ctx, session.volume, c))
        .collect();
    session.publish(entries);
    Ok(())
}

fn metadata_candidate(
    ctx: &ScanContext,
    volume: VolumeHandle,
    file: DiscoveredFile,
) -> Option<CandidateEntry> {
    let ss = ctx.sector_size();
    if extents_overlap(&file.extents, ss) {
        warn!("Dropping {}: its extents overlap", file.locator);
        return None;
    }
    let file_type = FileTypeGuess::from_name(file.name.as_deref().unwrap_or(""));
    let inspection = inspect(
        ctx.reader,
        &InspectionTarget {
            extents: &file.extents,
            size: file.size,
            extension: &file_type.extension,
            source: SourceKind::Metadata,
            layout_verified: file.layout_verified,
        },
        ctx.config.verify_limit_bytes,
    );

    let mut entry = CandidateEntry {
        id: EntryId {
            volume,
            locator: file.locator,
        },
        name: file.name,
        path: file.path,
        size: file.size,
        extents: file.extents,
        modified: file.modified,
        source: SourceKind::Metadata,
        tier: ConfidenceTier::Low,
        file_type,
        structural: inspection.structural,
        readable_fraction: inspection.readable_fraction,
        checksum: inspection.checksum,
        header_hex: None,
    };
    entry.tier = evaluate(&Evaluation::of_entry(&entry, ss), ctx.config.fragmentation_threshold);
    Some(entry)
}

fn carved_candidate(ctx: &ScanContext, volume: VolumeHandle, carved: &CarvedFile) -> CandidateEntry {
    let extents = vec![Extent::new(carved.sector_offset, carved.estimated_size)];
    let file_type = FileTypeGuess::from_extension(&carved.extension);
    let inspection = inspect(
        ctx.reader,
        &InspectionTarget {
            extents: &extents,
            size: carved.estimated_size,
            extension: &file_type.extension,
            source: SourceKind::Carved,
            layout_verified: false,
        },
        ctx.config.verify_limit_bytes,
    );

    let mut entry = CandidateEntry {
        id: EntryId {
            volume,
            locator: EntryLocator::CarveOffset(carved.byte_offset),
        },
        name: None,
        path: None,
        size: carved.estimated_size,
        extents,
        modified: None,
        source: SourceKind::Carved,
        tier: ConfidenceTier::Low,
        file_type,
        structural: inspection.structural,
        readable_fraction: inspection.readable_fraction,
        checksum: inspection.checksum,
        header_hex: Some(carved.header_match.clone()),
    };
    entry.tier = evaluate(
        &Evaluation::of_entry(&entry, ctx.sector_size()),
        ctx.config.fragmentation_threshold,
    );
    entry
}

/// Format file size for display
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
