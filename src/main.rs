//! Phoenix Restore - command-line front end
//!
//! Every command prints JSON on stdout; logs and usage go to stderr.
//! Reading raw devices usually needs root or Administrator privileges.

use std::env;
use std::path::{Path, PathBuf};
use std::process;

use serde::Serialize;

use phoenix_restore::disk_reader::DiskReader;
use phoenix_restore::file_carver;
use phoenix_restore::{
    EngineConfig, FileCategory, RecoveryEngine, RecoveryError, RestoreJob, RestoreOutcome,
    ResultFilter, ScanMode, ScanReport, VolumeHandle, CONFIG_ENV,
};

/// Flags shared by all commands, pulled out of the argument list.
#[derive(Default)]
struct Options {
    config: Option<PathBuf>,
    partition: Option<u32>,
    filter: ResultFilter,
}

#[derive(Serialize)]
struct RecoverResult<'a> {
    success: bool,
    message: String,
    scan: &'a ScanReport,
    jobs: Vec<RestoreJob>,
}

fn split_options(args: &[String]) -> Result<(Vec<String>, Options), String> {
    let mut positional = Vec::new();
    let mut options = Options::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = || {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{} needs a value", arg))
        };
        match arg.as_str() {
            "--config" => options.config = Some(PathBuf::from(value()?)),
            "--partition" => {
                let raw = value()?;
                let index = raw
                    .parse()
                    .map_err(|_| format!("invalid partition index: {}", raw))?;
                options.partition = Some(index);
            }
            "--category" => {
                let category: FileCategory =
                    value()?.parse().map_err(|e: RecoveryError| e.to_string())?;
                options.filter.category = Some(category);
            }
            "--name" => options.filter.name_contains = Some(value()?),
            _ => positional.push(arg.clone()),
        }
    }
    Ok((positional, options))
}

fn load_config(options: &Options) -> Result<EngineConfig, RecoveryError> {
    let path = options
        .config
        .clone()
        .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));
    match path {
        Some(path) => {
            log::info!("Loading configuration from {}", path.display());
            EngineConfig::load(&path)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string(value).map_err(|e| format!("cannot encode result: {}", e))?;
    println!("{}", json);
    Ok(())
}

fn open(engine: &RecoveryEngine, path: &str, options: &Options) -> Result<VolumeHandle, RecoveryError> {
    match options.partition {
        Some(index) => engine.open_partition(Path::new(path), index),
        None => engine.open_volume(Path::new(path)),
    }
}

fn parse_mode(raw: Option<&String>) -> Result<ScanMode, String> {
    match raw {
        Some(mode) => mode.parse().map_err(|e: RecoveryError| e.to_string()),
        None => Ok(ScanMode::Quick),
    }
}

fn scan(
    engine: &RecoveryEngine,
    path: &str,
    mode: ScanMode,
    options: &Options,
) -> Result<(u64, ScanReport), RecoveryError> {
    let volume = open(engine, path, options)?;
    let session = engine.start_scan(volume, mode)?;
    engine.wait_for_scan(session)?;
    let mut report = engine.report(session)?;
    report.entries.retain(|entry| options.filter.matches(entry));
    Ok((session, report))
}

fn run(command: &str, args: &[String], options: &Options) -> Result<bool, String> {
    let engine = || -> Result<RecoveryEngine, String> {
        let config = load_config(options).map_err(|e| e.to_string())?;
        RecoveryEngine::new(config).map_err(|e| e.to_string())
    };

    match command {
        "volume-info" => {
            let path = args.first().ok_or("Usage: phoenix_restore volume-info <path>")?;
            let engine = engine()?;
            let volume = open(&engine, path, options).map_err(|e| e.to_string())?;
            let info = engine.volume_info(volume).map_err(|e| e.to_string())?;
            print_json(&info)?;
            Ok(true)
        }

        "partitions" => {
            let path = args.first().ok_or("Usage: phoenix_restore partitions <path>")?;
            let reader = DiskReader::open(Path::new(path)).map_err(|e| e.to_string())?;
            let partitions = reader.list_partitions().map_err(|e| e.to_string())?;
            print_json(&partitions)?;
            Ok(true)
        }

        "scan" => {
            let path = args.first().ok_or("Usage: phoenix_restore scan <path> [mode]")?;
            let mode = parse_mode(args.get(1))?;
            let engine = engine()?;
            let (_, report) = scan(&engine, path, mode, options).map_err(|e| e.to_string())?;
            print_json(&report)?;
            Ok(report.success)
        }

        "recover" => {
            if args.len() < 3 {
                return Err(
                    "Usage: phoenix_restore recover <path> <mode> <destination> [entry-id ...]"
                        .to_string(),
                );
            }
            let mode = parse_mode(args.get(1))?;
            let destination = Path::new(&args[2]);
            let wanted = &args[3..];
            let engine = engine()?;
            let (session, report) =
                scan(&engine, &args[0], mode, options).map_err(|e| e.to_string())?;

            // Ids are accepted in full ("v1/inode-12") or by locator ("inode-12").
            let ids: Vec<_> = report
                .entries
                .iter()
                .filter(|entry| {
                    wanted.is_empty()
                        || wanted.iter().any(|w| {
                            *w == entry.id.to_string() || *w == entry.id.locator.to_string()
                        })
                })
                .map(|entry| entry.id)
                .collect();
            if ids.len() < wanted.len() {
                log::warn!("{} requested entries were not found", wanted.len() - ids.len());
            }

            let jobs = engine
                .restore_batch(session, &ids, destination)
                .map_err(|e| e.to_string())?;
            let restored = jobs
                .iter()
                .filter(|job| job.outcome == RestoreOutcome::Succeeded)
                .count();
            let result = RecoverResult {
                success: report.success && restored == jobs.len(),
                message: format!("Restored {} of {} entries", restored, jobs.len()),
                scan: &report,
                jobs,
            };
            print_json(&result)?;
            Ok(result.success)
        }

        "signatures" => {
            print_json(&file_carver::get_signature_stats())?;
            Ok(true)
        }

        "help" | "--help" | "-h" => {
            print_usage();
            Ok(true)
        }

        "version" | "--version" | "-v" => {
            println!("Phoenix Restore v{}", env!("CARGO_PKG_VERSION"));
            println!("Supports: FAT32, exFAT, NTFS, EXT4, HFS+ metadata recovery and signature carving");
            Ok(true)
        }

        _ => {
            print_usage();
            Err(format!("Unknown command: {}", command))
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let (positional, options) = match split_options(&args) {
        Ok(split) => split,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    let Some((command, rest)) = positional.split_first() else {
        print_usage();
        process::exit(1);
    };

    match run(command, rest, &options) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("{{\"success\": false, \"error\": {:?}}}", e);
            process::exit(1);
        }
    }
}

fn print_usage() {
    eprintln!(
        "
Phoenix Restore v{}
================================

COMMANDS:
  volume-info <path>              Show sector geometry and detected filesystem
  partitions <path>               List MBR partitions of a device or image
  scan <path> [mode]              Scan for deleted files
                                  Modes: quick (well-known folders), deep (all metadata),
                                  forensic (all metadata + carving of free space)
  recover <path> <mode> <destination> [entry-id ...]
                                  Scan, then restore the named entries (default: all)
  signatures                      List supported carving signatures
  help, --help, -h                Show this help message
  version, --version, -v          Show version information

OPTIONS:
  --config <file>                 JSON engine configuration (or set {})
  --partition <n>                 Use MBR partition n of <path>
  --category <name>               Keep documents, videos, images, emails, audio, archives or other
  --name <text>                   Keep entries whose name contains <text>

NOTES:
  - The destination must not be on the scanned volume
  - Logs go to stderr; set RUST_LOG to change the level
",
        env!("CARGO_PKG_VERSION"),
        CONFIG_ENV
    );
}
