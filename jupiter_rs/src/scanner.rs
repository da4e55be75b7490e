//! Scanner: parallel filesystem walk producing a [`ScanReport`].
//!
//! The walk consults the ignore engine, partitions candidates against
//! the cache by fingerprint, and re-analyzes only changed files on a
//! bounded worker pool. Per-file failures are captured in the report and
//! never abort the scan. `files[]` comes out sorted lexicographically by
//! path, so scans are bitwise-reproducible given identical inputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::analyzer;
use crate::cache::CacheStore;
use crate::config::JupiterConfig;
use crate::error::{JupiterError, Result};
use crate::history;
use crate::ignore::IgnoreEngine;
use crate::types::{
    CancelToken, FileAnalysis, FileRecord, LanguageSummary, ScanFingerprint, ScanOptions,
    ScanReport,
};

/// Result of one scan, with observability counters used by tests and
/// the incremental-equivalence contract.
#[derive(Debug)]
pub struct ScanOutcome {
    pub report: ScanReport,
    /// Files that went through a language analyzer (cache misses).
    pub parsed_files: usize,
    /// Non-fatal notes (malformed ignore patterns, discarded entries).
    pub warnings: Vec<String>,
    /// Metadata of the captured snapshot, when requested.
    pub snapshot: Option<history::SnapshotMetadata>,
}

struct Candidate {
    rel: String,
    abs: PathBuf,
    fingerprint: ScanFingerprint,
    cached: Option<FileAnalysis>,
}

/// Scan `root` into a report.
pub fn scan(
    root: &Path,
    options: &ScanOptions,
    config: &JupiterConfig,
    cancel: &CancelToken,
) -> Result<ScanOutcome> {
    let root = root
        .canonicalize()
        .map_err(|e| JupiterError::Validation(format!("bad scan root {}: {e}", root.display())))?;
    let ignore = IgnoreEngine::new(&root, &config.scan.ignore_globs, &options.ignore_globs);
    let mut warnings = ignore.warnings.clone();

    let cache = CacheStore::new(&root, &config.scan.volatile_extensions);
    let scan_index = if options.incremental && !options.no_cache {
        cache.load_scan_index()
    } else {
        Default::default()
    };

    // Candidate set: every non-ignored regular file under root.
    let mut candidates = collect_candidates(&root, options, &ignore)?;
    candidates.sort_by(|a, b| a.rel.cmp(&b.rel));

    // Partition: unchanged files reuse the cached analysis and skip C3.
    for candidate in &mut candidates {
        if options.no_cache {
            cache.wipe_entries_for(&candidate.rel);
            continue;
        }
        if !options.incremental {
            continue;
        }
        if scan_index.get(&candidate.rel) == Some(&candidate.fingerprint) {
            candidate.cached = cache.load_analysis(&candidate.rel, candidate.fingerprint);
        }
    }

    let parsed_counter = AtomicUsize::new(0);
    let next = AtomicUsize::new(0);
    let records: Mutex<Vec<FileRecord>> = Mutex::new(Vec::with_capacity(candidates.len()));

    let worker_count = effective_workers(options, config, candidates.len());
    debug!(files = candidates.len(), workers = worker_count, "scan dispatch");

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| loop {
                if cancel.is_cancelled() {
                    return;
                }
                let idx = next.fetch_add(1, Ordering::Relaxed);
                let Some(candidate) = candidates.get(idx) else {
                    return;
                };
                let record = process_file(
                    candidate,
                    options.max_file_size_bytes,
                    &cache,
                    &parsed_counter,
                );
                records.lock().expect("records lock poisoned").push(record);
            });
        }
    });

    if cancel.is_cancelled() {
        return Err(JupiterError::Internal("scan cancelled".to_string()));
    }

    let mut files = records.into_inner().expect("records lock poisoned");
    files.sort_by(|a, b| a.path.cmp(&b.path));

    // Refresh the scan index with the fingerprints we just observed.
    let new_index = files
        .iter()
        .map(|f| (f.path.clone(), f.scan_fingerprint))
        .collect();
    if let Err(err) = cache.store_scan_index(&new_index) {
        warnings.push(format!("scan index not persisted: {err}"));
    }

    let mut report = ScanReport::new(root.display().to_string());
    report.language_summary = summarize_languages(&files);
    report.files = files;

    let snapshot = if options.capture_snapshot {
        Some(history::create_snapshot(
            &root,
            &report,
            options.snapshot_label.as_deref(),
            None,
        )?)
    } else {
        None
    };

    info!(
        files = report.files.len(),
        parsed = parsed_counter.load(Ordering::Relaxed),
        "scan finished"
    );
    Ok(ScanOutcome {
        report,
        parsed_files: parsed_counter.load(Ordering::Relaxed),
        warnings,
        snapshot,
    })
}

fn effective_workers(options: &ScanOptions, config: &JupiterConfig, files: usize) -> usize {
    if !config.performance.parallel_scan {
        return 1;
    }
    let requested = if options.workers > 0 {
        options.workers
    } else if config.performance.workers > 0 {
        config.performance.workers
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    };
    requested.clamp(1, files.max(1))
}

fn collect_candidates(
    root: &Path,
    options: &ScanOptions,
    ignore: &IgnoreEngine,
) -> Result<Vec<Candidate>> {
    let mut candidates = Vec::new();
    let walker = WalkDir::new(root).min_depth(1).into_iter();
    let mut it = walker.filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        if !options.include_hidden && name.starts_with('.') {
            return false;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        !ignore.should_ignore(&rel)
    });
    while let Some(entry) = it.next() {
        let entry = match entry {
            Ok(e) => e,
            // Unreadable directories are skipped, not fatal.
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let modified_at = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        candidates.push(Candidate {
            abs: entry.path().to_path_buf(),
            fingerprint: ScanFingerprint {
                size_bytes: meta.len(),
                modified_at,
            },
            rel,
            cached: None,
        });
    }
    Ok(candidates)
}

/// Analyze one candidate into a record. Never fails: analysis errors are
/// captured on the record.
fn process_file(
    candidate: &Candidate,
    max_file_size: u64,
    cache: &CacheStore,
    parsed_counter: &AtomicUsize,
) -> FileRecord {
    let ext = Path::new(&candidate.rel)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    let language_tag = analyzer::language_for_extension(&ext).to_string();

    let mut record = FileRecord {
        path: candidate.rel.clone(),
        size_bytes: candidate.fingerprint.size_bytes,
        modified_at: candidate.fingerprint.modified_at,
        language_tag: language_tag.clone(),
        content_hash: None,
        scan_fingerprint: candidate.fingerprint,
        skipped_large: false,
        analysis_error: None,
        analysis: FileAnalysis::new(candidate.rel.clone(), &language_tag),
    };

    if candidate.fingerprint.size_bytes > max_file_size {
        record.skipped_large = true;
        return record;
    }

    let bytes = match std::fs::read(&candidate.abs) {
        Ok(b) => b,
        Err(err) => {
            record.analysis_error = Some(format!("read failed: {err}"));
            return record;
        }
    };
    record.content_hash = Some(hex_sha256(&bytes));

    if let Some(cached) = &candidate.cached {
        record.language_tag = cached.language_tag.clone();
        record.analysis = cached.clone();
        return record;
    }

    let content = match String::from_utf8(bytes) {
        Ok(c) => c,
        Err(_) => {
            record.analysis_error = Some("not valid utf-8".to_string());
            return record;
        }
    };
    parsed_counter.fetch_add(1, Ordering::Relaxed);
    match analyzer::analyze_source(&candidate.rel, &ext, &content) {
        Ok(analysis) => {
            record.language_tag = analysis.language_tag.clone();
            if let Err(err) = cache.store_analysis(&candidate.rel, candidate.fingerprint, &analysis)
            {
                debug!(path = %candidate.rel, error = %err, "cache write skipped");
            }
            record.analysis = analysis;
        }
        Err(err) => {
            record.analysis_error = Some(err.to_string());
        }
    }
    record
}

fn summarize_languages(files: &[FileRecord]) -> BTreeMap<String, LanguageSummary> {
    let mut summary: BTreeMap<String, LanguageSummary> = BTreeMap::new();
    for file in files {
        let entry = summary.entry(file.language_tag.clone()).or_default();
        entry.file_count += 1;
        entry.symbol_count += file.analysis.symbols.len();
        entry.total_bytes += file.size_bytes;
    }
    summary
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
