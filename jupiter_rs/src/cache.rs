//! Per-project analysis cache under `<root>/.jupiter/cache/`.
//!
//! Two kinds of entries:
//! - `scan_index.json`: path -> fingerprint, used to decide "unchanged";
//! - `file_analysis/<key>.json`: one cached [`FileAnalysis`] keyed by
//!   `(path, fingerprint)`, so any content change misses the cache.
//!
//! Writers serialize through a lock file scoped to the cache directory;
//! readers are lock-free because every write is an atomic replace. Any
//! deserialization error discards the entry (fail-open).

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{JupiterError, Result};
use crate::types::{FileAnalysis, ScanFingerprint};

const LOCK_STALE_AFTER: Duration = Duration::from_secs(60);
const LOCK_WAIT: Duration = Duration::from_secs(10);

/// Atomic write: temp file in the destination directory, then rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::other("path has no parent for atomic write"))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new()
        .prefix("jupiter_tmp")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Held while mutating the cache; removing the file on drop releases it.
pub struct CacheLock {
    path: PathBuf,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct CacheStore {
    dir: PathBuf,
    volatile: HashSet<String>,
}

impl CacheStore {
    pub fn new(project_root: &Path, volatile_extensions: &[String]) -> Self {
        Self {
            dir: cache_dir(project_root),
            volatile: volatile_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    /// Whether a path's extension is on the never-cache list.
    pub fn is_volatile(&self, rel_path: &str) -> bool {
        Path::new(rel_path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.volatile.contains(&e.to_lowercase()))
            .unwrap_or(false)
    }

    /// Acquire the writer lock, waiting briefly and breaking stale locks.
    pub fn lock(&self) -> Result<CacheLock> {
        std::fs::create_dir_all(&self.dir)?;
        let lock_path = self.dir.join(".lock");
        let deadline = Instant::now() + LOCK_WAIT;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => return Ok(CacheLock { path: lock_path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&lock_path) {
                        let _ = std::fs::remove_file(&lock_path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(JupiterError::Cache(format!(
                            "cache lock held too long: {}",
                            lock_path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Read the scan index; any failure yields an empty map.
    pub fn load_scan_index(&self) -> HashMap<String, ScanFingerprint> {
        let path = self.dir.join("scan_index.json");
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(index) => index,
                Err(err) => {
                    warn!(error = %err, "discarding corrupt scan index");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        }
    }

    /// Replace the scan index under the writer lock.
    pub fn store_scan_index(&self, index: &HashMap<String, ScanFingerprint>) -> Result<()> {
        let _lock = self.lock()?;
        let text = serde_json::to_vec_pretty(index)?;
        write_atomic(&self.dir.join("scan_index.json"), &text)?;
        Ok(())
    }

    /// Cached analysis for `(path, fingerprint)`, if present and intact.
    pub fn load_analysis(
        &self,
        rel_path: &str,
        fingerprint: ScanFingerprint,
    ) -> Option<FileAnalysis> {
        let entry = self.entry_path(rel_path, fingerprint);
        let text = std::fs::read_to_string(&entry).ok()?;
        match serde_json::from_str(&text) {
            Ok(analysis) => Some(analysis),
            Err(err) => {
                warn!(path = rel_path, error = %err, "discarding corrupt cache entry");
                let _ = std::fs::remove_file(&entry);
                None
            }
        }
    }

    /// Write one analysis entry. Volatile extensions are never written.
    pub fn store_analysis(
        &self,
        rel_path: &str,
        fingerprint: ScanFingerprint,
        analysis: &FileAnalysis,
    ) -> Result<()> {
        if self.is_volatile(rel_path) {
            debug!(path = rel_path, "skipping volatile extension");
            return Ok(());
        }
        let text = serde_json::to_vec(analysis)?;
        write_atomic(&self.entry_path(rel_path, fingerprint), &text)?;
        Ok(())
    }

    /// Remove every cached analysis for a path, regardless of
    /// fingerprint. Used by `no_cache` before rewriting.
    pub fn wipe_entries_for(&self, rel_path: &str) {
        let prefix = path_key(rel_path);
        let Ok(entries) = std::fs::read_dir(self.dir.join("file_analysis")) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(&format!("{prefix}-"))
            {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    fn entry_path(&self, rel_path: &str, fingerprint: ScanFingerprint) -> PathBuf {
        self.dir.join("file_analysis").join(format!(
            "{}-{}-{}.json",
            path_key(rel_path),
            fingerprint.size_bytes,
            fingerprint.modified_at
        ))
    }
}

/// Cache directory for a project root.
pub fn cache_dir(project_root: &Path) -> PathBuf {
    project_root.join(".jupiter").join("cache")
}

fn path_key(rel_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rel_path.as_bytes());
    format!("{:x}", hasher.finalize())
        .chars()
        .take(16)
        .collect()
}

fn lock_is_stale(lock_path: &Path) -> bool {
    std::fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .map(|modified| {
            modified
                .elapsed()
                .map(|age| age > LOCK_STALE_AFTER)
                .unwrap_or(false)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> CacheStore {
        CacheStore::new(
            tmp.path(),
            &["tmp".to_string(), "log".to_string(), "pyc".to_string()],
        )
    }

    fn fp(size: u64, mtime: i64) -> ScanFingerprint {
        ScanFingerprint {
            size_bytes: size,
            modified_at: mtime,
        }
    }

    #[test]
    fn analysis_roundtrip_by_fingerprint() {
        let tmp = TempDir::new().expect("tmp dir");
        let cache = store(&tmp);
        let analysis = FileAnalysis::new("a.py".to_string(), "python");

        cache
            .store_analysis("a.py", fp(10, 100), &analysis)
            .expect("store");
        assert!(cache.load_analysis("a.py", fp(10, 100)).is_some());
        // A different fingerprint misses.
        assert!(cache.load_analysis("a.py", fp(11, 100)).is_none());
        assert!(cache.load_analysis("a.py", fp(10, 101)).is_none());
    }

    #[test]
    fn corrupt_entry_is_discarded() {
        let tmp = TempDir::new().expect("tmp dir");
        let cache = store(&tmp);
        let entry = cache.entry_path("a.py", fp(1, 1));
        std::fs::create_dir_all(entry.parent().expect("parent")).expect("mkdir");
        std::fs::write(&entry, "{not json").expect("write");

        assert!(cache.load_analysis("a.py", fp(1, 1)).is_none());
        // The corrupt file is gone afterwards.
        assert!(!entry.exists());
    }

    #[test]
    fn volatile_extensions_are_never_written() {
        let tmp = TempDir::new().expect("tmp dir");
        let cache = store(&tmp);
        let analysis = FileAnalysis::new("x.pyc".to_string(), "unknown");
        cache
            .store_analysis("x.pyc", fp(1, 1), &analysis)
            .expect("store is a no-op");
        assert!(cache.load_analysis("x.pyc", fp(1, 1)).is_none());
    }

    #[test]
    fn scan_index_roundtrip_and_corruption() {
        let tmp = TempDir::new().expect("tmp dir");
        let cache = store(&tmp);
        let mut index = HashMap::new();
        index.insert("a.py".to_string(), fp(10, 100));
        cache.store_scan_index(&index).expect("store");
        assert_eq!(cache.load_scan_index(), index);

        std::fs::write(cache_dir(tmp.path()).join("scan_index.json"), "garbage")
            .expect("corrupt");
        assert!(cache.load_scan_index().is_empty());
    }

    #[test]
    fn wipe_removes_all_fingerprints_for_path() {
        let tmp = TempDir::new().expect("tmp dir");
        let cache = store(&tmp);
        let analysis = FileAnalysis::new("a.py".to_string(), "python");
        cache.store_analysis("a.py", fp(1, 1), &analysis).expect("store");
        cache.store_analysis("a.py", fp(2, 2), &analysis).expect("store");
        cache.store_analysis("b.py", fp(1, 1), &analysis).expect("store");

        cache.wipe_entries_for("a.py");
        assert!(cache.load_analysis("a.py", fp(1, 1)).is_none());
        assert!(cache.load_analysis("a.py", fp(2, 2)).is_none());
        assert!(cache.load_analysis("b.py", fp(1, 1)).is_some());
    }

    #[test]
    fn lock_excludes_second_writer() {
        let tmp = TempDir::new().expect("tmp dir");
        let cache = store(&tmp);
        let lock = cache.lock().expect("first lock");
        let lock_path = cache_dir(tmp.path()).join(".lock");
        assert!(lock_path.exists());
        drop(lock);
        assert!(!lock_path.exists());
        // Re-acquirable after release.
        let _second = cache.lock().expect("second lock");
    }
}
