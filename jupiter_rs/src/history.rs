//! Snapshot history: persisted `(metadata, report)` pairs with diffs.
//!
//! Snapshots live under `<root>/.jupiter/snapshots/` as
//! `<id>.meta.json` + `<id>.report.json` and are never mutated after
//! creation. Ids embed wall-clock millis (`scan-<ms>`); collisions get a
//! numeric suffix. Readers need no lock (files are immutable); writers
//! serialize via a directory lock file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::write_atomic;
use crate::error::{JupiterError, Result};
use crate::types::{ScanReport, SymbolKind, SCHEMA_VERSION};

/// Metadata half of a persisted snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Monotonic with respect to creation time: `scan-<millis>[-n]`.
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub label: Option<String>,
    pub jupiter_version: String,
    #[serde(default = "default_backend")]
    pub backend_name: String,
    pub project_root: String,
    #[serde(default = "default_meta_schema")]
    pub schema_version: String,
    // Counts copied from the report for cheap listing.
    #[serde(default)]
    pub file_count: usize,
    #[serde(default)]
    pub symbol_count: usize,
    #[serde(default)]
    pub total_bytes: u64,
}

fn default_backend() -> String {
    "local".to_string()
}

fn default_meta_schema() -> String {
    "1.0".to_string()
}

/// Signed deltas of the headline metrics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricsDelta {
    pub file_count: i64,
    pub symbol_count: i64,
    pub total_bytes: i64,
}

/// One added or removed file in a diff.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub size_bytes: u64,
}

/// A file present on both sides with changed content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModifiedFile {
    pub path: String,
    pub size_before: u64,
    pub size_after: u64,
}

/// Structured difference between two snapshots.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub metrics_delta: MetricsDelta,
    pub files_added: Vec<FileChange>,
    pub files_removed: Vec<FileChange>,
    pub files_modified: Vec<ModifiedFile>,
    /// Symbol ids (functions and methods) new in the second snapshot.
    pub functions_added: Vec<String>,
    pub functions_removed: Vec<String>,
}

/// Snapshot directory for a project root.
pub fn snapshots_dir(root: &Path) -> PathBuf {
    root.join(".jupiter").join("snapshots")
}

/// Persist a `(metadata, report)` pair, returning the metadata.
pub fn create_snapshot(
    root: &Path,
    report: &ScanReport,
    label: Option<&str>,
    backend_name: Option<&str>,
) -> Result<SnapshotMetadata> {
    let dir = snapshots_dir(root);
    std::fs::create_dir_all(&dir)?;
    let _lock = DirLock::acquire(&dir)?;

    let created_at = Utc::now();
    let base = format!("scan-{}", created_at.timestamp_millis());
    let mut id = base.clone();
    let mut suffix = 0u32;
    while dir.join(format!("{id}.meta.json")).exists() {
        suffix += 1;
        id = format!("{base}-{suffix}");
    }

    let metadata = SnapshotMetadata {
        id: id.clone(),
        created_at,
        label: label.map(str::to_string),
        jupiter_version: report.jupiter_version.clone(),
        backend_name: backend_name.unwrap_or("local").to_string(),
        project_root: report.project_root.clone(),
        schema_version: SCHEMA_VERSION.to_string(),
        file_count: report.files.len(),
        symbol_count: report.symbol_count(),
        total_bytes: report.total_bytes(),
    };

    write_atomic(
        &dir.join(format!("{id}.report.json")),
        &serde_json::to_vec(report)?,
    )?;
    write_atomic(
        &dir.join(format!("{id}.meta.json")),
        &serde_json::to_vec_pretty(&metadata)?,
    )?;
    debug!(id = %id, "snapshot created");
    Ok(metadata)
}

/// All snapshot metadata, sorted by `created_at` desc.
pub fn list_snapshots(root: &Path) -> Result<Vec<SnapshotMetadata>> {
    let dir = snapshots_dir(root);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Ok(Vec::new());
    };
    let mut snapshots = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(_id) = name.strip_suffix(".meta.json") else {
            continue;
        };
        match std::fs::read_to_string(entry.path())
            .map_err(JupiterError::from)
            .and_then(|text| Ok(serde_json::from_str::<SnapshotMetadata>(&text)?))
        {
            Ok(meta) => snapshots.push(meta),
            // A torn or foreign file never breaks the listing.
            Err(err) => debug!(file = %name, error = %err, "skipping unreadable metadata"),
        }
    }
    snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    Ok(snapshots)
}

/// Load one snapshot pair, or `not_found`.
pub fn load_snapshot(root: &Path, id: &str) -> Result<(SnapshotMetadata, ScanReport)> {
    let dir = snapshots_dir(root);
    let meta_path = dir.join(format!("{id}.meta.json"));
    let report_path = dir.join(format!("{id}.report.json"));
    if !meta_path.exists() || !report_path.exists() {
        return Err(JupiterError::NotFound(format!("snapshot {id}")));
    }
    let metadata: SnapshotMetadata =
        serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
    check_schema_compat(&metadata.schema_version)?;
    let report: ScanReport = serde_json::from_str(&std::fs::read_to_string(&report_path)?)?;
    Ok((metadata, report))
}

/// Remove a snapshot pair, or `not_found`.
pub fn delete_snapshot(root: &Path, id: &str) -> Result<()> {
    let dir = snapshots_dir(root);
    let meta_path = dir.join(format!("{id}.meta.json"));
    if !meta_path.exists() {
        return Err(JupiterError::NotFound(format!("snapshot {id}")));
    }
    let _lock = DirLock::acquire(&dir)?;
    std::fs::remove_file(&meta_path)?;
    let _ = std::fs::remove_file(dir.join(format!("{id}.report.json")));
    Ok(())
}

/// Structured diff of two stored snapshots.
pub fn diff(root: &Path, id_a: &str, id_b: &str) -> Result<SnapshotDiff> {
    let (meta_a, report_a) = load_snapshot(root, id_a)?;
    let (meta_b, report_b) = load_snapshot(root, id_b)?;
    Ok(diff_reports(&meta_a, &report_a, &meta_b, &report_b))
}

/// Diff two in-memory snapshots (a -> b).
pub fn diff_reports(
    meta_a: &SnapshotMetadata,
    report_a: &ScanReport,
    meta_b: &SnapshotMetadata,
    report_b: &ScanReport,
) -> SnapshotDiff {
    let mut out = SnapshotDiff {
        metrics_delta: MetricsDelta {
            file_count: meta_b.file_count as i64 - meta_a.file_count as i64,
            symbol_count: meta_b.symbol_count as i64 - meta_a.symbol_count as i64,
            total_bytes: meta_b.total_bytes as i64 - meta_a.total_bytes as i64,
        },
        ..Default::default()
    };

    let index_a: std::collections::BTreeMap<&str, &crate::types::FileRecord> =
        report_a.files.iter().map(|f| (f.path.as_str(), f)).collect();
    let index_b: std::collections::BTreeMap<&str, &crate::types::FileRecord> =
        report_b.files.iter().map(|f| (f.path.as_str(), f)).collect();

    for (path, file) in &index_b {
        match index_a.get(path) {
            None => out.files_added.push(FileChange {
                path: file.path.clone(),
                size_bytes: file.size_bytes,
            }),
            Some(before) => {
                if file_modified(before, file) {
                    out.files_modified.push(ModifiedFile {
                        path: file.path.clone(),
                        size_before: before.size_bytes,
                        size_after: file.size_bytes,
                    });
                }
            }
        }
    }
    for (path, file) in &index_a {
        if !index_b.contains_key(path) {
            out.files_removed.push(FileChange {
                path: file.path.clone(),
                size_bytes: file.size_bytes,
            });
        }
    }

    let funcs = |report: &ScanReport| -> std::collections::BTreeSet<String> {
        report
            .files
            .iter()
            .flat_map(|f| f.analysis.symbols.iter())
            .filter(|s| matches!(s.kind, SymbolKind::Function | SymbolKind::Method))
            .map(|s| s.id())
            .collect()
    };
    let funcs_a = funcs(report_a);
    let funcs_b = funcs(report_b);
    out.functions_added = funcs_b.difference(&funcs_a).cloned().collect();
    out.functions_removed = funcs_a.difference(&funcs_b).cloned().collect();
    out
}

/// Modified iff content hashes differ, falling back to fingerprints when
/// either side has no hash.
fn file_modified(before: &crate::types::FileRecord, after: &crate::types::FileRecord) -> bool {
    match (&before.content_hash, &after.content_hash) {
        (Some(a), Some(b)) => a != b,
        _ => before.scan_fingerprint != after.scan_fingerprint,
    }
}

/// Accept any older minor of the same major.
fn check_schema_compat(found: &str) -> Result<()> {
    let parse = |v: &str| -> Option<(u32, u32)> {
        let (major, minor) = v.split_once('.')?;
        Some((major.parse().ok()?, minor.parse().ok()?))
    };
    let (cur_major, cur_minor) = parse(SCHEMA_VERSION).unwrap_or((0, 0));
    let Some((major, minor)) = parse(found) else {
        return Err(JupiterError::Parse(format!("bad schema version: {found}")));
    };
    if major != cur_major || minor > cur_minor {
        return Err(JupiterError::Parse(format!(
            "unsupported snapshot schema {found} (current {SCHEMA_VERSION})"
        )));
    }
    Ok(())
}

struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(".lock");
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if std::time::Instant::now() >= deadline {
                        return Err(JupiterError::Internal(format!(
                            "snapshot directory locked: {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FileAnalysis, FileRecord, ScanFingerprint};
    use tempfile::TempDir;

    fn record(path: &str, size: u64, hash: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size_bytes: size,
            modified_at: 1,
            language_tag: "python".to_string(),
            content_hash: Some(hash.to_string()),
            scan_fingerprint: ScanFingerprint {
                size_bytes: size,
                modified_at: 1,
            },
            skipped_large: false,
            analysis_error: None,
            analysis: FileAnalysis::new(path.to_string(), "python"),
        }
    }

    fn report(root: &Path, files: Vec<FileRecord>) -> ScanReport {
        let mut r = ScanReport::new(root.display().to_string());
        r.files = files;
        r
    }

    #[test]
    fn create_list_load_roundtrip() {
        let tmp = TempDir::new().expect("tmp dir");
        let r = report(tmp.path(), vec![record("a.py", 10, "h1")]);
        let meta = create_snapshot(tmp.path(), &r, Some("first"), None).expect("create");
        assert!(meta.id.starts_with("scan-"));
        assert_eq!(meta.file_count, 1);
        assert_eq!(meta.backend_name, "local");

        let listed = list_snapshots(tmp.path()).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, meta.id);

        let (loaded_meta, loaded_report) = load_snapshot(tmp.path(), &meta.id).expect("load");
        assert_eq!(loaded_meta.label.as_deref(), Some("first"));
        assert_eq!(loaded_report.files.len(), 1);
    }

    #[test]
    fn missing_snapshot_is_not_found() {
        let tmp = TempDir::new().expect("tmp dir");
        let err = load_snapshot(tmp.path(), "scan-0").expect_err("missing");
        assert_eq!(err.code(), "not_found");
        let err = diff(tmp.path(), "scan-0", "scan-1").expect_err("missing");
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn id_collisions_get_numeric_suffixes() {
        let tmp = TempDir::new().expect("tmp dir");
        let r = report(tmp.path(), vec![]);
        let ids: Vec<String> = (0..3)
            .map(|_| create_snapshot(tmp.path(), &r, None, None).expect("create").id)
            .collect();
        let unique: std::collections::HashSet<&String> = ids.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn diff_of_snapshot_with_itself_is_empty() {
        let tmp = TempDir::new().expect("tmp dir");
        let r = report(tmp.path(), vec![record("a.py", 10, "h1")]);
        let meta = create_snapshot(tmp.path(), &r, None, None).expect("create");
        let d = diff(tmp.path(), &meta.id, &meta.id).expect("diff");
        assert!(d.files_added.is_empty());
        assert!(d.files_removed.is_empty());
        assert!(d.files_modified.is_empty());
        assert_eq!(d.metrics_delta.file_count, 0);
        assert_eq!(d.metrics_delta.total_bytes, 0);
    }

    #[test]
    fn one_added_file_shows_up_alone() {
        let tmp = TempDir::new().expect("tmp dir");
        let r1 = report(tmp.path(), vec![record("a.py", 10, "h1")]);
        let m1 = create_snapshot(tmp.path(), &r1, None, None).expect("s1");
        let r2 = report(
            tmp.path(),
            vec![record("a.py", 10, "h1"), record("b.py", 20, "h2")],
        );
        let m2 = create_snapshot(tmp.path(), &r2, None, None).expect("s2");

        let d = diff(tmp.path(), &m1.id, &m2.id).expect("diff");
        assert_eq!(d.files_added.len(), 1);
        assert_eq!(d.files_added[0].path, "b.py");
        assert!(d.files_removed.is_empty());
        assert_eq!(d.metrics_delta.file_count, 1);
    }

    #[test]
    fn modified_by_hash_with_fingerprint_fallback() {
        let before = record("a.py", 10, "h1");
        let mut after = record("a.py", 10, "h2");
        assert!(file_modified(&before, &after));

        // Same hash: unchanged even if size differs.
        after.content_hash = Some("h1".to_string());
        after.size_bytes = 11;
        assert!(!file_modified(&before, &after));

        // No hashes: fall back to fingerprints.
        let mut a = record("a.py", 10, "x");
        let mut b = record("a.py", 10, "x");
        a.content_hash = None;
        b.content_hash = None;
        b.scan_fingerprint.modified_at = 2;
        assert!(file_modified(&a, &b));
    }

    #[test]
    fn older_minor_schema_accepted_newer_rejected() {
        assert!(check_schema_compat("1.0").is_ok());
        assert!(check_schema_compat(SCHEMA_VERSION).is_ok());
        assert!(check_schema_compat("1.99").is_err());
        assert!(check_schema_compat("2.0").is_err());
        assert!(check_schema_compat("junk").is_err());
    }

    #[test]
    fn delete_removes_pair() {
        let tmp = TempDir::new().expect("tmp dir");
        let r = report(tmp.path(), vec![]);
        let meta = create_snapshot(tmp.path(), &r, None, None).expect("create");
        delete_snapshot(tmp.path(), &meta.id).expect("delete");
        assert!(list_snapshots(tmp.path()).expect("list").is_empty());
        assert_eq!(
            delete_snapshot(tmp.path(), &meta.id).expect_err("gone").code(),
            "not_found"
        );
    }
}
