//! Core types for Jupiter scans.
//!
//! This module defines the fundamental data structures shared across the
//! engine:
//! - [`FileRecord`] / [`ScanReport`] - the immutable result of a scan
//! - [`FileAnalysis`] - per-file derivation cached across scans
//! - [`SymbolRecord`] / [`CallSite`] - extracted symbols and call evidence
//! - [`ScanOptions`] - scan configuration

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written into every persisted report and snapshot.
/// Readers accept any older minor version of the same major.
pub const SCHEMA_VERSION: &str = "1.2";

/// Crate version stamped into reports.
pub const JUPITER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default maximum file size fed to a language analyzer (10 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Cheap change-detection key: a file is considered unchanged when both
/// size and mtime match the cached pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanFingerprint {
    /// File size in bytes.
    pub size_bytes: u64,
    /// Modification time (Unix seconds).
    pub modified_at: i64,
}

/// Symbol kind extracted by the language analyzers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Method,
    Class,
}

/// A symbol defined in a source file.
///
/// Identity is `path + "::" + qualified_name`; every symbol's owning file
/// has a [`FileRecord`] in the same report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SymbolRecord {
    /// Owning file, project-relative.
    pub path: String,
    /// Bare symbol name.
    pub name: String,
    /// Qualified name (`Class.method` for methods, otherwise the name).
    pub qualified_name: String,
    pub kind: SymbolKind,
    /// 1-based line of the declaration.
    pub start_line: usize,
    /// True if a docstring/doc comment directly follows the declaration.
    pub doc_present: bool,
    /// Decorator names in dotted rendering (e.g. `router.get`), sorted.
    #[serde(default)]
    pub decorator_tags: Vec<String>,
    /// Cyclomatic complexity: 1 + branching constructs + short-circuits.
    pub cyclomatic_complexity: u32,
    /// True when a recognized dynamic-registration call site references
    /// this symbol by literal name.
    #[serde(default)]
    pub dynamically_registered: bool,
}

impl SymbolRecord {
    /// Stable symbol id used by graph edges and dynamic trace maps.
    pub fn id(&self) -> String {
        format!("{}::{}", self.path, self.qualified_name)
    }

    /// Leading-underscore names are treated as private.
    pub fn is_private(&self) -> bool {
        self.name.starts_with('_')
    }
}

/// Whether a call edge's callee was matched to a known symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResolution {
    Resolved,
    Unresolved,
}

/// A call site observed in a source file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallSite {
    /// Enclosing symbol id, None for module-level calls.
    pub caller: Option<String>,
    /// Callee name as written (unqualified).
    pub callee: String,
    /// 1-based line number.
    pub line: usize,
}

/// A resolved call edge in the dependency graph. Duplicates are kept:
/// the graph is a multigraph and edge counts matter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallEdge {
    /// Caller symbol id.
    pub caller: String,
    /// Callee name as written.
    pub callee: String,
    pub resolution: CallResolution,
}

/// An import statement, rendered as the target module string.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportRecord {
    /// Module as written (`pkg.mod`, `./util`, `react`).
    pub module: String,
    /// 1-based line number.
    pub line: usize,
    /// Project-relative path when the import resolves to a local file.
    #[serde(default)]
    pub resolved_path: Option<String>,
}

/// Rolling hash of one normalized n-line window, used for duplication
/// clustering.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DuplicationFingerprint {
    /// Window hash (stable across runs for identical bytes).
    pub hash: u64,
    /// 1-based line where the window starts.
    pub start_line: usize,
}

/// Per-file derivation produced by a language analyzer.
///
/// Cached keyed by `(path, scan_fingerprint)` so any content change
/// invalidates the entry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileAnalysis {
    /// Relative path from project root.
    #[serde(default)]
    pub path: String,
    /// Detected language: "python", "javascript", "typescript", "unknown".
    #[serde(default)]
    pub language_tag: String,
    /// Lines in the file.
    #[serde(default)]
    pub loc: usize,
    /// Symbols defined in the file.
    #[serde(default)]
    pub symbols: Vec<SymbolRecord>,
    /// Import statements.
    #[serde(default)]
    pub imports: Vec<ImportRecord>,
    /// Observed call sites.
    #[serde(default)]
    pub call_sites: Vec<CallSite>,
    /// Exported names (JS/TS); empty for languages without export syntax.
    #[serde(default)]
    pub exports: Vec<String>,
    /// Normalized-window hashes for duplication clustering.
    #[serde(default)]
    pub duplication_fingerprints: Vec<DuplicationFingerprint>,
}

impl FileAnalysis {
    pub fn new(path: String, language_tag: &str) -> Self {
        Self {
            path,
            language_tag: language_tag.to_string(),
            ..Default::default()
        }
    }
}

/// One file in a [`ScanReport`]. Invariant: no two records share `path`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileRecord {
    /// Project-relative path with `/` separators.
    pub path: String,
    pub size_bytes: u64,
    /// Modification time (Unix seconds).
    pub modified_at: i64,
    pub language_tag: String,
    /// Strong hash of the file bytes (sha256 hex); None for skipped files.
    #[serde(default)]
    pub content_hash: Option<String>,
    pub scan_fingerprint: ScanFingerprint,
    /// True when the file exceeded the analyzer size threshold.
    #[serde(default)]
    pub skipped_large: bool,
    /// Captured per-file analysis failure; non-fatal for the scan.
    #[serde(default)]
    pub analysis_error: Option<String>,
    /// The per-file analysis (empty for unknown/skipped/errored files).
    #[serde(default)]
    pub analysis: FileAnalysis,
}

/// Per-language aggregate inside a report.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LanguageSummary {
    pub file_count: usize,
    pub symbol_count: usize,
    pub total_bytes: u64,
}

/// Immutable result of one scan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanReport {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub project_root: String,
    pub created_at: DateTime<Utc>,
    pub jupiter_version: String,
    /// Sorted lexicographically by path; scans are bitwise-reproducible
    /// given identical inputs.
    pub files: Vec<FileRecord>,
    /// Per-language aggregates.
    #[serde(default)]
    pub language_summary: BTreeMap<String, LanguageSummary>,
    /// Sections attached by plugins, by plugin id. Attached by copy -
    /// the report itself is never mutated after production.
    #[serde(default)]
    pub plugin_sections: BTreeMap<String, serde_json::Value>,
}

fn default_schema_version() -> String {
    "1.0".to_string()
}

impl ScanReport {
    pub fn new(project_root: String) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            project_root,
            created_at: Utc::now(),
            jupiter_version: JUPITER_VERSION.to_string(),
            files: Vec::new(),
            language_summary: BTreeMap::new(),
            plugin_sections: BTreeMap::new(),
        }
    }

    /// Total symbols across all files.
    pub fn symbol_count(&self) -> usize {
        self.files.iter().map(|f| f.analysis.symbols.len()).sum()
    }

    /// Total bytes across all files.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }

    pub fn file(&self, path: &str) -> Option<&FileRecord> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Options accepted by [`crate::scanner::scan`].
#[derive(Clone, Debug)]
pub struct ScanOptions {
    /// Include dotfiles and dot-directories.
    pub include_hidden: bool,
    /// Extra ignore globs applied on top of config + `.jupiterignore`.
    pub ignore_globs: Vec<String>,
    /// Reuse cached per-file analyses when fingerprints match.
    pub incremental: bool,
    /// Bypass cache reads and wipe matching entries before writing.
    pub no_cache: bool,
    /// Worker pool size; 0 selects the available parallelism.
    pub workers: usize,
    /// Per-file size gate for analyzers.
    pub max_file_size_bytes: u64,
    /// Persist a snapshot of the produced report.
    pub capture_snapshot: bool,
    /// Optional label for the captured snapshot.
    pub snapshot_label: Option<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include_hidden: false,
            ignore_globs: Vec::new(),
            incremental: true,
            no_cache: false,
            workers: 0,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE,
            capture_snapshot: false,
            snapshot_label: None,
        }
    }
}

/// Cooperative cancellation flag shared with scan workers and the runner.
/// Workers check it between files; flipping it never interrupts a parse
/// mid-file.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_id_joins_path_and_qualified_name() {
        let sym = SymbolRecord {
            path: "pkg/api.py".to_string(),
            name: "get_user".to_string(),
            qualified_name: "UserView.get_user".to_string(),
            kind: SymbolKind::Method,
            start_line: 10,
            doc_present: false,
            decorator_tags: Vec::new(),
            cyclomatic_complexity: 1,
            dynamically_registered: false,
        };
        assert_eq!(sym.id(), "pkg/api.py::UserView.get_user");
        assert!(!sym.is_private());
    }

    #[test]
    fn fingerprint_equality_tracks_size_and_mtime() {
        let a = ScanFingerprint {
            size_bytes: 10,
            modified_at: 100,
        };
        let b = ScanFingerprint {
            size_bytes: 10,
            modified_at: 100,
        };
        let c = ScanFingerprint {
            size_bytes: 11,
            modified_at: 100,
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn report_roundtrips_through_json() {
        let mut report = ScanReport::new("/tmp/p".to_string());
        report.files.push(FileRecord {
            path: "a.py".to_string(),
            size_bytes: 42,
            modified_at: 1,
            language_tag: "python".to_string(),
            content_hash: Some("deadbeef".to_string()),
            scan_fingerprint: ScanFingerprint {
                size_bytes: 42,
                modified_at: 1,
            },
            skipped_large: false,
            analysis_error: None,
            analysis: FileAnalysis::new("a.py".to_string(), "python"),
        });
        let json = serde_json::to_string(&report).expect("serialize");
        let back: ScanReport = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.files.len(), 1);
        assert_eq!(back.files[0].path, "a.py");
        assert_eq!(back.schema_version, SCHEMA_VERSION);
    }
}
