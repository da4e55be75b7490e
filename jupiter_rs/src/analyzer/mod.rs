//! Language analyzers.
//!
//! Each analyzer turns `(path, content)` into a [`FileAnalysis`] or a
//! typed parse error. Dispatch is by extension; unknown extensions yield
//! an empty analysis tagged `unknown`. The contract is bit-stable:
//! identical source bytes produce an identical `FileAnalysis`, so
//! analyzers never consult the filesystem.

pub mod javascript;
pub mod python;
pub mod tables;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::types::{DuplicationFingerprint, FileAnalysis};

/// Window length (normalized lines) for duplication fingerprints.
pub const DUP_WINDOW: usize = 5;

/// Capability implemented per language.
pub trait LanguageAnalyzer: Send + Sync {
    /// Tag recorded on files this analyzer produces.
    fn language_tag(&self) -> &'static str;
    /// Parse one file. Per-file failures are typed `parse_error`s; the
    /// scanner captures them without aborting.
    fn analyze(&self, rel_path: &str, content: &str) -> Result<FileAnalysis>;
}

static PYTHON: python::PythonAnalyzer = python::PythonAnalyzer;
static JAVASCRIPT: javascript::JsAnalyzer = javascript::JsAnalyzer {
    tag: "javascript",
};
static TYPESCRIPT: javascript::JsAnalyzer = javascript::JsAnalyzer {
    tag: "typescript",
};

/// Language tag for a file extension (lowercased, no dot).
pub fn language_for_extension(ext: &str) -> &'static str {
    match ext {
        "py" | "pyi" => "python",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" | "mts" => "typescript",
        _ => "unknown",
    }
}

/// The analyzer serving a language tag, if one exists.
pub fn analyzer_for(language_tag: &str) -> Option<&'static dyn LanguageAnalyzer> {
    match language_tag {
        "python" => Some(&PYTHON),
        "javascript" => Some(&JAVASCRIPT),
        "typescript" => Some(&TYPESCRIPT),
        _ => None,
    }
}

/// Dispatch on extension. Unknown extensions produce an empty analysis
/// with `language_tag = "unknown"`.
pub fn analyze_source(rel_path: &str, ext: &str, content: &str) -> Result<FileAnalysis> {
    let tag = language_for_extension(ext);
    match analyzer_for(tag) {
        Some(analyzer) => analyzer.analyze(rel_path, content),
        None => Ok(FileAnalysis::new(rel_path.to_string(), "unknown")),
    }
}

/// Rolling fingerprints over normalized [`DUP_WINDOW`]-line windows.
///
/// Normalization trims each line, collapses runs of whitespace, and
/// drops blank lines; the hash is the first 8 bytes of sha256 over the
/// joined window, so identical code blocks collide across files.
pub(crate) fn fingerprint_windows(content: &str) -> Vec<DuplicationFingerprint> {
    let mut normalized: Vec<(usize, String)> = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let squeezed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if !squeezed.is_empty() {
            normalized.push((idx + 1, squeezed));
        }
    }
    if normalized.len() < DUP_WINDOW {
        return Vec::new();
    }
    let mut fingerprints = Vec::with_capacity(normalized.len() - DUP_WINDOW + 1);
    for window in normalized.windows(DUP_WINDOW) {
        let mut hasher = Sha256::new();
        for (_, line) in window {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        let hash = u64::from_be_bytes(digest[..8].try_into().unwrap_or([0; 8]));
        fingerprints.push(DuplicationFingerprint {
            hash,
            start_line: window[0].0,
        });
    }
    fingerprints
}
