//! Ignore engine: ordered glob rules with gitignore-style negation.
//!
//! Rules come from four layers, applied in order: built-in defaults,
//! config globs, the per-project `.jupiterignore` file, per-request
//! globs. Later rules override earlier ones, so a trailing `!keep.log`
//! re-includes a path a previous `*.log` excluded. Malformed lines fail
//! open: they are skipped with a warning.

use std::path::Path;

use globset::{Glob, GlobMatcher};
use tracing::warn;

/// Name of the per-project ignore file.
pub const IGNORE_FILE: &str = ".jupiterignore";

/// Directories no scan ever descends into.
const BUILTIN_PATTERNS: &[&str] = &[
    ".git",
    ".jupiter",
    "node_modules",
    "__pycache__",
    "target",
    ".venv",
    "venv",
];

struct IgnoreRule {
    matchers: Vec<GlobMatcher>,
    negated: bool,
}

impl IgnoreRule {
    fn matches(&self, rel: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(rel))
    }
}

/// Compiled ignore rules for one scan.
pub struct IgnoreEngine {
    rules: Vec<IgnoreRule>,
    /// Human-readable notes for lines that failed to compile.
    pub warnings: Vec<String>,
}

impl IgnoreEngine {
    /// Build the engine for `root`, layering config and request globs
    /// around the project's `.jupiterignore`.
    pub fn new(root: &Path, config_globs: &[String], extra_globs: &[String]) -> Self {
        let mut patterns: Vec<String> = BUILTIN_PATTERNS.iter().map(|p| p.to_string()).collect();
        patterns.extend(config_globs.iter().cloned());
        patterns.extend(load_ignore_file(root));
        patterns.extend(extra_globs.iter().cloned());
        Self::from_patterns(&patterns)
    }

    /// Compile an ordered pattern list.
    pub fn from_patterns(patterns: &[String]) -> Self {
        let mut rules = Vec::new();
        let mut warnings = Vec::new();
        for raw in patterns {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (negated, body) = match trimmed.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, trimmed),
            };
            if body.is_empty() {
                continue;
            }
            match compile_pattern(body) {
                Some(matchers) => rules.push(IgnoreRule { matchers, negated }),
                None => {
                    warn!(pattern = %raw, "skipping malformed ignore pattern");
                    warnings.push(format!("malformed ignore pattern: {raw}"));
                }
            }
        }
        Self { rules, warnings }
    }

    /// Whether a project-relative path is excluded. Later rules win.
    pub fn should_ignore(&self, rel_path: &str) -> bool {
        let rel = rel_path.trim_start_matches("./").replace('\\', "/");
        let mut ignored = false;
        for rule in &self.rules {
            if rule.matches(&rel) {
                ignored = !rule.negated;
            }
        }
        ignored
    }
}

/// Expand one pattern body into matchers. Component patterns (no `/`)
/// match at any depth; every pattern also subsumes its subtree so a
/// directory rule prunes everything beneath it.
fn compile_pattern(body: &str) -> Option<Vec<GlobMatcher>> {
    let body = body.trim_end_matches('/');
    let variants: Vec<String> = if body.contains('/') {
        vec![body.to_string(), format!("{body}/**")]
    } else {
        vec![
            body.to_string(),
            format!("**/{body}"),
            format!("{body}/**"),
            format!("**/{body}/**"),
        ]
    };
    let mut matchers = Vec::with_capacity(variants.len());
    for variant in &variants {
        matchers.push(Glob::new(variant).ok()?.compile_matcher());
    }
    Some(matchers)
}

/// Load patterns from `.jupiterignore` in the root directory.
/// One pattern per line, `#` comments, `!` negation; empty lines skipped.
/// Returns an empty vec if the file doesn't exist.
pub fn load_ignore_file(root: &Path) -> Vec<String> {
    let path = root.join(IGNORE_FILE);
    let Ok(text) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
