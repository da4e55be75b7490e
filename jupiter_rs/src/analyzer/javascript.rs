//! Heuristic analyzer for JS/TS sources.
//!
//! Regex-driven extraction of function and class declarations, import
//! statements and exported names, with approximate complexity from
//! control-flow tokens. Deliberately shallower than the Python analyzer:
//! the contract only asks for declaration-level structure here.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use super::{fingerprint_windows, LanguageAnalyzer};
use crate::error::Result;
use crate::types::{CallSite, FileAnalysis, ImportRecord, SymbolKind, SymbolRecord};

pub struct JsAnalyzer {
    /// "javascript" or "typescript".
    pub tag: &'static str,
}

static RE_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)")
        .expect("function regex")
});

static RE_ARROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*=>",
    )
    .expect("arrow regex")
});

static RE_CLASS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)")
        .expect("class regex")
});

static RE_IMPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"import\s+(?:[^'"]+\s+from\s+)?['"]([^'"]+)['"]"#).expect("import regex"));

static RE_REQUIRE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).expect("require regex"));

static RE_EXPORT_BRACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*export\s*\{([^}]*)\}").expect("export brace regex"));

static KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "if", "else", "for", "while", "switch", "case", "catch", "function", "return", "new",
        "typeof", "instanceof", "in", "of", "do", "try", "finally", "throw", "await", "async",
        "yield", "delete", "void", "import", "export", "super", "constructor",
    ])
});

const BRANCH_WORDS: &[&str] = &["if", "for", "while", "case", "catch"];

impl LanguageAnalyzer for JsAnalyzer {
    fn language_tag(&self) -> &'static str {
        self.tag
    }

    fn analyze(&self, rel_path: &str, content: &str) -> Result<FileAnalysis> {
        let mut analysis = FileAnalysis::new(rel_path.to_string(), self.tag);
        analysis.loc = content.lines().count();

        let mut in_block_comment = false;
        let mut prev_ended_jsdoc = false;
        let mut pending_decorators: Vec<String> = Vec::new();
        // Control-flow tokens accrue to the most recently declared symbol.
        let mut current_symbol: Option<usize> = None;

        for (idx, raw) in content.lines().enumerate() {
            let line_num = idx + 1;
            let mut line = raw.to_string();
            let mut saw_block_close = false;

            if in_block_comment {
                match line.find("*/") {
                    Some(end) => {
                        in_block_comment = false;
                        saw_block_close = true;
                        line = line[end + 2..].to_string();
                    }
                    None => continue,
                }
            }
            if let Some(start) = line.find("/*") {
                match line[start..].find("*/") {
                    Some(end) => {
                        let after = line[start + end + 2..].to_string();
                        line = format!("{}{}", &line[..start], after);
                        saw_block_close = true;
                    }
                    None => {
                        line = line[..start].to_string();
                        in_block_comment = true;
                    }
                }
            }
            if let Some(pos) = find_line_comment(&line) {
                line = line[..pos].to_string();
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                if saw_block_close {
                    prev_ended_jsdoc = true;
                }
                continue;
            }

            if trimmed.starts_with('@') {
                if let Some(tag) = decorator_tag(trimmed) {
                    pending_decorators.push(tag);
                }
                prev_ended_jsdoc = false;
                continue;
            }

            for caps in RE_IMPORT.captures_iter(&line) {
                analysis.imports.push(ImportRecord {
                    module: caps[1].to_string(),
                    line: line_num,
                    resolved_path: None,
                });
            }
            for caps in RE_REQUIRE.captures_iter(&line) {
                analysis.imports.push(ImportRecord {
                    module: caps[1].to_string(),
                    line: line_num,
                    resolved_path: None,
                });
            }

            if let Some(caps) = RE_EXPORT_BRACE.captures(&line) {
                for piece in caps[1].split(',') {
                    let exported = piece
                        .rsplit(" as ")
                        .next()
                        .unwrap_or("")
                        .trim()
                        .to_string();
                    if !exported.is_empty() {
                        analysis.exports.push(exported);
                    }
                }
            }

            let declared = RE_FUNCTION
                .captures(&line)
                .map(|c| (c[1].to_string(), SymbolKind::Function))
                .or_else(|| {
                    RE_ARROW
                        .captures(&line)
                        .map(|c| (c[1].to_string(), SymbolKind::Function))
                })
                .or_else(|| {
                    RE_CLASS
                        .captures(&line)
                        .map(|c| (c[1].to_string(), SymbolKind::Class))
                });
            let declared_none = declared.is_none();
            if let Some((name, kind)) = declared {
                let mut tags = std::mem::take(&mut pending_decorators);
                tags.sort();
                analysis.symbols.push(SymbolRecord {
                    path: rel_path.to_string(),
                    name: name.clone(),
                    qualified_name: name.clone(),
                    kind,
                    start_line: line_num,
                    doc_present: prev_ended_jsdoc,
                    decorator_tags: tags,
                    cyclomatic_complexity: 1,
                    dynamically_registered: false,
                });
                current_symbol = Some(analysis.symbols.len() - 1);
                if trimmed.starts_with("export ") {
                    analysis.exports.push(name);
                }
            } else if let Some(sym_idx) = current_symbol {
                analysis.symbols[sym_idx].cyclomatic_complexity += count_branch_tokens(&line);
            }

            // Declaration syntax reads like a call (`function gate(`), so
            // only non-declaration lines feed call evidence.
            if declared_none {
                scan_calls(&line, line_num, current_symbol, &mut analysis);
            }
            prev_ended_jsdoc = false;
        }

        analysis.duplication_fingerprints = fingerprint_windows(content);
        Ok(analysis)
    }
}

/// Position of a `//` comment, ignoring `://` so URLs survive.
fn find_line_comment(line: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'/' && bytes[i + 1] == b'/' && (i == 0 || bytes[i - 1] != b':') {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn decorator_tag(line: &str) -> Option<String> {
    let rest = line.strip_prefix('@')?;
    let tag: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .collect();
    if tag.is_empty() {
        None
    } else {
        Some(tag)
    }
}

fn count_branch_tokens(line: &str) -> u32 {
    let mut count = 0u32;
    for word in line.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$')) {
        if BRANCH_WORDS.contains(&word) {
            count += 1;
        }
    }
    count += line.matches("&&").count() as u32;
    count += line.matches("||").count() as u32;
    count
}

fn scan_calls(line: &str, line_num: usize, current_symbol: Option<usize>, analysis: &mut FileAnalysis) {
    let caller = current_symbol.map(|sym_idx| analysis.symbols[sym_idx].id());
    let bytes = line.as_bytes();
    let len = bytes.len();
    let mut i = 0;
    while i < len {
        let c = bytes[i];
        if c.is_ascii_alphabetic() || c == b'_' || c == b'$' {
            let start = i;
            while i < len
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
            {
                i += 1;
            }
            let ident = &line[start..i];
            let mut j = i;
            while j < len && (bytes[j] == b' ' || bytes[j] == b'\t') {
                j += 1;
            }
            if j < len && bytes[j] == b'(' && !KEYWORDS.contains(ident) {
                analysis.call_sites.push(CallSite {
                    caller: caller.clone(),
                    callee: ident.to_string(),
                    line: line_num,
                });
            }
        } else if c == b'"' || c == b'\'' || c == b'`' {
            let quote = c;
            i += 1;
            while i < len && bytes[i] != quote {
                if bytes[i] == b'\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
            continue;
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(content: &str) -> FileAnalysis {
        JsAnalyzer { tag: "typescript" }
            .analyze("src/app.ts", content)
            .expect("analyze")
    }

    #[test]
    fn extracts_declarations_and_exports() {
        let analysis = analyze(
            r#"
import { useState } from "react";
import "./side.css";
const helper = require("./helper");

export function fetchUsers(url) {
  if (url && cache) {
    return cache.get(url);
  }
  return fetch(url);
}

export const formatName = (user) => user.name;

export class UserStore {}

export { internalA, internalB as aliasB };
"#,
        );
        let names: Vec<&str> = analysis.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["fetchUsers", "formatName", "UserStore"]);
        assert_eq!(
            analysis.symbols[0].kind,
            SymbolKind::Function
        );
        assert_eq!(analysis.symbols[2].kind, SymbolKind::Class);

        let modules: Vec<&str> = analysis.imports.iter().map(|i| i.module.as_str()).collect();
        assert_eq!(modules, vec!["react", "./side.css", "./helper"]);

        assert!(analysis.exports.contains(&"fetchUsers".to_string()));
        assert!(analysis.exports.contains(&"aliasB".to_string()));
        assert!(analysis.exports.contains(&"internalA".to_string()));
    }

    #[test]
    fn complexity_counts_control_flow_tokens() {
        let analysis = analyze(
            r#"
function gate(a, b) {
  if (a && b) {
    for (const x of a) {
      while (x) { break; }
    }
  }
}
"#,
        );
        // 1 + if + && + for + while
        assert_eq!(analysis.symbols[0].cyclomatic_complexity, 5);
    }

    #[test]
    fn jsdoc_marks_doc_present() {
        let analysis = analyze("/** Loads users. */\nfunction load() {}\nfunction bare() {}\n");
        assert!(analysis.symbols[0].doc_present);
        assert!(!analysis.symbols[1].doc_present);
    }

    #[test]
    fn comments_and_urls_are_handled() {
        let analysis = analyze(
            "// function ghost() {}\nconst base = \"https://api.example.com\"; // trailing\nfunction real() {}\n",
        );
        let names: Vec<&str> = analysis.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["real"]);
    }

    #[test]
    fn calls_are_recorded_with_enclosing_symbol() {
        let analysis = analyze("function run() {\n  helper();\n}\n");
        let call = analysis
            .call_sites
            .iter()
            .find(|c| c.callee == "helper")
            .expect("call");
        assert_eq!(call.caller.as_deref(), Some("src/app.ts::run"));
    }

    #[test]
    fn ts_decorators_become_tags() {
        let analysis = analyze("@Component\nexport class Panel {}\n");
        assert_eq!(analysis.symbols[0].decorator_tags, vec!["Component".to_string()]);
    }
}
