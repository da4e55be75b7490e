//! Primary analyzer for Python sources.
//!
//! Line-structured parsing: tracks indentation scopes for class/method
//! attribution, docstring state, pending decorators, and per-symbol
//! cyclomatic complexity (each branching construct and each
//! short-circuit operator contributes one). Dynamic registration is
//! detected by recognizing the fixed table of method calls with literal
//! symbol arguments.

use std::collections::HashSet;

use once_cell::sync::Lazy;

use super::tables::is_dynamic_registration_method;
use super::{fingerprint_windows, LanguageAnalyzer};
use crate::error::Result;
use crate::types::{CallSite, FileAnalysis, ImportRecord, SymbolKind, SymbolRecord};

pub struct PythonAnalyzer;

static KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "if", "elif", "else", "while", "for", "return", "yield", "with", "assert", "lambda",
        "not", "and", "or", "in", "is", "del", "raise", "pass", "break", "continue", "import",
        "from", "as", "def", "class", "try", "except", "finally", "global", "nonlocal", "await",
        "async", "match", "case", "True", "False", "None",
    ])
});

const BRANCH_TOKENS: &[&str] = &["if", "elif", "for", "while", "except", "case", "and", "or"];

enum ScopeKind {
    Class(String),
    Def(usize),
}

struct Scope {
    indent: usize,
    kind: ScopeKind,
}

impl LanguageAnalyzer for PythonAnalyzer {
    fn language_tag(&self) -> &'static str {
        "python"
    }

    fn analyze(&self, rel_path: &str, content: &str) -> Result<FileAnalysis> {
        let mut analysis = FileAnalysis::new(rel_path.to_string(), "python");
        analysis.loc = content.lines().count();

        let mut scopes: Vec<Scope> = Vec::new();
        let mut pending_decorators: Vec<String> = Vec::new();
        let mut awaiting_doc: Option<usize> = None;
        let mut in_docstring: Option<&'static str> = None;
        let mut dynamic_names: HashSet<String> = HashSet::new();

        for (idx, raw) in content.lines().enumerate() {
            let line_num = idx + 1;

            if let Some(delim) = in_docstring {
                if raw.contains(delim) {
                    in_docstring = None;
                }
                continue;
            }

            // Comment stripping follows the same line-level heuristic as
            // the rest of the parser: '#' inside string literals is rare
            // enough not to matter for the extracted shape.
            let code = raw.split('#').next().unwrap_or("");
            let trimmed = code.trim();
            if trimmed.is_empty() {
                continue;
            }
            let indent = code.chars().take_while(|c| c.is_whitespace()).count();

            // Docstring opening: satisfies a pending doc slot.
            if let Some(delim) = docstring_delim(trimmed) {
                if let Some(sym) = awaiting_doc.take() {
                    analysis.symbols[sym].doc_present = true;
                }
                if trimmed.matches(delim).count() < 2 {
                    in_docstring = Some(delim);
                }
                continue;
            }

            // A scope ends when a code line returns to (or above) the
            // indent of the scope header.
            while scopes.last().is_some_and(|s| indent <= s.indent) {
                scopes.pop();
            }

            if trimmed.starts_with('@') {
                if let Some(tag) = decorator_tag(trimmed) {
                    pending_decorators.push(tag);
                }
                continue;
            }

            let def_rest = trimmed
                .strip_prefix("def ")
                .or_else(|| trimmed.strip_prefix("async def "));
            if let Some(rest) = def_rest {
                awaiting_doc = None;
                let Some(name) = leading_ident(rest) else {
                    pending_decorators.clear();
                    continue;
                };
                let enclosing_class = scopes.iter().rev().find_map(|s| match &s.kind {
                    ScopeKind::Class(class_name) => Some(class_name.clone()),
                    ScopeKind::Def(_) => None,
                });
                let (kind, qualified) = match enclosing_class {
                    Some(class_name) => (SymbolKind::Method, format!("{class_name}.{name}")),
                    None => (SymbolKind::Function, name.clone()),
                };
                let mut tags = std::mem::take(&mut pending_decorators);
                tags.sort();
                analysis.symbols.push(SymbolRecord {
                    path: rel_path.to_string(),
                    name,
                    qualified_name: qualified,
                    kind,
                    start_line: line_num,
                    doc_present: false,
                    decorator_tags: tags,
                    cyclomatic_complexity: 1,
                    dynamically_registered: false,
                });
                let sym_idx = analysis.symbols.len() - 1;
                scopes.push(Scope {
                    indent,
                    kind: ScopeKind::Def(sym_idx),
                });
                awaiting_doc = Some(sym_idx);
                // One-line bodies (`def f(): return x if c else y`).
                if let Some(body) = one_line_body(rest) {
                    awaiting_doc = None;
                    analysis.symbols[sym_idx].cyclomatic_complexity += count_branch_tokens(body);
                    scan_calls(
                        body,
                        line_num,
                        Some(sym_idx),
                        &mut analysis,
                        &mut dynamic_names,
                    );
                }
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("class ") {
                awaiting_doc = None;
                let Some(name) = leading_ident(rest) else {
                    pending_decorators.clear();
                    continue;
                };
                let enclosing_class = scopes.iter().rev().find_map(|s| match &s.kind {
                    ScopeKind::Class(class_name) => Some(class_name.clone()),
                    ScopeKind::Def(_) => None,
                });
                let qualified = match enclosing_class {
                    Some(outer) => format!("{outer}.{name}"),
                    None => name.clone(),
                };
                let mut tags = std::mem::take(&mut pending_decorators);
                tags.sort();
                analysis.symbols.push(SymbolRecord {
                    path: rel_path.to_string(),
                    name,
                    qualified_name: qualified.clone(),
                    kind: SymbolKind::Class,
                    start_line: line_num,
                    doc_present: false,
                    decorator_tags: tags,
                    cyclomatic_complexity: 1,
                    dynamically_registered: false,
                });
                let sym_idx = analysis.symbols.len() - 1;
                scopes.push(Scope {
                    indent,
                    kind: ScopeKind::Class(qualified),
                });
                awaiting_doc = Some(sym_idx);
                continue;
            }

            // Any other code line clears a pending docstring slot.
            awaiting_doc = None;
            pending_decorators.clear();

            if let Some(rest) = trimmed.strip_prefix("import ") {
                for part in rest.split(',') {
                    let module = part.split(" as ").next().unwrap_or("").trim();
                    if !module.is_empty() {
                        analysis.imports.push(ImportRecord {
                            module: module.to_string(),
                            line: line_num,
                            resolved_path: None,
                        });
                    }
                }
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix("from ") {
                if let Some((module, _names)) = rest.split_once(" import ") {
                    let module = module.trim();
                    if !module.is_empty() {
                        analysis.imports.push(ImportRecord {
                            module: module.to_string(),
                            line: line_num,
                            resolved_path: None,
                        });
                    }
                }
                continue;
            }

            // Complexity accrues to the innermost enclosing def.
            let enclosing_def = scopes.iter().rev().find_map(|s| match s.kind {
                ScopeKind::Def(sym_idx) => Some(sym_idx),
                ScopeKind::Class(_) => None,
            });
            if let Some(sym_idx) = enclosing_def {
                analysis.symbols[sym_idx].cyclomatic_complexity += count_branch_tokens(trimmed);
            }
            scan_calls(
                trimmed,
                line_num,
                enclosing_def,
                &mut analysis,
                &mut dynamic_names,
            );
        }

        for symbol in &mut analysis.symbols {
            if dynamic_names.contains(&symbol.name) {
                symbol.dynamically_registered = true;
            }
        }
        analysis.duplication_fingerprints = fingerprint_windows(content);
        Ok(analysis)
    }
}

fn docstring_delim(trimmed: &str) -> Option<&'static str> {
    if trimmed.starts_with("\"\"\"") || trimmed.starts_with("r\"\"\"") {
        Some("\"\"\"")
    } else if trimmed.starts_with("'''") || trimmed.starts_with("r'''") {
        Some("'''")
    } else {
        None
    }
}

/// Dotted decorator rendering: `@router.get("/x")` -> `router.get`.
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

fn leading_ident(rest: &str) -> Option<String> {
    let name: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() || name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        None
    } else {
        Some(name)
    }
}

/// Body of a one-line def: everything after the closing `):`.
fn one_line_body(def_rest: &str) -> Option<&str> {
    let colon = find_header_colon(def_rest)?;
    let body = def_rest[colon + 1..].trim();
    if body.is_empty() {
        None
    } else {
        Some(body)
    }
}

fn find_header_colon(rest: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in rest.char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn count_branch_tokens(code: &str) -> u32 {
    let mut count = 0u32;
    for word in code.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
        if BRANCH_TOKENS.contains(&word) {
            count += 1;
        }
    }
    count
}

/// Record `ident(` occurrences as call sites and feed the
/// dynamic-registration table.
fn scan_calls(
    code: &str,
    line_num: usize,
    enclosing_def: Option<usize>,
    analysis: &mut FileAnalysis,
    dynamic_names: &mut HashSet<String>,
) {
    let caller = enclosing_def.map(|sym_idx| analysis.symbols[sym_idx].id());
    let bytes = code.as_bytes();
    let len = bytes.len();
    let mut i = 0;
    while i < len {
        let c = bytes[i];
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let ident = &code[start..i];
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
                if is_dynamic_registration_method(ident) {
                    collect_literal_args(&code[j + 1..], dynamic_names);
                }
            }
        } else if c == b'"' || c == b'\'' {
            // Skip string literals so quoted text never reads as calls.
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

/// Identifiers and quoted names inside a registration argument list.
fn collect_literal_args(args: &str, dynamic_names: &mut HashSet<String>) {
    let end = find_matching_paren(args).unwrap_or(args.len());
    let args = &args[..end];
    let bytes = args.as_bytes();
    let len = bytes.len();
    let mut i = 0;
    while i < len {
        let c = bytes[i];
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let ident = &args[start..i];
            if !KEYWORDS.contains(ident) {
                dynamic_names.insert(ident.to_string());
            }
        } else if c == b'"' || c == b'\'' {
            let quote = c;
            let start = i + 1;
            i += 1;
            while i < len && bytes[i] != quote {
                i += 1;
            }
            let literal = &args[start..i.min(len)];
            if !literal.is_empty()
                && literal
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
            {
                dynamic_names.insert(literal.to_string());
            }
            i += 1;
        } else {
            i += 1;
        }
    }
}

fn find_matching_paren(rest: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in rest.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(content: &str) -> FileAnalysis {
        PythonAnalyzer
            .analyze("pkg/mod.py", content)
            .expect("analyze")
    }

    fn symbol<'a>(analysis: &'a FileAnalysis, name: &str) -> &'a SymbolRecord {
        analysis
            .symbols
            .iter()
            .find(|s| s.name == name)
            .unwrap_or_else(|| panic!("symbol {name} not found"))
    }

    #[test]
    fn extracts_functions_methods_and_classes() {
        let analysis = analyze(
            r#"
class UserView:
    def get_user(self):
        return self.user

    def _load(self):
        pass

def helper():
    pass
"#,
        );
        assert_eq!(symbol(&analysis, "UserView").kind, SymbolKind::Class);
        let method = symbol(&analysis, "get_user");
        assert_eq!(method.kind, SymbolKind::Method);
        assert_eq!(method.qualified_name, "UserView.get_user");
        assert_eq!(method.id(), "pkg/mod.py::UserView.get_user");
        assert_eq!(symbol(&analysis, "helper").kind, SymbolKind::Function);
    }

    #[test]
    fn decorator_tags_render_dotted() {
        let analysis = analyze("@router.get(\"/x\")\ndef get_h():\n    pass\n");
        let sym = symbol(&analysis, "get_h");
        assert_eq!(sym.decorator_tags, vec!["router.get".to_string()]);
    }

    #[test]
    fn docstring_presence_is_detected() {
        let analysis = analyze(
            r#"
def documented():
    """Does a thing."""
    return 1

def bare():
    return 2
"#,
        );
        assert!(symbol(&analysis, "documented").doc_present);
        assert!(!symbol(&analysis, "bare").doc_present);
    }

    #[test]
    fn complexity_counts_branches_and_short_circuits() {
        let analysis = analyze(
            r#"
def f(a, b):
    if a and b:
        return 1
    for i in items:
        while i:
            i -= 1
    return 0
"#,
        );
        // 1 + if + and + for + while
        assert_eq!(symbol(&analysis, "f").cyclomatic_complexity, 5);
    }

    #[test]
    fn imports_are_module_strings() {
        let analysis = analyze("import os, sys\nimport a.b as ab\nfrom pkg.util import helper\nfrom . import local\n");
        let modules: Vec<&str> = analysis.imports.iter().map(|i| i.module.as_str()).collect();
        assert_eq!(modules, vec!["os", "sys", "a.b", "pkg.util", "."]);
    }

    #[test]
    fn call_sites_carry_enclosing_symbol() {
        let analysis = analyze(
            r#"
def outer():
    helper()
    obj.method()

top_level()
"#,
        );
        let outer_id = "pkg/mod.py::outer".to_string();
        let helper_call = analysis
            .call_sites
            .iter()
            .find(|c| c.callee == "helper")
            .expect("helper call");
        assert_eq!(helper_call.caller.as_ref(), Some(&outer_id));
        let method_call = analysis
            .call_sites
            .iter()
            .find(|c| c.callee == "method")
            .expect("method call");
        assert_eq!(method_call.caller.as_ref(), Some(&outer_id));
        let top = analysis
            .call_sites
            .iter()
            .find(|c| c.callee == "top_level")
            .expect("top-level call");
        assert!(top.caller.is_none());
    }

    #[test]
    fn dynamic_registration_marks_symbols() {
        let analysis = analyze(
            r#"
def handle_run(args):
    pass

def unrelated():
    pass

parser.set_defaults(func=handle_run)
"#,
        );
        assert!(symbol(&analysis, "handle_run").dynamically_registered);
        assert!(!symbol(&analysis, "unrelated").dynamically_registered);
    }

    #[test]
    fn dynamic_registration_accepts_quoted_names() {
        let analysis = analyze(
            r#"
def on_scan(report):
    pass

bus.subscribe("on_scan")
"#,
        );
        assert!(symbol(&analysis, "on_scan").dynamically_registered);
    }

    #[test]
    fn strings_do_not_produce_call_sites() {
        let analysis = analyze("def f():\n    x = \"call_me()\"\n    return x\n");
        assert!(!analysis.call_sites.iter().any(|c| c.callee == "call_me"));
    }

    #[test]
    fn identical_bytes_produce_identical_analysis() {
        let src = "@app.route(\"/\")\ndef index():\n    \"\"\"Home.\"\"\"\n    if flag and other:\n        render()\n";
        let a = analyze(src);
        let b = analyze(src);
        assert_eq!(
            serde_json::to_string(&a).expect("a"),
            serde_json::to_string(&b).expect("b")
        );
    }
}
