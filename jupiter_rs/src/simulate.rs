//! Removal impact simulation over a [`DependencyGraph`].
//!
//! Read-only prediction: given a file or symbol target, enumerate the
//! edges that would break and classify the fallout. Symbol removal
//! considers direct callers only; file removal considers every import
//! and call edge whose endpoint lies in the file.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{JupiterError, Result};
use crate::graph::{DependencyGraph, EdgeKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactType {
    // Order encodes severity: greatest first when sorted descending.
    Orphaned,
    BrokenCall,
    BrokenImport,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskScore {
    Low,
    Medium,
    High,
}

/// One impacted node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImpactEntry {
    /// File path or symbol id.
    pub target: String,
    pub impact_type: ImpactType,
}

/// What to simulate removing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "target_type", rename_all = "snake_case")]
pub enum RemoveTarget {
    File { path: String },
    Symbol { path: String, function_name: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImpactReport {
    pub target: String,
    pub impacts: Vec<ImpactEntry>,
    pub risk_score: RiskScore,
}

/// Predict the impact of removing `target` from the graph.
pub fn simulate_remove(graph: &DependencyGraph, target: &RemoveTarget) -> Result<ImpactReport> {
    match target {
        RemoveTarget::File { path } => simulate_remove_file(graph, path),
        RemoveTarget::Symbol {
            path,
            function_name,
        } => simulate_remove_symbol(graph, path, function_name),
    }
}

fn simulate_remove_file(graph: &DependencyGraph, path: &str) -> Result<ImpactReport> {
    if !graph.nodes.iter().any(|n| n.id == path) {
        return Err(JupiterError::NotFound(format!("file {path} not in graph")));
    }

    // The removed set: the file node plus every symbol it contains.
    let mut removed: HashSet<&str> = HashSet::from([path]);
    for link in &graph.links {
        if link.kind == EdgeKind::Contains && link.source == path {
            removed.insert(link.target.as_str());
        }
    }

    let mut impacts: HashMap<String, ImpactType> = HashMap::new();
    for link in &graph.links {
        match link.kind {
            EdgeKind::Imports if removed.contains(link.target.as_str()) => {
                raise(&mut impacts, link.source.clone(), ImpactType::BrokenImport);
            }
            EdgeKind::Calls
                if removed.contains(link.target.as_str())
                    && !removed.contains(link.source.as_str()) =>
            {
                raise(
                    &mut impacts,
                    owning_file(&link.source),
                    ImpactType::BrokenCall,
                );
            }
            _ => {}
        }
    }

    // Orphans: nodes whose every incoming import/call edge originates in
    // the removed set.
    for entry in orphans_of(graph, &removed) {
        raise(&mut impacts, entry, ImpactType::Orphaned);
    }

    Ok(finish(path.to_string(), impacts))
}

/// Direct callers only; transitive fallout is left to file-level
/// simulation.
fn simulate_remove_symbol(
    graph: &DependencyGraph,
    path: &str,
    function_name: &str,
) -> Result<ImpactReport> {
    let symbol_id = format!("{path}::{function_name}");
    let symbol_id = if graph.nodes.iter().any(|n| n.id == symbol_id) {
        symbol_id
    } else {
        // Accept an already-qualified name.
        let qualified = graph
            .nodes
            .iter()
            .find(|n| n.id == function_name || n.id.ends_with(&format!("::{function_name}")))
            .map(|n| n.id.clone());
        qualified.ok_or_else(|| {
            JupiterError::NotFound(format!("symbol {function_name} in {path} not in graph"))
        })?
    };

    let removed: HashSet<&str> = HashSet::from([symbol_id.as_str()]);
    let mut impacts: HashMap<String, ImpactType> = HashMap::new();
    for link in &graph.links {
        if link.kind == EdgeKind::Calls
            && link.target == symbol_id
            && !removed.contains(link.source.as_str())
        {
            raise(
                &mut impacts,
                owning_file(&link.source),
                ImpactType::BrokenCall,
            );
        }
    }
    for entry in orphans_of_calls(graph, &removed) {
        raise(&mut impacts, entry, ImpactType::Orphaned);
    }

    Ok(finish(symbol_id, impacts))
}

/// Keep the most severe classification per impacted node.
fn raise(impacts: &mut HashMap<String, ImpactType>, target: String, impact: ImpactType) {
    impacts
        .entry(target)
        .and_modify(|existing| {
            if impact > *existing {
                *existing = impact;
            }
        })
        .or_insert(impact);
}

fn owning_file(node_id: &str) -> String {
    node_id.split("::").next().unwrap_or(node_id).to_string()
}

/// Nodes whose only incoming import/call edges come from `removed`.
fn orphans_of(graph: &DependencyGraph, removed: &HashSet<&str>) -> Vec<String> {
    let mut incoming: HashMap<&str, (usize, usize)> = HashMap::new(); // (from removed, total)
    for link in &graph.links {
        if !matches!(link.kind, EdgeKind::Imports | EdgeKind::Calls) {
            continue;
        }
        let entry = incoming.entry(link.target.as_str()).or_insert((0, 0));
        entry.1 += 1;
        if removed.contains(link.source.as_str()) {
            entry.0 += 1;
        }
    }
    collect_orphans(incoming, removed)
}

/// Same, restricted to call edges (symbol-target mode).
fn orphans_of_calls(graph: &DependencyGraph, removed: &HashSet<&str>) -> Vec<String> {
    let mut incoming: HashMap<&str, (usize, usize)> = HashMap::new();
    for link in &graph.links {
        if link.kind != EdgeKind::Calls {
            continue;
        }
        let entry = incoming.entry(link.target.as_str()).or_insert((0, 0));
        entry.1 += 1;
        if removed.contains(link.source.as_str()) {
            entry.0 += 1;
        }
    }
    collect_orphans(incoming, removed)
}

fn collect_orphans(
    incoming: HashMap<&str, (usize, usize)>,
    removed: &HashSet<&str>,
) -> Vec<String> {
    incoming
        .into_iter()
        .filter(|(node, (from_removed, total))| {
            *from_removed > 0 && from_removed == total && !removed.contains(node)
        })
        .map(|(node, _)| node.to_string())
        .collect()
}

fn finish(target: String, impacts: HashMap<String, ImpactType>) -> ImpactReport {
    let mut entries: Vec<ImpactEntry> = impacts
        .into_iter()
        .map(|(target, impact_type)| ImpactEntry {
            target,
            impact_type,
        })
        .collect();
    entries.sort_by(|a, b| {
        b.impact_type
            .cmp(&a.impact_type)
            .then(a.target.cmp(&b.target))
    });

    let risk_score = if entries
        .iter()
        .any(|e| e.impact_type == ImpactType::BrokenImport)
    {
        RiskScore::High
    } else if entries
        .iter()
        .any(|e| e.impact_type == ImpactType::BrokenCall)
    {
        RiskScore::Medium
    } else {
        RiskScore::Low
    };

    ImpactReport {
        target,
        impacts: entries,
        risk_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{build, GraphOptions};
    use crate::types::{
        CallSite, FileAnalysis, FileRecord, ImportRecord, ScanFingerprint, ScanReport, SymbolKind,
        SymbolRecord,
    };

    fn file(path: &str, analysis: FileAnalysis) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size_bytes: 1,
            modified_at: 1,
            language_tag: "python".to_string(),
            content_hash: None,
            scan_fingerprint: ScanFingerprint {
                size_bytes: 1,
                modified_at: 1,
            },
            skipped_large: false,
            analysis_error: None,
            analysis,
        }
    }

    fn sym(path: &str, name: &str) -> SymbolRecord {
        SymbolRecord {
            path: path.to_string(),
            name: name.to_string(),
            qualified_name: name.to_string(),
            kind: SymbolKind::Function,
            start_line: 1,
            doc_present: false,
            decorator_tags: Vec::new(),
            cyclomatic_complexity: 1,
            dynamically_registered: false,
        }
    }

    /// a.py imports b.py; b.py imports c.py.
    fn chain_graph() -> DependencyGraph {
        let mut a = FileAnalysis::new("a.py".to_string(), "python");
        a.imports.push(ImportRecord {
            module: "b".to_string(),
            line: 1,
            resolved_path: None,
        });
        let mut b = FileAnalysis::new("b.py".to_string(), "python");
        b.imports.push(ImportRecord {
            module: "c".to_string(),
            line: 1,
            resolved_path: None,
        });
        let c = FileAnalysis::new("c.py".to_string(), "python");

        let mut report = ScanReport::new("/p".to_string());
        report.files = vec![file("a.py", a), file("b.py", b), file("c.py", c)];
        build(&report, &GraphOptions::default())
    }

    #[test]
    fn removing_middle_file_breaks_importer_and_orphans_leaf() {
        let graph = chain_graph();
        let report = simulate_remove(
            &graph,
            &RemoveTarget::File {
                path: "b.py".to_string(),
            },
        )
        .expect("simulate");

        assert_eq!(report.risk_score, RiskScore::High);
        let broken: Vec<&str> = report
            .impacts
            .iter()
            .filter(|e| e.impact_type == ImpactType::BrokenImport)
            .map(|e| e.target.as_str())
            .collect();
        assert_eq!(broken, vec!["a.py"]);
        let orphaned: Vec<&str> = report
            .impacts
            .iter()
            .filter(|e| e.impact_type == ImpactType::Orphaned)
            .map(|e| e.target.as_str())
            .collect();
        assert_eq!(orphaned, vec!["c.py"]);
        // Severity desc: broken_import precedes orphaned.
        assert_eq!(report.impacts[0].impact_type, ImpactType::BrokenImport);
    }

    fn call_graph() -> DependencyGraph {
        // caller.py::use_helper calls helper.py::helper;
        // helper.py::helper calls helper.py::leaf (leaf has no other callers).
        let mut caller = FileAnalysis::new("caller.py".to_string(), "python");
        caller.symbols.push(sym("caller.py", "use_helper"));
        caller.imports.push(ImportRecord {
            module: "helper".to_string(),
            line: 1,
            resolved_path: None,
        });
        caller.call_sites.push(CallSite {
            caller: Some("caller.py::use_helper".to_string()),
            callee: "helper".to_string(),
            line: 2,
        });

        let mut helper = FileAnalysis::new("helper.py".to_string(), "python");
        helper.symbols.push(sym("helper.py", "helper"));
        helper.symbols.push(sym("helper.py", "leaf"));
        helper.call_sites.push(CallSite {
            caller: Some("helper.py::helper".to_string()),
            callee: "leaf".to_string(),
            line: 3,
        });

        let mut report = ScanReport::new("/p".to_string());
        report.files = vec![file("caller.py", caller), file("helper.py", helper)];
        build(&report, &GraphOptions::default())
    }

    #[test]
    fn symbol_removal_reports_direct_callers_only() {
        let graph = call_graph();
        let report = simulate_remove(
            &graph,
            &RemoveTarget::Symbol {
                path: "helper.py".to_string(),
                function_name: "helper".to_string(),
            },
        )
        .expect("simulate");

        assert_eq!(report.risk_score, RiskScore::Medium);
        let broken: Vec<&str> = report
            .impacts
            .iter()
            .filter(|e| e.impact_type == ImpactType::BrokenCall)
            .map(|e| e.target.as_str())
            .collect();
        assert_eq!(broken, vec!["caller.py"]);
        // leaf was only called by helper: orphaned.
        assert!(report
            .impacts
            .iter()
            .any(|e| e.target == "helper.py::leaf" && e.impact_type == ImpactType::Orphaned));
    }

    #[test]
    fn file_removal_covers_symbol_removal_impacts() {
        // Monotonicity: the file-level impact set contains everything the
        // symbol-level set reports (mapped to files).
        let graph = call_graph();
        let by_symbol = simulate_remove(
            &graph,
            &RemoveTarget::Symbol {
                path: "helper.py".to_string(),
                function_name: "helper".to_string(),
            },
        )
        .expect("symbol");
        let by_file = simulate_remove(
            &graph,
            &RemoveTarget::File {
                path: "helper.py".to_string(),
            },
        )
        .expect("file");

        let file_targets: std::collections::HashSet<&str> =
            by_file.impacts.iter().map(|e| e.target.as_str()).collect();
        for entry in &by_symbol.impacts {
            let expected = owning_file(&entry.target);
            // Impacts landing inside the removed file are subsumed by the
            // removal itself; everything external must survive.
            if expected == "helper.py" {
                continue;
            }
            assert!(
                file_targets.contains(expected.as_str())
                    || file_targets.contains(entry.target.as_str()),
                "file removal lost impact on {}",
                entry.target
            );
        }
    }

    #[test]
    fn unknown_target_is_not_found() {
        let graph = chain_graph();
        let err = simulate_remove(
            &graph,
            &RemoveTarget::File {
                path: "ghost.py".to_string(),
            },
        )
        .expect_err("missing");
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn isolated_file_removal_is_low_risk() {
        let graph = chain_graph();
        let report = simulate_remove(
            &graph,
            &RemoveTarget::File {
                path: "a.py".to_string(),
            },
        )
        .expect("simulate");
        assert_eq!(report.risk_score, RiskScore::Low);
    }
}
