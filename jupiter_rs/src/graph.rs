//! Dependency graph built from a [`ScanReport`].
//!
//! Nodes are files and symbols (plus external modules); edges are
//! `contains` (file -> symbol), `imports` (file -> file or external) and
//! `calls` (best-effort name resolution, unresolved edges kept). An
//! optional simplification collapses files by directory prefix, and a
//! `max_nodes` cap drops least-connected nodes last.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::types::{CallResolution, ScanReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Symbol,
    External,
    Directory,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Contains,
    Imports,
    Calls,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphLink {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<CallResolution>,
    /// Parallel edges merged during simplification sum their weights.
    #[serde(default = "default_weight")]
    pub weight: usize,
}

fn default_weight() -> usize {
    1
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
}

#[derive(Clone, Debug)]
pub struct GraphOptions {
    /// Collapse file nodes by directory prefix.
    pub simplify: bool,
    /// Directory depth used when simplifying.
    pub directory_depth: usize,
    /// Drop least-connected nodes beyond this count.
    pub max_nodes: Option<usize>,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            simplify: false,
            directory_depth: 1,
            max_nodes: None,
        }
    }
}

/// Build the graph for a report.
pub fn build(report: &ScanReport, options: &GraphOptions) -> DependencyGraph {
    let mut graph = DependencyGraph::default();
    let file_paths: HashSet<&str> = report.files.iter().map(|f| f.path.as_str()).collect();

    // Symbol name index per file, for call resolution.
    let mut symbols_by_file: HashMap<&str, HashMap<&str, String>> = HashMap::new();
    for file in &report.files {
        let index = symbols_by_file.entry(file.path.as_str()).or_default();
        for symbol in &file.analysis.symbols {
            index.entry(symbol.name.as_str()).or_insert_with(|| symbol.id());
        }
    }

    let mut externals: BTreeMap<String, String> = BTreeMap::new();
    // Imports resolved per file, reused for call scope.
    let mut imports_of: HashMap<&str, Vec<String>> = HashMap::new();

    for file in &report.files {
        graph.nodes.push(GraphNode {
            id: file.path.clone(),
            kind: NodeKind::File,
            label: basename(&file.path),
        });
        for symbol in &file.analysis.symbols {
            graph.nodes.push(GraphNode {
                id: symbol.id(),
                kind: NodeKind::Symbol,
                label: symbol.qualified_name.clone(),
            });
            graph.links.push(GraphLink {
                source: file.path.clone(),
                target: symbol.id(),
                kind: EdgeKind::Contains,
                resolution: None,
                weight: 1,
            });
        }

        for import in &file.analysis.imports {
            match resolve_import(&file.path, &import.module, &file_paths) {
                Some(target) => {
                    imports_of
                        .entry(file.path.as_str())
                        .or_default()
                        .push(target.clone());
                    graph.links.push(GraphLink {
                        source: file.path.clone(),
                        target,
                        kind: EdgeKind::Imports,
                        resolution: None,
                        weight: 1,
                    });
                }
                None => {
                    let ext_id = format!("ext:{}", import.module);
                    externals
                        .entry(ext_id.clone())
                        .or_insert_with(|| import.module.clone());
                    graph.links.push(GraphLink {
                        source: file.path.clone(),
                        target: ext_id,
                        kind: EdgeKind::Imports,
                        resolution: None,
                        weight: 1,
                    });
                }
            }
        }
    }

    // Calls: same file first, then files imported by the caller's file.
    let mut unresolved: BTreeMap<String, String> = BTreeMap::new();
    for file in &report.files {
        let local = symbols_by_file.get(file.path.as_str());
        let imported = imports_of.get(file.path.as_str());
        for call in &file.analysis.call_sites {
            let source = call.caller.clone().unwrap_or_else(|| file.path.clone());
            let target = local
                .and_then(|index| index.get(call.callee.as_str()).cloned())
                .or_else(|| {
                    imported.into_iter().flatten().find_map(|imp| {
                        symbols_by_file
                            .get(imp.as_str())
                            .and_then(|index| index.get(call.callee.as_str()).cloned())
                    })
                });
            match target {
                Some(target) => graph.links.push(GraphLink {
                    source,
                    target,
                    kind: EdgeKind::Calls,
                    resolution: Some(CallResolution::Resolved),
                    weight: 1,
                }),
                None => {
                    let id = format!("unresolved:{}", call.callee);
                    unresolved.entry(id.clone()).or_insert_with(|| call.callee.clone());
                    graph.links.push(GraphLink {
                        source,
                        target: id,
                        kind: EdgeKind::Calls,
                        resolution: Some(CallResolution::Unresolved),
                        weight: 1,
                    });
                }
            }
        }
    }

    for (id, label) in externals {
        graph.nodes.push(GraphNode {
            id,
            kind: NodeKind::External,
            label,
        });
    }
    for (id, label) in unresolved {
        graph.nodes.push(GraphNode {
            id,
            kind: NodeKind::External,
            label,
        });
    }

    if options.simplify {
        graph = simplify(graph, options.directory_depth);
    }
    if let Some(max_nodes) = options.max_nodes {
        graph = cap_nodes(graph, max_nodes);
    }
    graph
}

/// Resolve an import module string to a file in the report.
/// Pure function of the report's path set, so graphs stay reproducible.
fn resolve_import(from: &str, module: &str, files: &HashSet<&str>) -> Option<String> {
    let dir = parent_dir(from);
    let mut candidates: Vec<String> = Vec::new();

    if module.starts_with("./") || module.starts_with("../") {
        // JS relative specifier.
        let joined = normalize_join(&dir, module);
        for ext in ["", ".js", ".jsx", ".ts", ".tsx", ".mjs"] {
            candidates.push(format!("{joined}{ext}"));
        }
        for index in ["index.js", "index.ts", "index.tsx"] {
            candidates.push(format!("{joined}/{index}"));
        }
    } else if module.starts_with('.') {
        // Python relative: one leading dot is the current package, each
        // further dot walks one level up.
        let dots = module.chars().take_while(|c| *c == '.').count();
        let rest = &module[dots..];
        let mut base = dir;
        for _ in 1..dots {
            base = parent_dir(&base);
        }
        push_python_candidates(&mut candidates, &base, rest);
    } else {
        // Absolute python module path within the project.
        push_python_candidates(&mut candidates, "", module);
    }

    candidates
        .into_iter()
        .map(|c| c.trim_start_matches('/').to_string())
        .find(|c| files.contains(c.as_str()))
}

fn push_python_candidates(candidates: &mut Vec<String>, base: &str, module: &str) {
    let module_path = module.replace('.', "/");
    let prefix = if base.is_empty() {
        String::new()
    } else {
        format!("{base}/")
    };
    if module_path.is_empty() {
        candidates.push(format!("{prefix}__init__.py"));
    } else {
        candidates.push(format!("{prefix}{module_path}.py"));
        candidates.push(format!("{prefix}{module_path}/__init__.py"));
    }
}

fn parent_dir(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    }
}

fn normalize_join(dir: &str, spec: &str) -> String {
    let mut parts: Vec<&str> = if dir.is_empty() {
        Vec::new()
    } else {
        dir.split('/').collect()
    };
    for piece in spec.split('/') {
        match piece {
            "." | "" => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Directory prefix at depth `k` for a file path.
fn dir_prefix(path: &str, depth: usize) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 1 {
        return ".".to_string();
    }
    let take = depth.max(1).min(parts.len() - 1);
    parts[..take].join("/")
}

/// Collapse file/symbol nodes into directory nodes, summing merged edge
/// weights. Self-loops produced by the collapse are dropped.
fn simplify(graph: DependencyGraph, depth: usize) -> DependencyGraph {
    let mut mapping: HashMap<String, String> = HashMap::new();
    let mut dirs: BTreeMap<String, ()> = BTreeMap::new();
    for node in &graph.nodes {
        match node.kind {
            NodeKind::File => {
                let dir = dir_prefix(&node.id, depth);
                dirs.insert(dir.clone(), ());
                mapping.insert(node.id.clone(), dir);
            }
            NodeKind::Symbol => {
                let file = node.id.split("::").next().unwrap_or(&node.id);
                let dir = dir_prefix(file, depth);
                dirs.insert(dir.clone(), ());
                mapping.insert(node.id.clone(), dir);
            }
            NodeKind::External | NodeKind::Directory => {
                mapping.insert(node.id.clone(), node.id.clone());
            }
        }
    }

    let mut merged: BTreeMap<(String, String, EdgeKind), GraphLink> = BTreeMap::new();
    for link in graph.links {
        let source = mapping.get(&link.source).cloned().unwrap_or(link.source);
        let target = mapping.get(&link.target).cloned().unwrap_or(link.target);
        if source == target {
            continue;
        }
        let key = (source.clone(), target.clone(), link.kind);
        merged
            .entry(key)
            .and_modify(|existing| existing.weight += link.weight)
            .or_insert(GraphLink {
                source,
                target,
                kind: link.kind,
                resolution: link.resolution,
                weight: link.weight,
            });
    }

    let mut nodes: Vec<GraphNode> = dirs
        .keys()
        .map(|dir| GraphNode {
            id: dir.clone(),
            kind: NodeKind::Directory,
            label: dir.clone(),
        })
        .collect();
    nodes.extend(
        graph
            .nodes
            .into_iter()
            .filter(|n| matches!(n.kind, NodeKind::External)),
    );

    DependencyGraph {
        nodes,
        links: merged.into_values().collect(),
    }
}

/// Iteratively drop nodes with the smallest `degree_in + degree_out`;
/// ties break by id descending.
fn cap_nodes(mut graph: DependencyGraph, max_nodes: usize) -> DependencyGraph {
    while graph.nodes.len() > max_nodes {
        let mut degrees: HashMap<&str, usize> =
            graph.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        for link in &graph.links {
            if let Some(d) = degrees.get_mut(link.source.as_str()) {
                *d += 1;
            }
            if let Some(d) = degrees.get_mut(link.target.as_str()) {
                *d += 1;
            }
        }
        let victim = graph
            .nodes
            .iter()
            .map(|n| (degrees.get(n.id.as_str()).copied().unwrap_or(0), &n.id))
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(a.1)))
            .map(|(_, id)| id.clone());
        let Some(victim) = victim else { break };
        graph.nodes.retain(|n| n.id != victim);
        graph
            .links
            .retain(|l| l.source != victim && l.target != victim);
    }
    graph
}
