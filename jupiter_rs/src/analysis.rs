//! Aggregation of a [`ScanReport`] into an [`AnalysisSummary`].
//!
//! Covers counts and size totals, top-N largest files, complexity
//! hotspots, duplication clusters, and the usage-confidence ruleset.
//! Every list is deterministically ordered: metric descending, then path
//! ascending, then symbol name ascending.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::analyzer::tables;
use crate::config::CiConfig;
use crate::types::{LanguageSummary, ScanReport, SymbolKind};

/// Usage classification for one symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Used,
    LikelyUsed,
    PossiblyUnused,
    Unused,
}

impl UsageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageStatus::Used => "used",
            UsageStatus::LikelyUsed => "likely_used",
            UsageStatus::PossiblyUnused => "possibly_unused",
            UsageStatus::Unused => "unused",
        }
    }
}

/// One row of `function_usage_details`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageInfo {
    pub symbol_id: String,
    pub path: String,
    pub name: String,
    pub status: UsageStatus,
    /// In [0,1]; fixed by the confidence ruleset.
    pub confidence: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileSizeEntry {
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComplexityHotspot {
    pub symbol_id: String,
    pub path: String,
    pub name: String,
    pub complexity: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DuplicationOccurrence {
    pub path: String,
    pub start_line: usize,
}

/// Windows sharing one rolling hash across the project.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DuplicationCluster {
    pub hash: u64,
    pub occurrences: Vec<DuplicationOccurrence>,
}

impl DuplicationCluster {
    pub fn size(&self) -> usize {
        self.occurrences.len()
    }
}

/// Aggregate view over one report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub project_root: String,
    pub file_count: usize,
    pub symbol_count: usize,
    pub total_bytes: u64,
    pub language_summary: BTreeMap<String, LanguageSummary>,
    pub largest_files: Vec<FileSizeEntry>,
    pub complexity_hotspots: Vec<ComplexityHotspot>,
    pub duplication_clusters: Vec<DuplicationCluster>,
    pub function_usage_details: Vec<UsageInfo>,
    /// Histogram keyed by status string.
    pub usage_summary: BTreeMap<String, usize>,
}

/// Aggregate a report. `top_n` bounds the largest-files and hotspot
/// lists; usage details always cover every function and method.
pub fn analyze(report: &ScanReport, top_n: usize) -> AnalysisSummary {
    let mut largest: Vec<FileSizeEntry> = report
        .files
        .iter()
        .map(|f| FileSizeEntry {
            path: f.path.clone(),
            size_bytes: f.size_bytes,
        })
        .collect();
    largest.sort_by(|a, b| b.size_bytes.cmp(&a.size_bytes).then(a.path.cmp(&b.path)));
    largest.truncate(top_n);

    let mut hotspots: Vec<ComplexityHotspot> = report
        .files
        .iter()
        .flat_map(|f| f.analysis.symbols.iter())
        .map(|s| ComplexityHotspot {
            symbol_id: s.id(),
            path: s.path.clone(),
            name: s.qualified_name.clone(),
            complexity: s.cyclomatic_complexity,
        })
        .collect();
    hotspots.sort_by(|a, b| {
        b.complexity
            .cmp(&a.complexity)
            .then(a.path.cmp(&b.path))
            .then(a.name.cmp(&b.name))
    });
    hotspots.truncate(top_n);

    let duplication_clusters = cluster_duplicates(report);
    let function_usage_details = usage_details(report);

    let mut usage_summary: BTreeMap<String, usize> = BTreeMap::new();
    for info in &function_usage_details {
        *usage_summary
            .entry(info.status.as_str().to_string())
            .or_insert(0) += 1;
    }

    AnalysisSummary {
        project_root: report.project_root.clone(),
        file_count: report.files.len(),
        symbol_count: report.symbol_count(),
        total_bytes: report.total_bytes(),
        language_summary: report.language_summary.clone(),
        largest_files: largest,
        complexity_hotspots: hotspots,
        duplication_clusters,
        function_usage_details,
        usage_summary,
    }
}

/// Group identical window hashes into clusters of two or more.
fn cluster_duplicates(report: &ScanReport) -> Vec<DuplicationCluster> {
    let mut by_hash: HashMap<u64, Vec<DuplicationOccurrence>> = HashMap::new();
    for file in &report.files {
        for fp in &file.analysis.duplication_fingerprints {
            by_hash.entry(fp.hash).or_default().push(DuplicationOccurrence {
                path: file.path.clone(),
                start_line: fp.start_line,
            });
        }
    }
    let mut clusters: Vec<DuplicationCluster> = by_hash
        .into_iter()
        .filter(|(_, occurrences)| occurrences.len() >= 2)
        .map(|(hash, mut occurrences)| {
            occurrences.sort_by(|a, b| a.path.cmp(&b.path).then(a.start_line.cmp(&b.start_line)));
            DuplicationCluster { hash, occurrences }
        })
        .collect();
    clusters.sort_by(|a, b| {
        b.size()
            .cmp(&a.size())
            .then_with(|| a.occurrences[0].path.cmp(&b.occurrences[0].path))
            .then(a.hash.cmp(&b.hash))
    });
    clusters
}

/// Apply the usage-confidence ruleset to every function and method.
/// First matching row wins; the table is normative and shared with the
/// recognition tables' version contract.
fn usage_details(report: &ScanReport) -> Vec<UsageInfo> {
    let callees: HashSet<&str> = report
        .files
        .iter()
        .flat_map(|f| f.analysis.call_sites.iter())
        .map(|c| c.callee.as_str())
        .collect();

    let mut details: Vec<UsageInfo> = report
        .files
        .iter()
        .flat_map(|f| f.analysis.symbols.iter())
        .filter(|s| matches!(s.kind, SymbolKind::Function | SymbolKind::Method))
        .map(|symbol| {
            let (status, confidence) = classify(
                callees.contains(symbol.name.as_str()),
                symbol
                    .decorator_tags
                    .iter()
                    .any(|t| tables::is_framework_decorator(t)),
                symbol.dynamically_registered,
                tables::is_known_used_name(&symbol.name),
                symbol.is_private(),
                symbol.doc_present,
            );
            UsageInfo {
                symbol_id: symbol.id(),
                path: symbol.path.clone(),
                name: symbol.qualified_name.clone(),
                status,
                confidence,
            }
        })
        .collect();
    details.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(a.path.cmp(&b.path))
            .then(a.name.cmp(&b.name))
    });
    details
}

/// The confidence table. Row order is the contract: first match wins.
fn classify(
    is_callee: bool,
    has_framework_decorator: bool,
    dynamically_registered: bool,
    known_used_name: bool,
    private: bool,
    doc_present: bool,
) -> (UsageStatus, f64) {
    if is_callee {
        (UsageStatus::Used, 1.00)
    } else if has_framework_decorator {
        (UsageStatus::LikelyUsed, 0.95)
    } else if dynamically_registered {
        (UsageStatus::LikelyUsed, 0.90)
    } else if known_used_name {
        (UsageStatus::LikelyUsed, 0.85)
    } else if private && doc_present {
        (UsageStatus::PossiblyUnused, 0.55)
    } else if private {
        (UsageStatus::PossiblyUnused, 0.65)
    } else if doc_present {
        (UsageStatus::PossiblyUnused, 0.50)
    } else {
        (UsageStatus::Unused, 0.75)
    }
}

/// One exceeded CI gate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GateBreach {
    pub gate: String,
    pub limit: u64,
    pub actual: u64,
}

/// CI verdict derived from a summary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CiReport {
    #[serde(flatten)]
    pub summary: AnalysisSummary,
    pub gates_exceeded: Vec<GateBreach>,
    pub pass: bool,
}

/// Apply configured thresholds to a summary.
pub fn evaluate_ci(summary: AnalysisSummary, ci: &CiConfig) -> CiReport {
    let mut gates_exceeded = Vec::new();

    if let Some(limit) = ci.fail_on_complexity {
        let actual = summary
            .complexity_hotspots
            .first()
            .map(|h| h.complexity)
            .unwrap_or(0);
        if actual > limit {
            gates_exceeded.push(GateBreach {
                gate: "max_complexity".to_string(),
                limit: limit as u64,
                actual: actual as u64,
            });
        }
    }
    if let Some(limit) = ci.fail_on_duplication {
        let actual = summary.duplication_clusters.len();
        if actual > limit {
            gates_exceeded.push(GateBreach {
                gate: "max_duplication_clusters".to_string(),
                limit: limit as u64,
                actual: actual as u64,
            });
        }
    }
    if let Some(limit) = ci.fail_on_unused {
        let actual = summary
            .usage_summary
            .get("unused")
            .copied()
            .unwrap_or(0);
        if actual > limit {
            gates_exceeded.push(GateBreach {
                gate: "max_unused".to_string(),
                limit: limit as u64,
                actual: actual as u64,
            });
        }
    }

    CiReport {
        pass: gates_exceeded.is_empty(),
        gates_exceeded,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        CallSite, DuplicationFingerprint, FileAnalysis, FileRecord, ScanFingerprint, SymbolRecord,
    };

    fn symbol(path: &str, name: &str, kind: SymbolKind) -> SymbolRecord {
        SymbolRecord {
            path: path.to_string(),
            name: name.to_string(),
            qualified_name: name.to_string(),
            kind,
            start_line: 1,
            doc_present: false,
            decorator_tags: Vec::new(),
            cyclomatic_complexity: 1,
            dynamically_registered: false,
        }
    }

    fn file(path: &str, size: u64, analysis: FileAnalysis) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            size_bytes: size,
            modified_at: 1,
            language_tag: "python".to_string(),
            content_hash: None,
            scan_fingerprint: ScanFingerprint {
                size_bytes: size,
                modified_at: 1,
            },
            skipped_large: false,
            analysis_error: None,
            analysis,
        }
    }

    fn report(files: Vec<FileRecord>) -> ScanReport {
        let mut r = ScanReport::new("/p".to_string());
        r.files = files;
        r
    }

    #[test]
    fn confidence_table_rows_in_order() {
        // Row 1: callee evidence beats everything.
        assert_eq!(
            classify(true, true, true, true, true, true),
            (UsageStatus::Used, 1.00)
        );
        // Row 2: framework decorator.
        assert_eq!(
            classify(false, true, true, true, false, false),
            (UsageStatus::LikelyUsed, 0.95)
        );
        // Row 3: dynamic registration.
        assert_eq!(
            classify(false, false, true, true, false, false),
            (UsageStatus::LikelyUsed, 0.90)
        );
        // Row 4: known-used name.
        assert_eq!(
            classify(false, false, false, true, false, false),
            (UsageStatus::LikelyUsed, 0.85)
        );
        // Rows 5-8.
        assert_eq!(
            classify(false, false, false, false, true, true),
            (UsageStatus::PossiblyUnused, 0.55)
        );
        assert_eq!(
            classify(false, false, false, false, true, false),
            (UsageStatus::PossiblyUnused, 0.65)
        );
        assert_eq!(
            classify(false, false, false, false, false, true),
            (UsageStatus::PossiblyUnused, 0.50)
        );
        assert_eq!(
            classify(false, false, false, false, false, false),
            (UsageStatus::Unused, 0.75)
        );
    }

    #[test]
    fn decorated_route_is_likely_used_even_without_calls() {
        let mut analysis = FileAnalysis::new("h.py".to_string(), "python");
        let mut sym = symbol("h.py", "get_h", SymbolKind::Function);
        sym.decorator_tags = vec!["router.get".to_string()];
        analysis.symbols.push(sym);
        let summary = analyze(&report(vec![file("h.py", 10, analysis)]), 10);

        let info = &summary.function_usage_details[0];
        assert_eq!(info.status, UsageStatus::LikelyUsed);
        assert_eq!(info.confidence, 0.95);
    }

    #[test]
    fn callee_evidence_wins_over_decorator() {
        let mut analysis = FileAnalysis::new("h.py".to_string(), "python");
        let mut sym = symbol("h.py", "get_h", SymbolKind::Function);
        sym.decorator_tags = vec!["router.get".to_string()];
        analysis.symbols.push(sym);
        analysis.call_sites.push(CallSite {
            caller: None,
            callee: "get_h".to_string(),
            line: 9,
        });
        let summary = analyze(&report(vec![file("h.py", 10, analysis)]), 10);
        assert_eq!(summary.function_usage_details[0].status, UsageStatus::Used);
        assert_eq!(summary.function_usage_details[0].confidence, 1.00);
    }

    #[test]
    fn classes_are_excluded_from_usage_details() {
        let mut analysis = FileAnalysis::new("m.py".to_string(), "python");
        analysis.symbols.push(symbol("m.py", "Thing", SymbolKind::Class));
        analysis.symbols.push(symbol("m.py", "helper", SymbolKind::Function));
        let summary = analyze(&report(vec![file("m.py", 10, analysis)]), 10);
        assert_eq!(summary.function_usage_details.len(), 1);
        assert_eq!(summary.function_usage_details[0].name, "helper");
    }

    #[test]
    fn hotspots_sorted_desc_with_path_tiebreak() {
        let mut a = FileAnalysis::new("a.py".to_string(), "python");
        let mut s1 = symbol("a.py", "f", SymbolKind::Function);
        s1.cyclomatic_complexity = 5;
        a.symbols.push(s1);
        let mut b = FileAnalysis::new("b.py".to_string(), "python");
        let mut s2 = symbol("b.py", "g", SymbolKind::Function);
        s2.cyclomatic_complexity = 5;
        b.symbols.push(s2);
        let mut s3 = symbol("b.py", "h", SymbolKind::Function);
        s3.cyclomatic_complexity = 9;
        b.symbols.push(s3);

        let summary = analyze(&report(vec![file("a.py", 1, a), file("b.py", 1, b)]), 10);
        let names: Vec<&str> = summary
            .complexity_hotspots
            .iter()
            .map(|h| h.name.as_str())
            .collect();
        assert_eq!(names, vec!["h", "f", "g"]);
    }

    #[test]
    fn duplication_clusters_group_shared_hashes() {
        let mut a = FileAnalysis::new("a.py".to_string(), "python");
        a.duplication_fingerprints = vec![
            DuplicationFingerprint { hash: 7, start_line: 1 },
            DuplicationFingerprint { hash: 9, start_line: 5 },
        ];
        let mut b = FileAnalysis::new("b.py".to_string(), "python");
        b.duplication_fingerprints = vec![DuplicationFingerprint { hash: 7, start_line: 3 }];

        let summary = analyze(&report(vec![file("a.py", 1, a), file("b.py", 1, b)]), 10);
        assert_eq!(summary.duplication_clusters.len(), 1);
        let cluster = &summary.duplication_clusters[0];
        assert_eq!(cluster.hash, 7);
        assert_eq!(cluster.size(), 2);
        assert_eq!(cluster.occurrences[0].path, "a.py");
    }

    #[test]
    fn usage_summary_counts_statuses() {
        let mut analysis = FileAnalysis::new("m.py".to_string(), "python");
        analysis.symbols.push(symbol("m.py", "orphan", SymbolKind::Function));
        analysis.symbols.push(symbol("m.py", "main", SymbolKind::Function));
        let summary = analyze(&report(vec![file("m.py", 1, analysis)]), 10);
        assert_eq!(summary.usage_summary.get("unused"), Some(&1));
        assert_eq!(summary.usage_summary.get("likely_used"), Some(&1));
    }

    #[test]
    fn ci_gate_reports_complexity_breach() {
        let mut analysis = FileAnalysis::new("m.py".to_string(), "python");
        let mut sym = symbol("m.py", "heavy", SymbolKind::Function);
        sym.cyclomatic_complexity = 12;
        analysis.symbols.push(sym);
        let summary = analyze(&report(vec![file("m.py", 1, analysis)]), 10);

        let ci = CiConfig {
            fail_on_complexity: Some(10),
            ..CiConfig::default()
        };
        let verdict = evaluate_ci(summary, &ci);
        assert!(!verdict.pass);
        assert_eq!(verdict.gates_exceeded.len(), 1);
        assert_eq!(verdict.gates_exceeded[0].gate, "max_complexity");
        assert_eq!(verdict.gates_exceeded[0].limit, 10);
        assert_eq!(verdict.gates_exceeded[0].actual, 12);
    }

    #[test]
    fn ci_passes_when_no_gate_configured() {
        let summary = analyze(&report(vec![]), 10);
        let verdict = evaluate_ci(summary, &CiConfig::default());
        assert!(verdict.pass);
        assert!(verdict.gates_exceeded.is_empty());
    }
}
