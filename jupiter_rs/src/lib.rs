//! # jupiter
//!
//! **Project introspection server** - scan a source tree into immutable
//! snapshot reports, derive quality metrics and dependency graphs,
//! predict removal impact, and expose it all over an HTTP+WebSocket API,
//! a CLI, and a manifest-driven plugin bridge.
//!
//! ## Engine layout
//!
//! - [`scanner`] - parallel filesystem walk into a [`types::ScanReport`],
//!   consulting the [`ignore`] engine, the [`cache`] store, and the
//!   per-language [`analyzer`]s
//! - [`analysis`] - aggregation: hotspots, duplication clusters, and the
//!   usage-confidence ruleset
//! - [`graph`] / [`simulate`] - dependency graph construction and
//!   removal-impact prediction
//! - [`history`] - persisted snapshots and structured diffs
//! - [`events`] / [`jobs`] - typed pub/sub and the async job manager
//!   with its per-plugin circuit breaker
//! - [`plugins`] - manifest discovery, lifecycle, permission model, and
//!   the service locator
//! - [`project`] - project registry and local/remote connectors
//! - [`api`] - the REST + WebSocket facade
//! - [`cli`] - the `jupiter` command tree
//!
//! ## Quick start (library usage)
//!
//! ```rust,no_run
//! use jupiter::{analysis, scanner};
//! use jupiter::config::JupiterConfig;
//! use jupiter::types::{CancelToken, ScanOptions};
//! use std::path::Path;
//!
//! let root = Path::new(".");
//! let config = JupiterConfig::load(root).unwrap();
//! let outcome = scanner::scan(
//!     root,
//!     &ScanOptions::default(),
//!     &config,
//!     &CancelToken::new(),
//! )
//! .unwrap();
//! let summary = analysis::analyze(&outcome.report, 10);
//! println!("{} files, {} symbols", summary.file_count, summary.symbol_count);
//! ```

pub mod analysis;
pub mod analyzer;
pub mod api;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod history;
pub mod ignore;
pub mod jobs;
pub mod license;
pub mod plugins;
pub mod project;
pub mod runner;
pub mod scanner;
pub mod simulate;
pub mod types;
pub mod watch;

pub use analysis::{analyze, AnalysisSummary};
pub use error::{JupiterError, Result};
pub use scanner::scan;
pub use types::{FileAnalysis, FileRecord, ScanOptions, ScanReport};
