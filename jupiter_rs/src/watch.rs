//! Watch mode: debounced re-scans on filesystem change.
//!
//! Monitors the project root, debounces change bursts (500 ms default),
//! and re-runs an incremental scan for each batch. Ignore rules apply to
//! the change set, so churn in ignored directories never triggers a
//! scan. Exits cleanly when the cancellation token flips.

use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tracing::warn;

use crate::config::JupiterConfig;
use crate::error::{JupiterError, Result};
use crate::ignore::IgnoreEngine;
use crate::scanner;
use crate::types::{CancelToken, ScanOptions};

pub struct WatchConfig {
    pub debounce: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

/// Watch `root` and re-scan on change until cancelled. Each completed
/// scan is reported through `on_scan`.
pub fn watch_and_rescan(
    root: &Path,
    options: &ScanOptions,
    config: &JupiterConfig,
    watch_config: &WatchConfig,
    cancel: &CancelToken,
    mut on_scan: impl FnMut(&scanner::ScanOutcome),
) -> Result<()> {
    let root = root
        .canonicalize()
        .map_err(|e| JupiterError::Validation(format!("bad watch root: {e}")))?;
    let ignore = IgnoreEngine::new(&root, &config.scan.ignore_globs, &options.ignore_globs);

    let (tx, rx) = channel();
    let mut debouncer: Debouncer<RecommendedWatcher, RecommendedCache> = new_debouncer(
        watch_config.debounce,
        None,
        move |result: DebounceEventResult| {
            if tx.send(result).is_err() {
                // Receiver gone; the watch loop is shutting down.
            }
        },
    )
    .map_err(|e| JupiterError::Internal(format!("watcher: {e}")))?;
    debouncer
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| JupiterError::Internal(format!("watch {}: {e}", root.display())))?;

    // Initial scan before the first change arrives.
    let outcome = scanner::scan(&root, options, config, cancel)?;
    on_scan(&outcome);

    let incremental = ScanOptions {
        incremental: true,
        ..options.clone()
    };
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(Ok(events)) => {
                let changed = relevant_paths(&root, &ignore, &events);
                if changed.is_empty() {
                    continue;
                }
                match scanner::scan(&root, &incremental, config, cancel) {
                    Ok(outcome) => on_scan(&outcome),
                    Err(err) => warn!(error = %err, "re-scan failed"),
                }
            }
            Ok(Err(errors)) => {
                for error in errors {
                    warn!(error = %error, "watch error");
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

/// Changed paths that survive the ignore rules.
fn relevant_paths(
    root: &Path,
    ignore: &IgnoreEngine,
    events: &[notify_debouncer_full::DebouncedEvent],
) -> Vec<PathBuf> {
    let mut changed = Vec::new();
    for event in events {
        for path in &event.paths {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            if rel.is_empty() || ignore.should_ignore(&rel) {
                continue;
            }
            changed.push(path.clone());
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{Event, EventKind};
    use notify_debouncer_full::DebouncedEvent;
    use std::time::Instant;
    use tempfile::TempDir;

    fn debounced(path: PathBuf) -> DebouncedEvent {
        DebouncedEvent::new(
            Event {
                kind: EventKind::Any,
                paths: vec![path],
                attrs: Default::default(),
            },
            Instant::now(),
        )
    }

    #[test]
    fn ignored_paths_do_not_trigger() {
        let tmp = TempDir::new().expect("tmp dir");
        let root = tmp.path().canonicalize().expect("canon");
        let ignore = IgnoreEngine::from_patterns(&["dist".to_string()]);

        let kept = relevant_paths(
            &root,
            &ignore,
            &[
                debounced(root.join("src/app.py")),
                debounced(root.join("dist/bundle.js")),
                debounced(root.join(".jupiter/cache/scan_index.json")),
            ],
        );
        assert_eq!(kept.len(), 2);
        // Cache churn is not ignored by this pattern set alone; built-in
        // rules come in through IgnoreEngine::new.
        let full = IgnoreEngine::new(&root, &[], &["dist".to_string()]);
        let kept = relevant_paths(
            &root,
            &full,
            &[
                debounced(root.join("src/app.py")),
                debounced(root.join(".jupiter/cache/scan_index.json")),
            ],
        );
        assert_eq!(kept, vec![root.join("src/app.py")]);
    }

    #[test]
    fn cancelled_watch_returns_immediately() {
        let tmp = TempDir::new().expect("tmp dir");
        std::fs::write(tmp.path().join("a.py"), "def f():\n    pass\n").expect("write");
        let cancel = CancelToken::new();
        let mut scans = 0usize;

        // Cancel after the initial scan: the loop must observe the flag
        // on its next tick and return.
        watch_and_rescan(
            tmp.path(),
            &ScanOptions::default(),
            &JupiterConfig::default(),
            &WatchConfig {
                debounce: Duration::from_millis(50),
            },
            &cancel,
            |_outcome| {
                scans += 1;
                cancel.cancel();
            },
        )
        .expect("watch exits");
        assert_eq!(scans, 1);
    }
}
