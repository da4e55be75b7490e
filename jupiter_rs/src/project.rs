//! Project registry and backend connectors.
//!
//! The registry (`~/.jupiter/projects.json`) names every known project;
//! exactly one is active at a time. Connectors are polymorphic over
//! {scan, analyze, run, graph, snapshots, api_base_url}: `local` wires
//! straight into the engine, `remote` proxies another Jupiter instance
//! over HTTP with explicit timeouts and typed `connector_error`s.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::analysis::{self, AnalysisSummary};
use crate::config::JupiterConfig;
use crate::error::{JupiterError, Result};
use crate::events::{EventBus, Topic};
use crate::graph::{self, DependencyGraph, GraphOptions};
use crate::history::{self, SnapshotMetadata};
use crate::jobs::JobManager;
use crate::runner::{CommandResult, NoopTracer, RunRequest, Runner};
use crate::scanner::{self, ScanOutcome};
use crate::types::{CancelToken, ScanOptions, ScanReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    Local,
    Remote,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub id: String,
    pub display_name: String,
    pub root_path_or_url: String,
    pub connector_kind: ConnectorKind,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    projects: Vec<ProjectEntry>,
    active_id: Option<String>,
}

/// Local connector: direct calls into the engine.
pub struct LocalConnector {
    pub root: PathBuf,
    pub config: JupiterConfig,
    pub bus: Arc<EventBus>,
}

/// Remote connector: proxy to another Jupiter's API.
pub struct RemoteConnector {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl RemoteConnector {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .request(self.client.get(&url).query(query))
            .send()
            .await
            .map_err(|e| connector_error(path, e))?;
        decode(path, response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .request(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| connector_error(path, e))?;
        decode(path, response).await
    }
}

/// Network errors never echo credentials; reqwest errors carry the URL
/// only.
fn connector_error(path: &str, err: reqwest::Error) -> JupiterError {
    JupiterError::Connector(format!("remote {path}: {err}"))
}

async fn decode<T: serde::de::DeserializeOwned>(
    path: &str,
    response: reqwest::Response,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(JupiterError::Connector(format!(
            "remote {path}: backend returned {status}"
        )));
    }
    response
        .json()
        .await
        .map_err(|e| JupiterError::Connector(format!("remote {path}: bad payload: {e}")))
}

/// Polymorphic backend.
pub enum Connector {
    Local(LocalConnector),
    Remote(RemoteConnector),
}

impl Connector {
    pub fn for_entry(
        entry: &ProjectEntry,
        config: &JupiterConfig,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        match entry.connector_kind {
            ConnectorKind::Local => {
                let root = PathBuf::from(&entry.root_path_or_url);
                if !root.is_dir() {
                    return Err(JupiterError::Validation(format!(
                        "project root does not exist: {}",
                        root.display()
                    )));
                }
                Ok(Connector::Local(LocalConnector {
                    root,
                    config: config.clone(),
                    bus,
                }))
            }
            ConnectorKind::Remote => Ok(Connector::Remote(RemoteConnector::new(
                &entry.root_path_or_url,
                None,
                Duration::from_secs(config.performance.timeouts.http_idle_seconds),
            ))),
        }
    }

    pub async fn scan(&self, options: ScanOptions, cancel: CancelToken) -> Result<ScanReport> {
        match self {
            Connector::Local(local) => {
                let root = local.root.clone();
                let config = local.config.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    scanner::scan(&root, &options, &config, &cancel)
                })
                .await
                .map_err(|e| JupiterError::Internal(e.to_string()))??;
                let ScanOutcome { report, .. } = outcome;
                Ok(report)
            }
            Connector::Remote(remote) => {
                remote
                    .post_json(
                        "/scan",
                        serde_json::json!({
                            "show_hidden": options.include_hidden,
                            "ignore_globs": options.ignore_globs,
                            "incremental": options.incremental,
                            "capture_snapshot": options.capture_snapshot,
                            "snapshot_label": options.snapshot_label,
                        }),
                    )
                    .await
            }
        }
    }

    pub async fn analyze(
        &self,
        options: ScanOptions,
        top_n: usize,
        cancel: CancelToken,
    ) -> Result<AnalysisSummary> {
        match self {
            Connector::Local(_) => {
                let report = self.scan(options, cancel).await?;
                Ok(analysis::analyze(&report, top_n))
            }
            Connector::Remote(remote) => {
                remote
                    .get_json("/analyze", &[("top", top_n.to_string())])
                    .await
            }
        }
    }

    pub async fn graph(
        &self,
        options: ScanOptions,
        graph_options: GraphOptions,
        cancel: CancelToken,
    ) -> Result<DependencyGraph> {
        match self {
            Connector::Local(_) => {
                let report = self.scan(options, cancel).await?;
                Ok(graph::build(&report, &graph_options))
            }
            Connector::Remote(remote) => {
                let mut query = vec![("simplify", graph_options.simplify.to_string())];
                if let Some(max_nodes) = graph_options.max_nodes {
                    query.push(("max_nodes", max_nodes.to_string()));
                }
                remote.get_json("/graph", &query).await
            }
        }
    }

    pub async fn run(
        &self,
        request: &RunRequest,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<CommandResult> {
        match self {
            Connector::Local(local) => {
                let runner = Runner::new(Arc::clone(&local.bus), Arc::new(NoopTracer));
                runner.run(request, timeout, &cancel).await
            }
            Connector::Remote(remote) => {
                remote
                    .post_json(
                        "/run",
                        serde_json::json!({
                            "command": request.command,
                            "with_dynamic": request.with_dynamic,
                        }),
                    )
                    .await
            }
        }
    }

    pub async fn snapshots(&self) -> Result<Vec<SnapshotMetadata>> {
        match self {
            Connector::Local(local) => history::list_snapshots(&local.root),
            Connector::Remote(remote) => {
                #[derive(Deserialize)]
                struct Listing {
                    snapshots: Vec<SnapshotMetadata>,
                }
                let listing: Listing = remote.get_json("/snapshots", &[]).await?;
                Ok(listing.snapshots)
            }
        }
    }

    /// Base URL the web UI should talk to; None for local.
    pub fn api_base_url(&self) -> Option<String> {
        match self {
            Connector::Local(_) => None,
            Connector::Remote(remote) => Some(remote.base_url.clone()),
        }
    }
}

/// Registry of projects plus the active-project switch.
pub struct ProjectManager {
    registry_path: PathBuf,
    state: Mutex<RegistryFile>,
}

impl ProjectManager {
    /// Registry at the default user-wide location.
    pub fn load_default() -> Self {
        Self::with_path(crate::config::user_dir().join("projects.json"))
    }

    pub fn with_path(registry_path: PathBuf) -> Self {
        let state = std::fs::read_to_string(&registry_path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self {
            registry_path,
            state: Mutex::new(state),
        }
    }

    fn persist(&self, state: &RegistryFile) -> Result<()> {
        crate::cache::write_atomic(
            &self.registry_path,
            &serde_json::to_vec_pretty(state)?,
        )?;
        Ok(())
    }

    pub fn list(&self) -> Vec<ProjectEntry> {
        self.state.lock().expect("registry poisoned").projects.clone()
    }

    pub fn get(&self, id: &str) -> Option<ProjectEntry> {
        self.state
            .lock()
            .expect("registry poisoned")
            .projects
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    pub fn add(&self, entry: ProjectEntry) -> Result<()> {
        let mut state = self.state.lock().expect("registry poisoned");
        if state.projects.iter().any(|p| p.id == entry.id) {
            return Err(JupiterError::Validation(format!(
                "project id already registered: {}",
                entry.id
            )));
        }
        state.projects.push(entry);
        if state.active_id.is_none() {
            state.active_id = state.projects.first().map(|p| p.id.clone());
        }
        self.persist(&state)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("registry poisoned");
        let before = state.projects.len();
        state.projects.retain(|p| p.id != id);
        if state.projects.len() == before {
            return Err(JupiterError::NotFound(format!("project {id}")));
        }
        if state.active_id.as_deref() == Some(id) {
            state.active_id = state.projects.first().map(|p| p.id.clone());
        }
        self.persist(&state)
    }

    pub fn active(&self) -> Option<ProjectEntry> {
        let state = self.state.lock().expect("registry poisoned");
        let id = state.active_id.clone()?;
        state.projects.iter().find(|p| p.id == id).cloned()
    }

    /// Switch the active project: wait for in-flight jobs, then flip the
    /// pointer and broadcast `CONFIG_UPDATED` as the happens-before
    /// barrier for request admission.
    pub async fn switch_active(
        &self,
        id: &str,
        jobs: &JobManager,
        bus: &EventBus,
    ) -> Result<ProjectEntry> {
        let entry = self
            .get(id)
            .ok_or_else(|| JupiterError::NotFound(format!("project {id}")))?;

        // Quiesce: non-cancellable jobs are waited for, bounded.
        jobs.quiesce(Duration::from_secs(30)).await;

        {
            let mut state = self.state.lock().expect("registry poisoned");
            state.active_id = Some(id.to_string());
            self.persist(&state)?;
        }
        // Cache locks are dropped with their guards; nothing to flush
        // beyond making sure no scan is mid-write, which quiesce covers.
        bus.emit(
            Topic::ConfigUpdated,
            serde_json::json!({ "active_project": id }),
        );
        info!(project = id, "active project switched");
        Ok(entry)
    }

    /// Register a local root on first use, deriving an id from the
    /// directory name.
    pub fn ensure_local(&self, root: &Path) -> Result<ProjectEntry> {
        let canonical = root
            .canonicalize()
            .map_err(|e| JupiterError::Validation(format!("bad root {}: {e}", root.display())))?;
        let display = canonical
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        if let Some(existing) = self
            .list()
            .into_iter()
            .find(|p| p.root_path_or_url == canonical.display().to_string())
        {
            return Ok(existing);
        }
        let mut id = display.to_lowercase().replace([' ', '/'], "-");
        if self.get(&id).is_some() {
            let mut n = 2;
            while self.get(&format!("{id}-{n}")).is_some() {
                n += 1;
            }
            id = format!("{id}-{n}");
        }
        let entry = ProjectEntry {
            id,
            display_name: display,
            root_path_or_url: canonical.display().to_string(),
            connector_kind: ConnectorKind::Local,
        };
        if let Err(err) = self.add(entry.clone()) {
            warn!(error = %err, "project registry not updated");
        }
        Ok(entry)
    }
}
