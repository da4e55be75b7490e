//! REST handlers for the API facade.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{authorize, ApiError, ApiResult, ApiState};
use crate::analysis;
use crate::config::Role;
use crate::error::JupiterError;
use crate::events::Topic;
use crate::graph::{self, GraphOptions};
use crate::history;
use crate::project::{Connector, ConnectorKind};
use crate::runner::{NoopTracer, RunRequest, Runner};
use crate::scanner;
use crate::simulate::{self, RemoveTarget};
use crate::types::{CancelToken, ScanOptions, ScanReport};

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ScanBody {
    pub show_hidden: bool,
    pub ignore_globs: Vec<String>,
    #[serde(default = "default_true")]
    pub incremental: bool,
    pub no_cache: bool,
    pub capture_snapshot: bool,
    pub snapshot_label: Option<String>,
}

impl ScanBody {
    fn to_options(&self) -> ScanOptions {
        ScanOptions {
            include_hidden: self.show_hidden,
            ignore_globs: self.ignore_globs.clone(),
            incremental: self.incremental,
            no_cache: self.no_cache,
            capture_snapshot: self.capture_snapshot,
            snapshot_label: self.snapshot_label.clone(),
            ..ScanOptions::default()
        }
    }
}

/// Scan on the active root, emitting the scan events and refreshing the
/// cached graph. Shared by /scan, /analyze, /ci and /graph.
async fn scan_active(
    state: &Arc<ApiState>,
    root: &std::path::Path,
    options: ScanOptions,
) -> ApiResult<ScanReport> {
    let config = state.config.read().await.clone();
    let timeout = Duration::from_secs(config.performance.timeouts.scan_seconds.max(1));
    state.counters.scans_total.fetch_add(1, Ordering::Relaxed);
    state.bus.emit(
        Topic::ScanStarted,
        json!({ "root": root.display().to_string() }),
    );

    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let worker_root = root.to_path_buf();
    let task = tokio::task::spawn_blocking(move || {
        scanner::scan(&worker_root, &options, &config, &worker_cancel)
    });
    let outcome = match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined
            .map_err(|e| ApiError(JupiterError::Internal(e.to_string())))?
            .map_err(ApiError)?,
        Err(_) => {
            cancel.cancel();
            return Err(ApiError(JupiterError::Internal(
                "scan timed out".to_string(),
            )));
        }
    };

    if let Some(snapshot) = &outcome.snapshot {
        state.bus.emit(
            Topic::SnapshotCreated,
            json!({ "id": snapshot.id, "label": snapshot.label }),
        );
    }
    let report_json = serde_json::to_value(&outcome.report)
        .map_err(|e| ApiError(JupiterError::Internal(e.to_string())))?;
    state
        .bus
        .emit(Topic::ScanFinished, json!({ "report": report_json }));

    *state.latest_graph.write().await =
        Some(graph::build(&outcome.report, &GraphOptions::default()));
    Ok(outcome.report)
}

pub async fn health(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let root = state.root.read().await.display().to_string();
    Json(json!({ "status": "ok", "root": root }))
}

pub async fn metrics(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let config = state.config.read().await;
    authorize(&config, &headers, Role::Viewer)?;
    drop(config);
    let jobs = state.jobs.list();
    let plugin_count = state.bridge.list().len();
    Ok(Json(json!({
        "scans_total": state.counters.scans_total.load(Ordering::Relaxed),
        "analyzes_total": state.counters.analyzes_total.load(Ordering::Relaxed),
        "runs_total": state.counters.runs_total.load(Ordering::Relaxed),
        "ws_clients": state.counters.ws_clients.load(Ordering::Relaxed),
        "events_emitted": state.bus.emitted_count(),
        "events_delivered": state.bus.delivered_count(),
        "bus_overflow": state.bus.overflow_count(),
        "jobs_total": jobs.len(),
        "plugins_total": plugin_count,
    })))
}

pub async fn scan(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<ScanBody>,
) -> ApiResult<Json<ScanReport>> {
    {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Viewer)?;
    }
    let root = state.root.read().await;
    let report = scan_active(&state, &root, body.to_options()).await?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AnalyzeQuery {
    pub top: Option<usize>,
    pub show_hidden: Option<bool>,
    pub ignore_globs: Option<String>,
    pub backend_name: Option<String>,
}

pub async fn analyze(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<AnalyzeQuery>,
) -> ApiResult<Json<analysis::AnalysisSummary>> {
    {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Viewer)?;
    }
    state.counters.analyzes_total.fetch_add(1, Ordering::Relaxed);
    let top_n = query.top.unwrap_or(10);
    let options = ScanOptions {
        include_hidden: query.show_hidden.unwrap_or(false),
        ignore_globs: query
            .ignore_globs
            .as_deref()
            .map(|g| g.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        ..ScanOptions::default()
    };

    // A named backend proxies to that project's connector.
    if let Some(backend) = &query.backend_name {
        if backend != "local" {
            let entry = state
                .projects
                .get(backend)
                .ok_or_else(|| JupiterError::NotFound(format!("backend {backend}")))?;
            if entry.connector_kind == ConnectorKind::Remote {
                let config = state.config.read().await.clone();
                let connector = Connector::for_entry(&entry, &config, Arc::clone(&state.bus))
                    .map_err(ApiError)?;
                let summary = connector
                    .analyze(options, top_n, CancelToken::new())
                    .await
                    .map_err(ApiError)?;
                return Ok(Json(summary));
            }
        }
    }

    let root = state.root.read().await;
    let report = scan_active(&state, &root, options).await?;
    let summary = analysis::analyze(&report, top_n);
    let summary_json = serde_json::to_value(&summary)
        .map_err(|e| ApiError(JupiterError::Internal(e.to_string())))?;
    state
        .bus
        .emit(Topic::ScanFinished, json!({ "summary": summary_json }));
    Ok(Json(summary))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CiBody {
    pub fail_on_complexity: Option<u32>,
    pub fail_on_duplication: Option<usize>,
    pub fail_on_unused: Option<usize>,
}

pub async fn ci(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<CiBody>,
) -> ApiResult<Json<analysis::CiReport>> {
    {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Viewer)?;
    }
    let root = state.root.read().await;
    let report = scan_active(&state, &root, ScanOptions::default()).await?;
    let summary = analysis::analyze(&report, 10);

    let mut gates = state.config.read().await.ci.clone();
    if body.fail_on_complexity.is_some() {
        gates.fail_on_complexity = body.fail_on_complexity;
    }
    if body.fail_on_duplication.is_some() {
        gates.fail_on_duplication = body.fail_on_duplication;
    }
    if body.fail_on_unused.is_some() {
        gates.fail_on_unused = body.fail_on_unused;
    }
    Ok(Json(analysis::evaluate_ci(summary, &gates)))
}

pub async fn run(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<RunRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let (auth, security, timeout) = {
        let config = state.config.read().await;
        let auth = authorize(&config, &headers, Role::Admin)?;
        (
            auth,
            config.security.clone(),
            Duration::from_secs(config.performance.timeouts.run_seconds.max(1)),
        )
    };
    let license_ok = state.license.permits_privileged();
    let target = request.command.join(" ");
    if let Err(err) = Runner::check_policy(&security, &request, auth.role, license_ok) {
        let _ = state.audit.append(
            Some(auth.role),
            Some(&auth.token_id),
            "run",
            &target,
            err.code(),
        );
        return Err(ApiError(err));
    }
    let _ = state
        .audit
        .append(Some(auth.role), Some(&auth.token_id), "run", &target, "ok");
    state.counters.runs_total.fetch_add(1, Ordering::Relaxed);

    let runner = Runner::new(Arc::clone(&state.bus), Arc::new(NoopTracer));
    let result = runner
        .run(&request, timeout, &CancelToken::new())
        .await
        .map_err(ApiError)?;
    Ok(Json(serde_json::to_value(result).map_err(|e| {
        ApiError(JupiterError::Internal(e.to_string()))
    })?))
}

pub async fn snapshots_list(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Viewer)?;
    }
    let root = state.root.read().await;
    let snapshots = history::list_snapshots(&root).map_err(ApiError)?;
    Ok(Json(json!({ "snapshots": snapshots })))
}

pub async fn snapshots_show(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Viewer)?;
    }
    let root = state.root.read().await;
    let (metadata, report) = history::load_snapshot(&root, &id).map_err(ApiError)?;
    Ok(Json(json!({ "metadata": metadata, "report": report })))
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    pub id_a: String,
    pub id_b: String,
}

pub async fn snapshots_diff(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<DiffQuery>,
) -> ApiResult<Json<history::SnapshotDiff>> {
    {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Viewer)?;
    }
    let root = state.root.read().await;
    let diff = history::diff(&root, &query.id_a, &query.id_b).map_err(ApiError)?;
    Ok(Json(diff))
}

pub async fn simulate_remove(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(target): Json<RemoveTarget>,
) -> ApiResult<Json<simulate::ImpactReport>> {
    {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Viewer)?;
    }
    let root = state.root.read().await;
    // Simulation runs against the latest graph; build one if no scan has
    // produced it yet.
    let cached = state.latest_graph.read().await.clone();
    let graph = match cached {
        Some(graph) => graph,
        None => {
            scan_active(&state, &root, ScanOptions::default()).await?;
            state
                .latest_graph
                .read()
                .await
                .clone()
                .ok_or_else(|| ApiError(JupiterError::Internal("graph unavailable".to_string())))?
        }
    };
    let report = simulate::simulate_remove(&graph, &target).map_err(ApiError)?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GraphQuery {
    pub simplify: Option<bool>,
    pub max_nodes: Option<usize>,
    pub depth: Option<usize>,
    pub backend_name: Option<String>,
}

pub async fn graph(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<GraphQuery>,
) -> ApiResult<Json<graph::DependencyGraph>> {
    {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Viewer)?;
    }
    let graph_options = GraphOptions {
        simplify: query.simplify.unwrap_or(false),
        directory_depth: query.depth.unwrap_or(1),
        max_nodes: query.max_nodes,
    };

    if let Some(backend) = &query.backend_name {
        if backend != "local" {
            let entry = state
                .projects
                .get(backend)
                .ok_or_else(|| JupiterError::NotFound(format!("backend {backend}")))?;
            if entry.connector_kind == ConnectorKind::Remote {
                let config = state.config.read().await.clone();
                let connector = Connector::for_entry(&entry, &config, Arc::clone(&state.bus))
                    .map_err(ApiError)?;
                let built = connector
                    .graph(ScanOptions::default(), graph_options, CancelToken::new())
                    .await
                    .map_err(ApiError)?;
                return Ok(Json(built));
            }
        }
    }

    let root = state.root.read().await;
    let report = scan_active(&state, &root, ScanOptions::default()).await?;
    let built = graph::build(&report, &graph_options);
    *state.latest_graph.write().await = Some(built.clone());
    Ok(Json(built))
}

pub async fn plugins_list(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Viewer)?;
    }
    state.bridge.refresh_health();
    Ok(Json(json!({ "plugins": state.bridge.list() })))
}

#[derive(Debug, Deserialize)]
pub struct ToggleBody {
    pub enabled: bool,
}

pub async fn plugins_toggle(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ToggleBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let auth = {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Admin)?
    };
    let result = state.bridge.toggle(&id, body.enabled);
    let _ = state.audit.append(
        Some(auth.role),
        Some(&auth.token_id),
        "plugin_toggle",
        &id,
        if result.is_ok() { "ok" } else { "error" },
    );
    let enabled = result.map_err(ApiError)?;
    Ok(Json(json!({ "success": true, "enabled": enabled })))
}

pub async fn plugin_config_get(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let config = state.config.read().await;
    authorize(&config, &headers, Role::Viewer)?;
    state
        .bridge
        .get(&id)
        .ok_or_else(|| ApiError(JupiterError::NotFound(format!("plugin {id}"))))?;
    Ok(Json(config.plugin_slice(&id)))
}

pub async fn plugin_config_set(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let auth = {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Admin)?
    };
    state
        .bridge
        .get(&id)
        .ok_or_else(|| ApiError(JupiterError::NotFound(format!("plugin {id}"))))?;
    let root = state.root.read().await.clone();
    let merged = {
        let mut config = state.config.write().await;
        let slot = config
            .plugins
            .per_plugin_overrides
            .entry(id.clone())
            .or_insert(json!({}));
        merge_json(slot, body);
        let merged = slot.clone();
        config.save(&root).map_err(ApiError)?;
        merged
    };
    let _ = state.audit.append(
        Some(auth.role),
        Some(&auth.token_id),
        "plugin_config_write",
        &id,
        "ok",
    );
    state
        .bus
        .emit(Topic::ConfigUpdated, json!({ "plugin_id": id }));
    Ok(Json(merged))
}

fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[derive(Debug, Deserialize)]
pub struct InstallBody {
    pub source_url_or_path: String,
}

pub async fn plugins_install(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<InstallBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let auth = {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Admin)?
    };
    if body.source_url_or_path.starts_with("http://")
        || body.source_url_or_path.starts_with("https://")
    {
        return Err(ApiError(JupiterError::Validation(
            "remote plugin sources are not supported; provide a local path".to_string(),
        )));
    }
    let source = PathBuf::from(&body.source_url_or_path);
    let result = state.bridge.install_from_path(&source);
    let _ = state.audit.append(
        Some(auth.role),
        Some(&auth.token_id),
        "plugin_install",
        &body.source_url_or_path,
        if result.is_ok() { "ok" } else { "error" },
    );
    let registration = result.map_err(ApiError)?;
    Ok(Json(json!({
        "installed": registration.manifest.id,
        "status": registration.status,
        "trust": registration.trust,
    })))
}

pub async fn plugins_reload(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let auth = {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Admin)?
    };
    let result = state.bridge.reload(&id);
    let _ = state.audit.append(
        Some(auth.role),
        Some(&auth.token_id),
        "plugin_reload",
        &id,
        if result.is_ok() { "ok" } else { "error" },
    );
    result.map_err(ApiError)?;
    Ok(Json(json!({ "success": true })))
}

pub async fn license_status(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(state.license.status()).unwrap_or(json!({})))
}

pub async fn license_refresh(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Viewer)?;
    }
    let refreshed = state.license.refresh().await;
    Ok(Json(serde_json::to_value(refreshed).unwrap_or(json!({}))))
}

pub async fn config_get(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let config = state.config.read().await;
    authorize(&config, &headers, Role::Viewer)?;
    let mut redacted = config.clone();
    for token in &mut redacted.security.tokens {
        token.token = "***".to_string();
    }
    Ok(Json(serde_json::to_value(redacted).map_err(|e| {
        ApiError(JupiterError::Internal(e.to_string()))
    })?))
}

pub async fn config_set(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    let auth = {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Admin)?
    };
    let root = state.root.read().await.clone();
    let updated = {
        let mut config = state.config.write().await;
        let mut merged = serde_json::to_value(&*config)
            .map_err(|e| ApiError(JupiterError::Internal(e.to_string())))?;
        merge_json(&mut merged, body);
        let parsed: crate::config::JupiterConfig = serde_json::from_value(merged)
            .map_err(|e| ApiError(JupiterError::Validation(format!("invalid config: {e}"))))?;
        *config = parsed;
        config.save(&root).map_err(ApiError)?;
        config.clone()
    };
    let _ = state.audit.append(
        Some(auth.role),
        Some(&auth.token_id),
        "config_write",
        "project_config",
        "ok",
    );
    state.bus.emit(Topic::ConfigUpdated, json!({}));
    let mut redacted = updated;
    for token in &mut redacted.security.tokens {
        token.token = "***".to_string();
    }
    Ok(Json(serde_json::to_value(redacted).map_err(|e| {
        ApiError(JupiterError::Internal(e.to_string()))
    })?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FsListQuery {
    pub path: String,
}

pub async fn fs_list(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<FsListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Viewer)?;
    }
    let root = state.root.read().await;
    let rel = std::path::Path::new(query.path.trim_start_matches('/'));
    if rel
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(ApiError(JupiterError::Validation(
            "path escapes project root".to_string(),
        )));
    }
    let target = root.join(rel);
    if !target.is_dir() {
        return Err(ApiError(JupiterError::NotFound(format!(
            "directory {}",
            query.path
        ))));
    }
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&target)
        .map_err(|e| ApiError(JupiterError::Internal(e.to_string())))?
        .filter_map(|e| e.ok())
    {
        let meta = entry.metadata().ok();
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "is_dir": entry.path().is_dir(),
            "size_bytes": meta.map(|m| m.len()).unwrap_or(0),
        }));
    }
    entries.sort_by(|a, b| {
        a["name"]
            .as_str()
            .unwrap_or("")
            .cmp(b["name"].as_str().unwrap_or(""))
    });
    Ok(Json(json!({ "entries": entries })))
}

pub async fn projects_list(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Viewer)?;
    }
    let active = state.projects.active().map(|p| p.id);
    Ok(Json(json!({
        "projects": state.projects.list(),
        "active": active,
    })))
}

/// Switch the active project. Taking the root's write lock drains every
/// in-flight request bound to the previous project before new ones are
/// admitted (the CONFIG_UPDATED barrier).
pub async fn projects_activate(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let auth = {
        let config = state.config.read().await;
        authorize(&config, &headers, Role::Admin)?
    };
    let entry = state
        .projects
        .switch_active(&id, &state.jobs, &state.bus)
        .await
        .map_err(ApiError)?;
    if entry.connector_kind == ConnectorKind::Local {
        let new_root = PathBuf::from(&entry.root_path_or_url);
        let new_config = crate::config::JupiterConfig::load(&new_root).map_err(ApiError)?;
        // The write side drains in-flight requests on the old project.
        {
            let mut root = state.root.write().await;
            *root = new_root;
        }
        *state.config.write().await = new_config;
        *state.latest_graph.write().await = None;
    }
    let _ = state.audit.append(
        Some(auth.role),
        Some(&auth.token_id),
        "project_activate",
        &id,
        "ok",
    );
    Ok(Json(json!({ "active": id })))
}
