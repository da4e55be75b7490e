//! API facade tests: RBAC, error envelope, and the scan/simulate flows,
//! driven through the router without a live socket.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use jupiter::api::{self, ApiCounters, ApiState};
use jupiter::config::{JupiterConfig, Role, TokenEntry};
use jupiter::events::EventBus;
use jupiter::jobs::{JobManager, JobManagerConfig};
use jupiter::license::LicenseAdapter;
use jupiter::plugins::permissions::AuditLog;
use jupiter::plugins::{BridgeServices, PluginBridge};
use jupiter::project::ProjectManager;
use tempfile::TempDir;

fn test_config() -> JupiterConfig {
    JupiterConfig {
        security: jupiter::config::SecurityConfig {
            tokens: vec![
                TokenEntry {
                    token: "admin-token".to_string(),
                    role: Role::Admin,
                },
                TokenEntry {
                    token: "viewer-token".to_string(),
                    role: Role::Viewer,
                },
            ],
            allow_run: false,
            allowed_commands: vec![],
        },
        ..JupiterConfig::default()
    }
}

fn state_for(root: &Path, config: JupiterConfig) -> Arc<ApiState> {
    let bus = Arc::new(EventBus::default());
    let jobs = JobManager::new(JobManagerConfig::default(), Arc::clone(&bus));
    let license = LicenseAdapter::new(config.license.clone());
    let bridge = PluginBridge::new(
        root.join("plugins"),
        BridgeServices {
            bus: Arc::clone(&bus),
            jobs: Arc::clone(&jobs),
            license: Arc::clone(&license),
            project_root: root.to_path_buf(),
            config: config.clone(),
        },
    );
    let projects = Arc::new(ProjectManager::with_path(
        root.join(".jupiter-test-projects.json"),
    ));
    Arc::new(ApiState {
        root: tokio::sync::RwLock::new(root.to_path_buf()),
        config: tokio::sync::RwLock::new(config),
        bus,
        jobs,
        license,
        bridge,
        projects,
        audit: AuditLog::new(root),
        latest_graph: tokio::sync::RwLock::new(None),
        counters: ApiCounters::default(),
    })
}

async fn call(
    state: &Arc<ApiState>,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let router = api::router(Arc::clone(state));
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(json) => request
            .header("Content-Type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => request.body(Body::empty()).expect("request"),
    };
    let response = router.oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

fn project_with(files: &[(&str, &str)]) -> TempDir {
    let tmp = TempDir::new().expect("tmp dir");
    for (rel, content) in files {
        let path = tmp.path().join(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, content).expect("write");
    }
    tmp
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_is_public() {
    let project = project_with(&[("a.py", "x = 1\n")]);
    let state = state_for(project.path(), test_config());
    let (status, body) = call(&state, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_token_yields_auth_envelope() {
    let project = project_with(&[("a.py", "x = 1\n")]);
    let state = state_for(project.path(), test_config());
    let (status, body) = call(&state, "GET", "/metrics", None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "auth_error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn viewer_token_is_refused_on_admin_endpoint_without_side_effect() {
    let project = project_with(&[("a.py", "x = 1\n")]);
    let state = state_for(project.path(), test_config());
    let (status, body) = call(
        &state,
        "POST",
        "/run",
        Some("viewer-token"),
        Some(serde_json::json!({ "command": ["echo", "hi"] })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "auth_error");
    // No side effect: nothing ran, nothing audited as ok.
    assert_eq!(
        state
            .counters
            .runs_total
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
    let entries = state.audit.read_all().expect("audit");
    assert!(entries.iter().all(|e| e.result != "ok"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_policy_denied_is_audited() {
    let project = project_with(&[("a.py", "x = 1\n")]);
    let state = state_for(project.path(), test_config());
    let (status, body) = call(
        &state,
        "POST",
        "/run",
        Some("admin-token"),
        Some(serde_json::json!({ "command": ["echo", "hi"] })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "policy_denied");
    let entries = state.audit.read_all().expect("audit");
    assert!(entries
        .iter()
        .any(|e| e.action == "run" && e.result == "policy_denied"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scan_returns_report_for_viewer() {
    let project = project_with(&[
        ("a.py", "def f():\n    pass\n"),
        ("b.py", "def g():\n    pass\n"),
    ]);
    let state = state_for(project.path(), test_config());
    let (status, body) = call(
        &state,
        "POST",
        "/scan",
        Some("viewer-token"),
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let paths: Vec<&str> = body["files"]
        .as_array()
        .expect("files")
        .iter()
        .map(|f| f["path"].as_str().expect("path"))
        .collect();
    assert_eq!(paths, vec!["a.py", "b.py"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn analyze_and_ci_gate_over_http() {
    let project = project_with(&[(
        "hot.py",
        "def heavy(a, b):\n    if a and b:\n        for i in a:\n            while i:\n                i -= 1\n    return 0\n",
    )]);
    let state = state_for(project.path(), test_config());

    let (status, summary) = call(
        &state,
        "GET",
        "/analyze?top=5",
        Some("viewer-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["file_count"], 1);

    // Gate breach still answers HTTP 200 with pass:false.
    let (status, verdict) = call(
        &state,
        "POST",
        "/ci",
        Some("viewer-token"),
        Some(serde_json::json!({ "fail_on_complexity": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verdict["pass"], false);
    assert_eq!(verdict["gates_exceeded"][0]["gate"], "max_complexity");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simulate_remove_runs_on_latest_graph() {
    let project = project_with(&[
        ("a.py", "import b\n"),
        ("b.py", "import c\n"),
        ("c.py", "x = 1\n"),
    ]);
    let state = state_for(project.path(), test_config());
    let (status, report) = call(
        &state,
        "POST",
        "/simulate/remove",
        Some("viewer-token"),
        Some(serde_json::json!({ "target_type": "file", "path": "b.py" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["risk_score"], "high");
    let impacts = report["impacts"].as_array().expect("impacts");
    assert!(impacts
        .iter()
        .any(|i| i["target"] == "a.py" && i["impact_type"] == "broken_import"));
    assert!(impacts
        .iter()
        .any(|i| i["target"] == "c.py" && i["impact_type"] == "orphaned"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshots_diff_missing_is_404() {
    let project = project_with(&[("a.py", "x = 1\n")]);
    let state = state_for(project.path(), test_config());
    let (status, body) = call(
        &state,
        "GET",
        "/snapshots/diff?id_a=scan-0&id_b=scan-1",
        Some("viewer-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn config_get_redacts_tokens() {
    let project = project_with(&[("a.py", "x = 1\n")]);
    let state = state_for(project.path(), test_config());
    let (status, body) = call(&state, "GET", "/config", Some("viewer-token"), None).await;
    assert_eq!(status, StatusCode::OK);
    for token in body["security"]["tokens"].as_array().expect("tokens") {
        assert_eq!(token["token"], "***");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fs_list_refuses_escape() {
    let project = project_with(&[("src/a.py", "x = 1\n")]);
    let state = state_for(project.path(), test_config());
    let (status, body) = call(
        &state,
        "GET",
        "/fs/list?path=src",
        Some("viewer-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entries"][0]["name"], "a.py");

    let (status, body) = call(
        &state,
        "GET",
        "/fs/list?path=..%2Fsomewhere",
        Some("viewer-token"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn license_status_is_public() {
    let project = project_with(&[("a.py", "x = 1\n")]);
    let state = state_for(project.path(), test_config());
    let (status, body) = call(&state, "GET", "/license/status", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "unknown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scan_emits_started_and_finished_events() {
    let project = project_with(&[("a.py", "def f():\n    pass\n")]);
    let state = state_for(project.path(), test_config());
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    state.bus.subscribe(
        &[
            jupiter::events::Topic::ScanStarted,
            jupiter::events::Topic::ScanFinished,
        ],
        Arc::new(move |event| {
            sink.lock().expect("sink").push(event.topic.as_str());
        }),
        true,
    );

    let (status, _body) = call(
        &state,
        "POST",
        "/scan",
        Some("viewer-token"),
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    for _ in 0..100 {
        if seen.lock().expect("sink").len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let order = seen.lock().expect("sink").clone();
    assert_eq!(order, vec!["SCAN_STARTED", "SCAN_FINISHED"]);
}
