//! Adapter for the external licensing service.
//!
//! Polls the service with a short timeout and derives a status:
//! `unknown -> (valid | invalid | network_error | config_error)`; any
//! state returns to `valid` on a successful recheck; `valid` degrades
//! through `grace` to `invalid` when rechecks keep failing past the
//! grace window. Checking never blocks process startup: the poller is a
//! background task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LicenseConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Unknown,
    Valid,
    Grace,
    Invalid,
    NetworkError,
    ConfigError,
}

/// Current adapter state, exposed at `/license/status`.
#[derive(Clone, Debug, Serialize)]
pub struct LicenseState {
    pub status: LicenseStatus,
    pub detail: String,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

impl Default for LicenseState {
    fn default() -> Self {
        Self {
            status: LicenseStatus::Unknown,
            detail: "not yet checked".to_string(),
            last_checked: None,
            last_success: None,
        }
    }
}

/// Expected response body from the licensing service.
#[derive(Debug, Deserialize)]
struct LicenseResponse {
    #[serde(default)]
    authorized: bool,
    #[serde(default)]
    device_type: String,
    #[serde(default)]
    tokens: i64,
}

/// Outcome of one poll, before state folding.
enum CheckResult {
    Accepted,
    Rejected(String),
    Network(String),
    Config(String),
}

pub struct LicenseAdapter {
    config: LicenseConfig,
    client: reqwest::Client,
    state: Mutex<LicenseState>,
}

impl LicenseAdapter {
    pub fn new(config: LicenseConfig) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            config,
            client,
            state: Mutex::new(LicenseState::default()),
        })
    }

    pub fn status(&self) -> LicenseState {
        self.state.lock().expect("license state poisoned").clone()
    }

    /// Whether privileged features are admitted right now. A deployment
    /// with no licensing service configured is not gated.
    pub fn permits_privileged(&self) -> bool {
        if self.config.base_url.trim().is_empty() {
            return true;
        }
        matches!(
            self.status().status,
            LicenseStatus::Valid | LicenseStatus::Grace
        )
    }

    /// One poll against the service; folds the outcome into the state
    /// machine and returns the new state.
    pub async fn refresh(&self) -> LicenseState {
        let result = self.check().await;
        let mut state = self.state.lock().expect("license state poisoned");
        let now = Utc::now();
        state.last_checked = Some(now);
        match result {
            CheckResult::Accepted => {
                state.status = LicenseStatus::Valid;
                state.detail = "authorized".to_string();
                state.last_success = Some(now);
            }
            CheckResult::Rejected(detail) => {
                state.status = LicenseStatus::Invalid;
                state.detail = detail;
            }
            CheckResult::Config(detail) => {
                state.status = LicenseStatus::ConfigError;
                state.detail = detail;
            }
            CheckResult::Network(detail) => {
                state.status = fold_network_failure(
                    state.last_success,
                    now,
                    self.config.grace_seconds,
                    state.status,
                );
                state.detail = detail;
            }
        }
        debug!(status = ?state.status, "license state updated");
        state.clone()
    }

    async fn check(&self) -> CheckResult {
        let base_url = self.config.base_url.trim();
        if base_url.is_empty() {
            return CheckResult::Config("license.base_url not configured".to_string());
        }
        let request = self
            .client
            .get(base_url)
            .query(&[("device_key", self.config.device_key.as_str())]);
        let response = match request.send().await {
            Ok(r) => r,
            Err(err) => return CheckResult::Network(err.to_string()),
        };
        if !response.status().is_success() {
            return CheckResult::Network(format!("service returned {}", response.status()));
        }
        let body: LicenseResponse = match response.json().await {
            Ok(b) => b,
            Err(err) => return CheckResult::Network(format!("bad response body: {err}")),
        };
        if !body.authorized {
            return CheckResult::Rejected("service says not authorized".to_string());
        }
        if body.device_type != self.config.device_type {
            return CheckResult::Rejected(format!(
                "unexpected device type: {}",
                body.device_type
            ));
        }
        if body.tokens <= 0 {
            return CheckResult::Rejected("no tokens left".to_string());
        }
        CheckResult::Accepted
    }

    /// Background poller; never blocks startup.
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let state = adapter.refresh().await;
                if state.status == LicenseStatus::Invalid {
                    warn!(detail = %state.detail, "license invalid; gated features refused");
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}

/// Fold a network failure into the state machine: stay in grace while
/// the last success is recent enough, otherwise degrade.
fn fold_network_failure(
    last_success: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace_seconds: u64,
    _current: LicenseStatus,
) -> LicenseStatus {
    match last_success {
        Some(success) => {
            let age = now.signed_duration_since(success);
            if age.num_seconds() <= grace_seconds as i64 {
                LicenseStatus::Grace
            } else {
                LicenseStatus::Invalid
            }
        }
        None => LicenseStatus::NetworkError,
    }
}
