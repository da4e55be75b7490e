//! Async job manager: cancellation, progress, timeout, and a per-plugin
//! circuit breaker.
//!
//! State machine: `pending -> running -> (completed | failed |
//! cancelled)`. Cancellation is cooperative (a kill is never attempted);
//! a timeout marks the job `failed` with reason `timeout`. The breaker
//! keeps a sliding window of terminal outcomes per plugin and rejects
//! submissions with `circuit_open` while cooling down, with one
//! half-open probe and exponential reopen.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{JupiterError, Result};
use crate::events::{EventBus, Topic};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Serializable job view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub plugin_id: String,
    pub state: JobState,
    /// 0..=100.
    pub progress: u8,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Handed to handlers for cooperative cancellation and progress.
pub struct JobContext {
    pub job_id: String,
    pub params: serde_json::Value,
    cancel: Arc<AtomicBool>,
    progress: Arc<dyn Fn(u8, &str) + Send + Sync>,
}

impl JobContext {
    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Report progress; events are rate-limited to 4 Hz per job.
    pub fn report_progress(&self, percent: u8, message: &str) {
        (self.progress)(percent.min(100), message);
    }
}

pub type JobHandler =
    Box<dyn FnOnce(JobContext) -> std::result::Result<serde_json::Value, String> + Send + 'static>;

#[derive(Clone, Debug)]
pub struct JobManagerConfig {
    pub max_concurrent: usize,
    pub plugin_max_concurrent: usize,
    /// Sliding window length per plugin.
    pub breaker_window: usize,
    /// Minimum outcomes before the breaker can trip.
    pub breaker_min_outcomes: usize,
    /// Failure ratio above which the breaker opens.
    pub breaker_fail_ratio: f64,
    pub breaker_cooldown: Duration,
    pub breaker_cooldown_cap: Duration,
    /// Terminal jobs are kept this long past `ended_at`.
    pub job_ttl: Duration,
    /// Minimum interval between JOB_PROGRESS events per job.
    pub progress_interval: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            plugin_max_concurrent: 2,
            breaker_window: 20,
            breaker_min_outcomes: 5,
            breaker_fail_ratio: 0.5,
            breaker_cooldown: Duration::from_secs(60),
            breaker_cooldown_cap: Duration::from_secs(600),
            job_ttl: Duration::from_secs(3600),
            progress_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

struct Breaker {
    state: BreakerState,
    /// true = failure; newest at the back.
    window: VecDeque<bool>,
    cooldown: Duration,
}

impl Breaker {
    fn new(base_cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            window: VecDeque::new(),
            cooldown: base_cooldown,
        }
    }
}

struct JobEntry {
    record: JobRecord,
    cancel: Arc<AtomicBool>,
    expires_at: Option<Instant>,
}

pub struct JobManager {
    config: JobManagerConfig,
    bus: Arc<EventBus>,
    jobs: Mutex<HashMap<String, JobEntry>>,
    breakers: Mutex<HashMap<String, Breaker>>,
    global_permits: Arc<Semaphore>,
    plugin_permits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl JobManager {
    pub fn new(config: JobManagerConfig, bus: Arc<EventBus>) -> Arc<Self> {
        let global_permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Arc::new(Self {
            config,
            bus,
            jobs: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            global_permits,
            plugin_permits: Mutex::new(HashMap::new()),
        })
    }

    /// Submit a job. Returns the job id immediately; the job stays
    /// `pending` until a worker slot frees up. Rejects with
    /// `circuit_open` while the plugin's breaker is open.
    pub fn submit(
        self: &Arc<Self>,
        plugin_id: &str,
        params: serde_json::Value,
        timeout: Duration,
        handler: JobHandler,
    ) -> Result<String> {
        self.reap_expired();
        self.check_breaker(plugin_id)?;

        let job_id = Uuid::new_v4().to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        let record = JobRecord {
            job_id: job_id.clone(),
            plugin_id: plugin_id.to_string(),
            state: JobState::Pending,
            progress: 0,
            message: String::new(),
            started_at: None,
            ended_at: None,
            cancel_requested: false,
            result: None,
            error: None,
        };
        self.jobs.lock().expect("jobs lock poisoned").insert(
            job_id.clone(),
            JobEntry {
                record,
                cancel: Arc::clone(&cancel),
                expires_at: None,
            },
        );

        let manager = Arc::clone(self);
        let plugin = plugin_id.to_string();
        let id = job_id.clone();
        let plugin_sem = self.plugin_semaphore(plugin_id);
        let global_sem = Arc::clone(&self.global_permits);
        tokio::spawn(async move {
            let _global = global_sem.acquire_owned().await;
            let _plugin = plugin_sem.acquire_owned().await;
            manager.run_job(&plugin, &id, params, timeout, handler, cancel).await;
        });
        Ok(job_id)
    }

    async fn run_job(
        self: &Arc<Self>,
        plugin_id: &str,
        job_id: &str,
        params: serde_json::Value,
        timeout: Duration,
        handler: JobHandler,
        cancel: Arc<AtomicBool>,
    ) {
        // A cancellation that lands while pending resolves immediately.
        if cancel.load(Ordering::Relaxed) {
            self.finish(plugin_id, job_id, JobState::Cancelled, None, None);
            return;
        }
        self.update(job_id, |record| {
            record.state = JobState::Running;
            record.started_at = Some(Utc::now());
        });
        self.bus.emit(
            Topic::JobStarted,
            serde_json::json!({ "job_id": job_id, "plugin_id": plugin_id }),
        );

        let progress_gate: Mutex<Option<Instant>> = Mutex::new(None);
        let manager = Arc::clone(self);
        let bus = Arc::clone(&self.bus);
        let id_for_progress = job_id.to_string();
        let plugin_for_progress = plugin_id.to_string();
        let interval = self.config.progress_interval;
        let progress: Arc<dyn Fn(u8, &str) + Send + Sync> = Arc::new(move |percent, message| {
            manager.update(&id_for_progress, |record| {
                record.progress = percent;
                record.message = message.to_string();
            });
            let mut gate = progress_gate.lock().expect("gate poisoned");
            let due = gate.map(|last| last.elapsed() >= interval).unwrap_or(true);
            if due {
                *gate = Some(Instant::now());
                bus.emit(
                    Topic::JobProgress,
                    serde_json::json!({
                        "job_id": id_for_progress,
                        "plugin_id": plugin_for_progress,
                        "progress": percent,
                        "message": message,
                    }),
                );
            }
        });

        let context = JobContext {
            job_id: job_id.to_string(),
            params,
            cancel: Arc::clone(&cancel),
            progress,
        };
        let worker = tokio::task::spawn_blocking(move || handler(context));
        let outcome = tokio::time::timeout(timeout, worker).await;

        match outcome {
            Err(_) => {
                // Timeout: flag cancellation for the still-running
                // handler and mark failed(timeout).
                cancel.store(true, Ordering::Relaxed);
                self.finish(
                    plugin_id,
                    job_id,
                    JobState::Failed,
                    None,
                    Some("timeout".to_string()),
                );
            }
            Ok(Err(join_err)) => {
                // Handler panicked.
                self.finish(
                    plugin_id,
                    job_id,
                    JobState::Failed,
                    None,
                    Some(format!("handler panicked: {join_err}")),
                );
            }
            Ok(Ok(Ok(value))) => {
                let state = if cancel.load(Ordering::Relaxed) {
                    JobState::Cancelled
                } else {
                    JobState::Completed
                };
                self.finish(plugin_id, job_id, state, Some(value), None);
            }
            Ok(Ok(Err(message))) => {
                self.finish(plugin_id, job_id, JobState::Failed, None, Some(message));
            }
        }
    }

    fn finish(
        &self,
        plugin_id: &str,
        job_id: &str,
        state: JobState,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let ttl = self.config.job_ttl;
        {
            let mut jobs = self.jobs.lock().expect("jobs lock poisoned");
            if let Some(entry) = jobs.get_mut(job_id) {
                entry.record.state = state;
                entry.record.ended_at = Some(Utc::now());
                entry.record.result = result;
                entry.record.error = error.clone();
                if state == JobState::Completed {
                    entry.record.progress = 100;
                }
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
        // Cancelled jobs don't feed the breaker: a user action is not a
        // plugin failure.
        if state != JobState::Cancelled {
            self.record_outcome(plugin_id, state == JobState::Failed);
        }
        let (topic, payload) = match state {
            JobState::Failed => (
                Topic::JobFailed,
                serde_json::json!({ "job_id": job_id, "plugin_id": plugin_id, "error": error }),
            ),
            _ => (
                Topic::JobCompleted,
                serde_json::json!({ "job_id": job_id, "plugin_id": plugin_id, "state": state }),
            ),
        };
        self.bus.emit(topic, payload);
        debug!(job_id, ?state, "job finished");
    }

    fn update(&self, job_id: &str, apply: impl FnOnce(&mut JobRecord)) {
        let mut jobs = self.jobs.lock().expect("jobs lock poisoned");
        if let Some(entry) = jobs.get_mut(job_id) {
            apply(&mut entry.record);
        }
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs
            .lock()
            .expect("jobs lock poisoned")
            .get(job_id)
            .map(|e| e.record.clone())
    }

    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .jobs
            .lock()
            .expect("jobs lock poisoned")
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        records
    }

    /// Flip `cancel_requested`; the handler returns cooperatively.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("jobs lock poisoned");
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| JupiterError::NotFound(format!("job {job_id}")))?;
        entry.record.cancel_requested = true;
        entry.cancel.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// First non-terminal job for a plugin, if any. Hot reload refuses
    /// while this returns Some (pending included).
    pub fn non_terminal_job(&self, plugin_id: &str) -> Option<String> {
        self.jobs
            .lock()
            .expect("jobs lock poisoned")
            .values()
            .find(|e| e.record.plugin_id == plugin_id && !e.record.state.is_terminal())
            .map(|e| e.record.job_id.clone())
    }

    /// Drop terminal jobs past their TTL.
    pub fn reap_expired(&self) {
        let now = Instant::now();
        self.jobs
            .lock()
            .expect("jobs lock poisoned")
            .retain(|_, entry| entry.expires_at.map(|t| t > now).unwrap_or(true));
    }

    fn plugin_semaphore(&self, plugin_id: &str) -> Arc<Semaphore> {
        let mut permits = self.plugin_permits.lock().expect("permits lock poisoned");
        Arc::clone(permits.entry(plugin_id.to_string()).or_insert_with(|| {
            Arc::new(Semaphore::new(self.config.plugin_max_concurrent.max(1)))
        }))
    }

    fn check_breaker(&self, plugin_id: &str) -> Result<()> {
        let mut breakers = self.breakers.lock().expect("breakers lock poisoned");
        let breaker = breakers
            .entry(plugin_id.to_string())
            .or_insert_with(|| Breaker::new(self.config.breaker_cooldown));
        match breaker.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Err(JupiterError::PolicyDenied(format!(
                "circuit_open: probe in flight for plugin {plugin_id}"
            ))),
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    // Cool-down elapsed: admit exactly one probe.
                    breaker.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(JupiterError::PolicyDenied(format!(
                        "circuit_open: plugin {plugin_id} cooling down"
                    )))
                }
            }
        }
    }

    fn record_outcome(&self, plugin_id: &str, failed: bool) {
        let mut breakers = self.breakers.lock().expect("breakers lock poisoned");
        let breaker = breakers
            .entry(plugin_id.to_string())
            .or_insert_with(|| Breaker::new(self.config.breaker_cooldown));

        if matches!(breaker.state, BreakerState::HalfOpen) {
            if failed {
                // Probe failed: reopen with exponential cool-down.
                breaker.cooldown =
                    (breaker.cooldown * 2).min(self.config.breaker_cooldown_cap);
                breaker.state = BreakerState::Open {
                    until: Instant::now() + breaker.cooldown,
                };
                warn!(plugin_id, cooldown = ?breaker.cooldown, "breaker reopened");
            } else {
                breaker.state = BreakerState::Closed;
                breaker.window.clear();
                breaker.cooldown = self.config.breaker_cooldown;
                debug!(plugin_id, "breaker closed after successful probe");
            }
            return;
        }

        breaker.window.push_back(failed);
        while breaker.window.len() > self.config.breaker_window {
            breaker.window.pop_front();
        }
        let outcomes = breaker.window.len();
        let failures = breaker.window.iter().filter(|f| **f).count();
        if outcomes >= self.config.breaker_min_outcomes
            && (failures as f64 / outcomes as f64) > self.config.breaker_fail_ratio
        {
            breaker.state = BreakerState::Open {
                until: Instant::now() + breaker.cooldown,
            };
            warn!(plugin_id, failures, outcomes, "circuit breaker opened");
        }
    }

    /// Wait until a job reaches a terminal state (used by tests and the
    /// project-switch quiesce path).
    pub async fn wait_terminal(&self, job_id: &str, limit: Duration) -> Option<JobRecord> {
        let deadline = Instant::now() + limit;
        loop {
            match self.get(job_id) {
                Some(record) if record.state.is_terminal() => return Some(record),
                Some(_) => {
                    if Instant::now() >= deadline {
                        return self.get(job_id);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                None => return None,
            }
        }
    }

    /// Wait for every job of every plugin to settle; used when switching
    /// the active project.
    pub async fn quiesce(&self, limit: Duration) {
        let deadline = Instant::now() + limit;
        loop {
            let busy = self
                .jobs
                .lock()
                .expect("jobs lock poisoned")
                .values()
                .any(|e| !e.record.state.is_terminal());
            if !busy || Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
