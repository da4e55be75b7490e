//! Restricted command execution with optional dynamic tracing.
//!
//! Policy gates, in order: the `allow_run` flag, the `allowed_commands`
//! whitelist (prefix match on argv[0] or exact match on the full argv),
//! caller role >= admin, license status. Output is streamed to the event
//! bus line by line while the full text is captured for the result.
//! Cancellation delivers SIGTERM, then SIGKILL after a one second grace.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{Role, SecurityConfig};
use crate::error::{JupiterError, Result};
use crate::events::{EventBus, Topic};
use crate::types::CancelToken;

/// Grace between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Captured result of one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_analysis: Option<DynamicTraceResult>,
}

/// Output shape of a dynamic tracer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DynamicTraceResult {
    /// Per-symbol call counts.
    pub calls: HashMap<String, u64>,
    /// Per-symbol cumulative seconds.
    pub times: HashMap<String, f64>,
    /// Observed caller -> callee pairs.
    pub call_graph: Vec<(String, String)>,
}

/// Language-dependent capability wrapping an execution to collect call
/// counts and timings. Implementations must not panic through the
/// runner; panics are contained and yield `None`.
pub trait DynamicTracer: Send + Sync {
    fn trace(&self, execution: &CommandResult) -> DynamicTraceResult;
}

/// Default tracer: no instrumentation available, empty result.
pub struct NoopTracer;

impl DynamicTracer for NoopTracer {
    fn trace(&self, _execution: &CommandResult) -> DynamicTraceResult {
        DynamicTraceResult::default()
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RunRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub with_dynamic: bool,
    #[serde(default)]
    pub env_overrides: HashMap<String, String>,
}

pub struct Runner {
    bus: Arc<EventBus>,
    tracer: Arc<dyn DynamicTracer>,
}

impl Runner {
    pub fn new(bus: Arc<EventBus>, tracer: Arc<dyn DynamicTracer>) -> Self {
        Self { bus, tracer }
    }

    /// Check the §policy gates without executing. Refusals are
    /// synchronous and typed.
    pub fn check_policy(
        security: &SecurityConfig,
        request: &RunRequest,
        role: Role,
        license_valid: bool,
    ) -> Result<()> {
        if !security.allow_run {
            return Err(JupiterError::PolicyDenied(
                "run disabled by policy (security.allow_run)".to_string(),
            ));
        }
        if request.command.is_empty() {
            return Err(JupiterError::Validation("empty command".to_string()));
        }
        let argv0 = &request.command[0];
        let joined = request.command.join(" ");
        let allowed = security
            .allowed_commands
            .iter()
            .any(|entry| argv0.starts_with(entry) || joined == *entry);
        if !allowed {
            return Err(JupiterError::PolicyDenied(format!(
                "command not whitelisted: {argv0}"
            )));
        }
        if role < Role::Admin {
            return Err(JupiterError::Auth("run requires admin role".to_string()));
        }
        if !license_valid {
            return Err(JupiterError::License(
                "license does not permit run".to_string(),
            ));
        }
        Ok(())
    }

    /// Execute a whitelisted command. Callers run [`Self::check_policy`]
    /// first; this re-checks nothing and assumes an authorized caller.
    pub async fn run(
        &self,
        request: &RunRequest,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<CommandResult> {
        let argv0 = request
            .command
            .first()
            .ok_or_else(|| JupiterError::Validation("empty command".to_string()))?;

        self.bus.emit(
            Topic::RunStarted,
            serde_json::json!({ "command": request.command }),
        );

        let mut child = Command::new(argv0)
            .args(&request.command[1..])
            .envs(&request.env_overrides)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| JupiterError::Validation(format!("spawn {argv0}: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(Self::pump(
            Arc::clone(&self.bus),
            "stdout",
            stdout.map(BufReader::new),
        ));
        let stderr_task = tokio::spawn(Self::pump(
            Arc::clone(&self.bus),
            "stderr",
            stderr.map(BufReader::new),
        ));

        let status = self.wait_with_cancel(&mut child, timeout, cancel).await?;
        let stdout_text = stdout_task.await.unwrap_or_default();
        let stderr_text = stderr_task.await.unwrap_or_default();

        let mut result = CommandResult {
            stdout: stdout_text,
            stderr: stderr_text,
            returncode: status,
            dynamic_analysis: None,
        };

        if request.with_dynamic {
            // The tracer must not raise through the runner.
            let traced = std::panic::catch_unwind(AssertUnwindSafe(|| self.tracer.trace(&result)));
            match traced {
                Ok(trace) => result.dynamic_analysis = Some(trace),
                Err(_) => warn!("dynamic tracer panicked; omitting dynamic analysis"),
            }
        }

        self.bus.emit(
            Topic::RunFinished,
            serde_json::json!({
                "command": request.command,
                "returncode": result.returncode,
            }),
        );
        Ok(result)
    }

    /// Forward one output stream to the bus line by line while capturing
    /// the full text.
    async fn pump(
        bus: Arc<EventBus>,
        stream: &'static str,
        reader: Option<BufReader<impl tokio::io::AsyncRead + Unpin>>,
    ) -> String {
        let Some(reader) = reader else {
            return String::new();
        };
        let mut captured = String::new();
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            bus.emit(
                Topic::PluginNotification,
                serde_json::json!({ "source": "runner", "stream": stream, "line": line }),
            );
            captured.push_str(&line);
            captured.push('\n');
        }
        captured
    }

    async fn wait_with_cancel(
        &self,
        child: &mut tokio::process::Child,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<i32> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status.map_err(|e| JupiterError::Internal(e.to_string()))?;
                    return Ok(status.code().unwrap_or(-1));
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {
                    if cancel.is_cancelled() || tokio::time::Instant::now() >= deadline {
                        debug!("terminating child process");
                        terminate(child).await;
                        let status = child.wait().await
                            .map_err(|e| JupiterError::Internal(e.to_string()))?;
                        return Ok(status.code().unwrap_or(-1));
                    }
                }
            }
        }
    }
}

/// SIGTERM first; SIGKILL if the child is still alive after the grace.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            let grace = tokio::time::timeout(KILL_GRACE, child.wait()).await;
            if grace.is_ok() {
                return;
            }
        }
    }
    let _ = child.kill().await;
}
