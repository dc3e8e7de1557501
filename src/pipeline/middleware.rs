//! Middleware decorators around a job's `Run`: a linear, order-preserving
//! chain that may short-circuit (overlap guard) or observe terminal state
//! (save, notify).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::execution::Execution;

/// Which terminal states a middleware's [`Middleware::after`] should fire
/// for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueOn {
    Always,
    OnSuccess,
    OnFailure,
}

impl ContinueOn {
    pub(crate) fn applies(self, exec: &Execution) -> bool {
        match self {
            ContinueOn::Always => true,
            ContinueOn::OnSuccess => exec.outcome == crate::execution::Outcome::Success,
            ContinueOn::OnFailure => exec.outcome == crate::execution::Outcome::Failed,
        }
    }
}

/// Per-invocation context threaded through the middleware chain. Carries
/// only what middlewares need, so the pipeline module has no dependency
/// on the concrete `Job` type.
pub struct ExecutionContext {
    pub job_name: String,
    pub no_overlap: bool,
    pub running: Arc<std::sync::atomic::AtomicU32>,
    pub save_folder: Option<PathBuf>,
    pub notify: NotifyConfig,
}

impl ExecutionContext {
    pub fn new(job_name: impl Into<String>, running: Arc<std::sync::atomic::AtomicU32>) -> Self {
        ExecutionContext {
            job_name: job_name.into(),
            no_overlap: false,
            running,
            save_folder: None,
            notify: NotifyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NotifyConfig {
    pub slack_webhook: Option<String>,
    pub mail_to: Option<String>,
    pub cooldown: Duration,
}

/// A decorator around a job's execution.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Which terminal outcomes `after` should run for.
    fn continue_on(&self) -> ContinueOn {
        ContinueOn::Always
    }

    /// Called before the job variant runs. Returning `false` short-circuits
    /// the chain and marks the Execution `Skipped` (only the overlap guard
    /// does this; every other middleware returns `true`).
    async fn before(&self, _ctx: &ExecutionContext) -> bool {
        true
    }

    /// Called after the job variant has reached a terminal state.
    async fn after(&self, ctx: &ExecutionContext, exec: &Execution) {
        let _ = (ctx, exec);
    }

    fn name(&self) -> &'static str;

    /// Whether `after` should be invoked for this Execution's outcome.
    fn continue_on_applies(&self, exec: &Execution) -> bool {
        self.continue_on().applies(exec)
    }
}

/// Refuses to start a second concurrent Execution when `no_overlap` is set.
pub struct OverlapGuard;

#[async_trait]
impl Middleware for OverlapGuard {
    async fn before(&self, ctx: &ExecutionContext) -> bool {
        if !ctx.no_overlap {
            return true;
        }
        let running = ctx.running.load(std::sync::atomic::Ordering::Acquire);
        if running > 0 {
            info!(job = %ctx.job_name, running, "skipping fire: no-overlap and job already running");
            false
        } else {
            true
        }
    }

    fn name(&self) -> &'static str {
        "overlap-guard"
    }
}

/// Persists stdout/stderr and a JSON record per execution
/// "Persisted state".
pub struct SaveMiddleware;

#[derive(Serialize)]
struct SaveRecord<'a> {
    job_name: &'a str,
    execution_id: uuid::Uuid,
    start_time: chrono::DateTime<chrono::Utc>,
    duration_ms: Option<u128>,
    outcome: &'a str,
    attempt: u32,
    exit_code: Option<i64>,
    error: Option<String>,
}

#[async_trait]
impl Middleware for SaveMiddleware {
    fn continue_on(&self) -> ContinueOn {
        ContinueOn::Always
    }

    async fn after(&self, ctx: &ExecutionContext, exec: &Execution) {
        let Some(folder) = &ctx.save_folder else {
            return;
        };
        if let Err(e) = tokio::fs::create_dir_all(folder).await {
            error!(job = %ctx.job_name, error = %e, "save middleware: failed to create save folder");
            return;
        }
        let stem = format!("{}_{}", ctx.job_name, exec.id);
        let record = SaveRecord {
            job_name: &ctx.job_name,
            execution_id: exec.id,
            start_time: exec.start_time,
            duration_ms: exec.duration.map(|d| d.as_millis()),
            outcome: match exec.outcome {
                crate::execution::Outcome::Success => "success",
                crate::execution::Outcome::Failed => "failed",
                crate::execution::Outcome::Skipped => "skipped",
                crate::execution::Outcome::Running => "running",
            },
            attempt: exec.attempt,
            exit_code: exec.exit_code,
            error: exec.error.as_ref().map(|e| e.to_string()),
        };

        if let Err(e) = write_file(folder, &format!("{stem}.stdout"), exec.stdout_snapshot()).await
        {
            warn!(job = %ctx.job_name, error = %e, "save middleware: stdout write failed");
        }
        if let Err(e) = write_file(folder, &format!("{stem}.stderr"), exec.stderr_snapshot()).await
        {
            warn!(job = %ctx.job_name, error = %e, "save middleware: stderr write failed");
        }
        match serde_json::to_vec_pretty(&record) {
            Ok(bytes) => {
                let path = folder.join(format!("{stem}.json"));
                if let Err(e) = tokio::fs::write(&path, &bytes).await {
                    warn!(job = %ctx.job_name, error = %e, "save middleware: json write failed");
                }
            }
            Err(e) => warn!(job = %ctx.job_name, error = %e, "save middleware: json encode failed"),
        }
    }

    fn name(&self) -> &'static str {
        "save"
    }
}

async fn write_file(folder: &std::path::Path, name: &str, contents: &str) -> std::io::Result<()> {
    let path = folder.join(name);
    let mut f = tokio::fs::File::create(&path).await?;
    f.write_all(contents.as_bytes()).await
}

/// Delivers a Slack webhook notification on failure, deduplicated within
/// a cooldown window per job.
pub struct SlackNotifyMiddleware {
    http: reqwest::Client,
    last_notified: DashMap<String, Instant>,
}

impl Default for SlackNotifyMiddleware {
    fn default() -> Self {
        SlackNotifyMiddleware {
            http: reqwest::Client::new(),
            last_notified: DashMap::new(),
        }
    }
}

#[async_trait]
impl Middleware for SlackNotifyMiddleware {
    fn continue_on(&self) -> ContinueOn {
        ContinueOn::OnFailure
    }

    async fn after(&self, ctx: &ExecutionContext, exec: &Execution) {
        let Some(webhook) = &ctx.notify.slack_webhook else {
            return;
        };
        if let Some(last) = self.last_notified.get(&ctx.job_name) {
            if last.elapsed() < ctx.notify.cooldown {
                return;
            }
        }
        let text = format!(
            "ofelia: job `{}` failed (attempt {}): {}",
            ctx.job_name,
            exec.attempt,
            exec.error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default()
        );
        let body = serde_json::json!({ "text": text });
        let sent = tokio::time::timeout(
            Duration::from_secs(5),
            self.http.post(webhook).json(&body).send(),
        )
        .await;
        match sent {
            Ok(Ok(resp)) if resp.status().is_success() => {
                self.last_notified.insert(ctx.job_name.clone(), Instant::now());
            }
            Ok(Ok(resp)) => {
                warn!(job = %ctx.job_name, status = %resp.status(), "slack notification rejected");
            }
            Ok(Err(e)) => warn!(job = %ctx.job_name, error = %e, "slack notification failed"),
            Err(_) => warn!(job = %ctx.job_name, "slack notification timed out"),
        }
    }

    fn name(&self) -> &'static str {
        "notify-slack"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Execution;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn overlap_guard_blocks_when_running() {
        let running = Arc::new(AtomicU32::new(1));
        let mut ctx = ExecutionContext::new("job", running);
        ctx.no_overlap = true;
        let guard = OverlapGuard;
        assert!(!guard.before(&ctx).await);
    }

    #[tokio::test]
    async fn overlap_guard_allows_when_idle() {
        let running = Arc::new(AtomicU32::new(0));
        let mut ctx = ExecutionContext::new("job", running);
        ctx.no_overlap = true;
        let guard = OverlapGuard;
        assert!(guard.before(&ctx).await);
    }

    #[tokio::test]
    async fn overlap_guard_ignores_running_count_when_allowed() {
        let running = Arc::new(AtomicU32::new(5));
        let ctx = ExecutionContext::new("job", running);
        let guard = OverlapGuard;
        assert!(guard.before(&ctx).await);
    }

    #[tokio::test]
    async fn slack_notify_skips_without_webhook() {
        let running = Arc::new(AtomicU32::new(0));
        let ctx = ExecutionContext::new("job", running);
        let mut exec = Execution::new("job");
        exec.mark_failed(crate::error::RuntimeError::NonZeroExit(1));
        let mw = SlackNotifyMiddleware::default();
        mw.after(&ctx, &exec).await; // must not panic without a webhook
    }

    #[test]
    fn continue_on_failure_only_applies_to_failed() {
        let mut exec = Execution::new("job");
        exec.mark_success();
        assert!(!ContinueOn::OnFailure.applies(&exec));
        let mut exec2 = Execution::new("job");
        exec2.mark_failed(crate::error::RuntimeError::NonZeroExit(1));
        assert!(ContinueOn::OnFailure.applies(&exec2));
    }
}
