//! Drives one fire event through the middleware chain: overlap guard,
//! retries, cancellation, and terminal notification.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::middleware::{ExecutionContext, Middleware};
use super::retry::RetryPolicy;
use crate::error::RuntimeError;
use crate::execution::{Execution, Outcome};
use crate::metrics;

/// The shared `Run(ctx)` contract every job variant implements.
#[async_trait]
pub trait JobRunnable: Send + Sync {
    async fn run(&self, exec: &mut Execution, cancel: &CancellationToken) -> Result<(), RuntimeError>;
}

/// Backwards-compatible alias kept for call sites that only need the
/// trait object form.
pub type JobRunFn = Arc<dyn JobRunnable>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Success,
    Failed,
    Skipped,
}

impl From<Outcome> for PipelineOutcome {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Success => PipelineOutcome::Success,
            Outcome::Failed => PipelineOutcome::Failed,
            Outcome::Skipped => PipelineOutcome::Skipped,
            Outcome::Running => unreachable!("pipeline must reach a terminal outcome"),
        }
    }
}

pub struct PipelineRunner {
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub retry: RetryPolicy,
    pub max_runtime: Option<Duration>,
}

impl PipelineRunner {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>, retry: RetryPolicy) -> Self {
        PipelineRunner {
            middlewares,
            retry,
            max_runtime: None,
        }
    }

    pub fn with_max_runtime(mut self, d: Option<Duration>) -> Self {
        self.max_runtime = d;
        self
    }

    /// Runs one fire event to completion (including retries) and returns
    /// the resulting Execution, already released to its history snapshot
    /// form.
    pub async fn run(
        &self,
        ctx: &ExecutionContext,
        job: &dyn JobRunnable,
        cancel: &CancellationToken,
    ) -> (Execution, PipelineOutcome) {
        let mut exec = Execution::new(ctx.job_name.clone());

        for mw in &self.middlewares {
            if !mw.before(ctx).await {
                exec.mark_skipped();
                metrics::global().record_skip();
                self.run_after_hooks(ctx, &exec).await;
                return (exec, PipelineOutcome::Skipped);
            }
        }

        metrics::global().record_start();
        ctx.running.fetch_add(1, Ordering::AcqRel);

        'attempts: loop {
            if cancel.is_cancelled() {
                exec.mark_failed(RuntimeError::Cancelled);
                break 'attempts;
            }

            let attempt_result = match self.max_runtime {
                Some(d) => match tokio::time::timeout(d, job.run(&mut exec, cancel)).await {
                    Ok(r) => r,
                    Err(_) => Err(RuntimeError::MaxTimeRunning),
                },
                None => job.run(&mut exec, cancel).await,
            };

            match attempt_result {
                Ok(()) => {
                    exec.mark_success();
                    break 'attempts;
                }
                Err(e) if cancel.is_cancelled() && !matches!(e, RuntimeError::Cancelled) => {
                    exec.mark_failed(RuntimeError::Cancelled);
                    break 'attempts;
                }
                Err(e) => {
                    let retryable = e.is_retryable(self.retry.max_retries)
                        && self.retry.should_retry(exec.attempt);
                    if !retryable {
                        exec.mark_failed(e);
                        break 'attempts;
                    }
                    metrics::global().record_retry();
                    let delay = self.retry.delay_ms(exec.attempt);
                    debug!(job = %ctx.job_name, attempt = exec.attempt, delay_ms = delay, "retrying after failure");
                    exec.attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        _ = cancel.cancelled() => {
                            exec.mark_failed(RuntimeError::Cancelled);
                            break 'attempts;
                        }
                    }
                }
            }
        }

        ctx.running.fetch_sub(1, Ordering::AcqRel);
        metrics::global().record_stop();
        match exec.outcome {
            Outcome::Success => metrics::global().record_success(),
            Outcome::Failed => metrics::global().record_failure(),
            _ => {}
        }
        exec.release_buffers();

        self.run_after_hooks(ctx, &exec).await;
        let outcome = PipelineOutcome::from(exec.outcome);
        (exec, outcome)
    }

    async fn run_after_hooks(&self, ctx: &ExecutionContext, exec: &Execution) {
        // Reverse order on the way out.
        for mw in self.middlewares.iter().rev() {
            if mw.continue_on_applies(exec) {
                mw.after(ctx, exec).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::OverlapGuard;
    use std::sync::atomic::AtomicU32;

    struct AlwaysOk;
    #[async_trait]
    impl JobRunnable for AlwaysOk {
        async fn run(&self, _exec: &mut Execution, _cancel: &CancellationToken) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    struct FailNTimes(std::sync::atomic::AtomicU32, u32);
    #[async_trait]
    impl JobRunnable for FailNTimes {
        async fn run(&self, _exec: &mut Execution, _cancel: &CancellationToken) -> Result<(), RuntimeError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            if n < self.1 {
                Err(RuntimeError::NonZeroExit(1))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn successful_run_has_success_outcome_and_one_attempt() {
        let runner = PipelineRunner::new(vec![], RetryPolicy::default());
        let ctx = ExecutionContext::new("job", Arc::new(AtomicU32::new(0)));
        let cancel = CancellationToken::new();
        let (exec, outcome) = runner.run(&ctx, &AlwaysOk, &cancel).await;
        assert_eq!(outcome, PipelineOutcome::Success);
        assert_eq!(exec.attempt, 1);
    }

    #[tokio::test]
    async fn overlap_guard_skips_when_already_running() {
        let running = Arc::new(AtomicU32::new(1));
        let mut ctx = ExecutionContext::new("job", running.clone());
        ctx.no_overlap = true;
        let runner = PipelineRunner::new(vec![Arc::new(OverlapGuard)], RetryPolicy::default());
        let cancel = CancellationToken::new();
        let (exec, outcome) = runner.run(&ctx, &AlwaysOk, &cancel).await;
        assert_eq!(outcome, PipelineOutcome::Skipped);
        assert!(exec.skipped());
        // Overlap guard never touched the running counter for the skipped fire.
        assert_eq!(running.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn retries_until_success_and_shares_execution_id() {
        let job = FailNTimes(AtomicU32::new(0), 2);
        let retry = RetryPolicy {
            max_retries: 5,
            retry_delay_ms: 1,
            retry_exponential: false,
            retry_max_delay_ms: 1000,
        };
        let runner = PipelineRunner::new(vec![], retry);
        let ctx = ExecutionContext::new("job", Arc::new(AtomicU32::new(0)));
        let cancel = CancellationToken::new();
        let (exec, outcome) = runner.run(&ctx, &job, &cancel).await;
        assert_eq!(outcome, PipelineOutcome::Success);
        assert_eq!(exec.attempt, 3); // failed, failed, succeeded
    }

    #[tokio::test]
    async fn running_counter_returns_to_zero_after_completion() {
        let running = Arc::new(AtomicU32::new(0));
        let ctx = ExecutionContext::new("job", running.clone());
        let runner = PipelineRunner::new(vec![], RetryPolicy::default());
        let cancel = CancellationToken::new();
        runner.run(&ctx, &AlwaysOk, &cancel).await;
        assert_eq!(running.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn exhausting_retries_reports_failure() {
        let job = FailNTimes(AtomicU32::new(0), 100);
        let retry = RetryPolicy {
            max_retries: 2,
            retry_delay_ms: 1,
            retry_exponential: false,
            retry_max_delay_ms: 1000,
        };
        let runner = PipelineRunner::new(vec![], retry);
        let ctx = ExecutionContext::new("job", Arc::new(AtomicU32::new(0)));
        let cancel = CancellationToken::new();
        let (exec, outcome) = runner.run(&ctx, &job, &cancel).await;
        assert_eq!(outcome, PipelineOutcome::Failed);
        assert_eq!(exec.attempt, 3);
    }
}
