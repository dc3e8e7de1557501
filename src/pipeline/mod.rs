//! The Execution Pipeline: turns a fire event into an
//! [`Execution`] record, enforcing overlap policy, retries, cancellation,
//! output capture and notification via an ordered middleware chain.

mod middleware;
mod retry;
mod runner;

pub use middleware::{
    ContinueOn, ExecutionContext, Middleware, NotifyConfig, OverlapGuard, SaveMiddleware,
    SlackNotifyMiddleware,
};
pub use retry::RetryPolicy;
pub use runner::{JobRunFn, JobRunnable, PipelineOutcome, PipelineRunner};
