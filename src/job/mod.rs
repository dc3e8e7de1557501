//! The polymorphic Job model: a closed sum of five
//! variants sharing a common header, dispatched at the variant boundary
//! rather than through deep inheritance.

pub mod schedule;
pub mod variants;

pub use schedule::JobSchedule;
pub use variants::compose::ComposeJob;
pub use variants::exec::ExecJob;
pub use variants::local::LocalJob;
pub use variants::run::RunJob;
pub use variants::service::ServiceJob;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;
use crate::execution::{Execution, HistoryRing};
use crate::pipeline::{JobRunnable, RetryPolicy};

/// Which configuration producer owns a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceTag {
    File,
    Label,
    Api,
}

impl SourceTag {
    /// File outranks label; any other pairing (including Api, which is
    /// not ordered against the others by spec) is a no-op with a warning
    /// at the call site.
    pub fn outranks(self, other: SourceTag) -> bool {
        matches!((self, other), (SourceTag::File, SourceTag::Label))
    }
}

/// Fields shared by every job variant.
#[derive(Debug, Clone)]
pub struct JobHeader {
    pub name: String,
    pub schedule: JobSchedule,
    pub retry: RetryPolicy,
    pub no_overlap: bool,
    pub dependencies: Vec<String>,
    pub on_success: Vec<String>,
    pub on_failure: Vec<String>,
    pub history_limit: usize,
    pub max_runtime: Option<Duration>,
    pub source: SourceTag,
}

impl JobHeader {
    pub fn new(name: impl Into<String>, schedule: JobSchedule, source: SourceTag) -> Self {
        JobHeader {
            name: name.into(),
            schedule,
            retry: RetryPolicy::default(),
            no_overlap: false,
            dependencies: Vec::new(),
            on_success: Vec::new(),
            on_failure: Vec::new(),
            history_limit: crate::execution::DEFAULT_HISTORY_LIMIT,
            max_runtime: None,
            source,
        }
    }
}

/// The closed sum of job variants.
pub enum JobKind {
    Exec(ExecJob),
    Run(RunJob),
    Service(ServiceJob),
    Local(LocalJob),
    Compose(ComposeJob),
}

impl JobKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::Exec(_) => "job-exec",
            JobKind::Run(_) => "job-run",
            JobKind::Service(_) => "job-service-run",
            JobKind::Local(_) => "job-local",
            JobKind::Compose(_) => "job-compose",
        }
    }

    fn content_hash(&self, hasher: &mut DefaultHasher) {
        match self {
            JobKind::Exec(j) => j.hash(hasher),
            JobKind::Run(j) => j.hash(hasher),
            JobKind::Service(j) => j.hash(hasher),
            JobKind::Local(j) => j.hash(hasher),
            JobKind::Compose(j) => j.hash(hasher),
        }
    }
}

/// A scheduled unit of work: a header shared by all variants plus the
/// variant-specific payload, a bounded history ring, and the running
/// counter that is the sole authority for overlap decisions.
pub struct Job {
    pub header: JobHeader,
    pub kind: JobKind,
    pub history: AsyncMutex<HistoryRing>,
    pub running: Arc<AtomicU32>,
}

impl Job {
    pub fn new(header: JobHeader, kind: JobKind) -> Self {
        let history = AsyncMutex::new(HistoryRing::new(header.history_limit));
        Job {
            header,
            kind,
            history,
            running: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Builds a fresh `Job` that shares this one's running counter (the
    /// very same atomic, so an in-flight Execution created under the old
    /// job still balances correctly) and takes over its history ring
    /// contents, for `UpdateJob`'s atomic swap.
    pub async fn with_transferred_state(header: JobHeader, kind: JobKind, previous: &Job) -> Self {
        let history_limit = header.history_limit;
        let mut ring = HistoryRing::new(history_limit);
        {
            let mut old = previous.history.lock().await;
            let old_limit = old.limit();
            let drained = std::mem::replace(&mut *old, HistoryRing::new(old_limit));
            for entry in drained.into_entries() {
                ring.push(entry);
            }
        }
        Job {
            header,
            kind,
            history: AsyncMutex::new(ring),
            running: previous.running.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// Changes iff any field influencing behavior changes; used by the
    /// Reconciler to detect no-op reconciles.
    pub fn content_hash(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.header.name.hash(&mut h);
        self.header.schedule.to_string().hash(&mut h);
        self.header.retry.max_retries.hash(&mut h);
        self.header.retry.retry_delay_ms.hash(&mut h);
        self.header.retry.retry_exponential.hash(&mut h);
        self.header.retry.retry_max_delay_ms.hash(&mut h);
        self.header.no_overlap.hash(&mut h);
        self.header.dependencies.hash(&mut h);
        self.header.on_success.hash(&mut h);
        self.header.on_failure.hash(&mut h);
        self.header.max_runtime.hash(&mut h);
        self.kind.content_hash(&mut h);
        h.finish()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::Acquire) > 0
    }
}

#[async_trait]
impl JobRunnable for Job {
    async fn run(&self, exec: &mut Execution, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        match &self.kind {
            JobKind::Exec(j) => j.run(exec, cancel).await,
            JobKind::Run(j) => j.run(exec, cancel).await,
            JobKind::Service(j) => j.run(exec, cancel).await,
            JobKind::Local(j) => j.run(exec, cancel).await,
            JobKind::Compose(j) => j.run(exec, cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn header(name: &str) -> JobHeader {
        JobHeader::new(name, JobSchedule::from_str("@every 1s").unwrap(), SourceTag::File)
    }

    #[test]
    fn content_hash_changes_with_schedule() {
        let mut h1 = header("a");
        let kind = || JobKind::Local(LocalJob::new("echo hi".into(), None, vec![]));
        let job1 = Job::new(h1.clone(), kind());
        h1.schedule = JobSchedule::from_str("@every 5s").unwrap();
        let job2 = Job::new(h1, kind());
        assert_ne!(job1.content_hash(), job2.content_hash());
    }

    #[test]
    fn content_hash_stable_for_identical_jobs() {
        let h = header("a");
        let job1 = Job::new(h.clone(), JobKind::Local(LocalJob::new("echo hi".into(), None, vec![])));
        let job2 = Job::new(h, JobKind::Local(LocalJob::new("echo hi".into(), None, vec![])));
        assert_eq!(job1.content_hash(), job2.content_hash());
    }

    #[test]
    fn file_outranks_label() {
        assert!(SourceTag::File.outranks(SourceTag::Label));
        assert!(!SourceTag::Label.outranks(SourceTag::File));
        assert!(!SourceTag::Api.outranks(SourceTag::File));
    }
}
