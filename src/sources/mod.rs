//! Desired-state producers: a `JobSource` yields a named
//! set of [`DesiredJob`]s, tagged with the [`SourceTag`] that owns them.
//! The Reconciler diffs this against the Scheduler's current state; no
//! source ever touches the Scheduler directly.

mod label;
mod static_source;

pub use label::LabelSource;
pub use static_source::StaticSource;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SourceError;
use crate::job::SourceTag;
use crate::job::variants::run::PullPolicy;

/// A variant-agnostic description of a job as discovered by a source,
/// carrying enough information for the Reconciler to build a runnable
/// [`crate::job::Job`] once paired with a live `RuntimePort`.
#[derive(Debug, Clone, Hash)]
pub struct DesiredJob {
    pub schedule: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_exponential: bool,
    pub retry_max_delay_ms: u64,
    pub no_overlap: bool,
    pub on_success: Vec<String>,
    pub on_failure: Vec<String>,
    pub history_limit: usize,
    pub max_runtime: Option<Duration>,
    pub payload: DesiredPayload,
}

#[derive(Debug, Clone, Hash)]
pub enum DesiredPayload {
    Exec {
        container_id: String,
        container_name: String,
        command: String,
        env: Vec<String>,
        tty: bool,
    },
    Run {
        image: String,
        name_prefix: String,
        cmd: Option<Vec<String>>,
        env: Vec<String>,
        working_dir: Option<String>,
        volumes: Vec<(String, String)>,
        pull: PullPolicy,
        delete: bool,
        wait_timeout: Duration,
    },
    Service {
        image: String,
        name_prefix: String,
        cmd: Option<Vec<String>>,
        env: Vec<String>,
        deadline: Duration,
    },
    Local {
        command: String,
        working_dir: Option<String>,
        env: Vec<(String, String)>,
    },
    Compose {
        file: String,
        service: String,
        command: String,
    },
}

/// A desired-state producer. `LabelSource` reads container labels;
/// `StaticSource` wraps a caller- or test-supplied map and is the seam an
/// external file-format parser (out of scope) would plug into.
#[async_trait]
pub trait JobSource: Send + Sync {
    fn tag(&self) -> SourceTag;
    async fn discover(&self) -> Result<HashMap<String, DesiredJob>, SourceError>;
}
