//! A `JobSource` backed by a caller-supplied map rather than a live
//! discovery mechanism — the seam an external file-format parser plugs
//! into, and the seam the test suite uses to drive the Reconciler
//! deterministically.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DesiredJob, JobSource};
use crate::error::SourceError;
use crate::job::SourceTag;

pub struct StaticSource {
    tag: SourceTag,
    jobs: Arc<RwLock<HashMap<String, DesiredJob>>>,
}

impl StaticSource {
    pub fn new(tag: SourceTag, jobs: HashMap<String, DesiredJob>) -> Self {
        StaticSource {
            tag,
            jobs: Arc::new(RwLock::new(jobs)),
        }
    }

    /// Replaces the desired set wholesale; callers (tests, a future API
    /// handler) drive reconciliation by mutating this and re-running the
    /// Reconciler against the same `StaticSource`.
    pub async fn set(&self, jobs: HashMap<String, DesiredJob>) {
        *self.jobs.write().await = jobs;
    }
}

#[async_trait]
impl JobSource for StaticSource {
    fn tag(&self) -> SourceTag {
        self.tag
    }

    async fn discover(&self) -> Result<HashMap<String, DesiredJob>, SourceError> {
        Ok(self.jobs.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::DesiredPayload;

    fn job(command: &str) -> DesiredJob {
        DesiredJob {
            schedule: "@every 1s".into(),
            max_retries: 0,
            retry_delay_ms: 0,
            retry_exponential: false,
            retry_max_delay_ms: 0,
            no_overlap: false,
            on_success: vec![],
            on_failure: vec![],
            history_limit: 10,
            max_runtime: None,
            payload: DesiredPayload::Local {
                command: command.into(),
                working_dir: None,
                env: vec![],
            },
        }
    }

    #[tokio::test]
    async fn discover_reflects_latest_set() {
        let mut initial = HashMap::new();
        initial.insert("a".to_string(), job("echo 1"));
        let source = StaticSource::new(SourceTag::File, initial);

        let discovered = source.discover().await.unwrap();
        assert_eq!(discovered.len(), 1);

        let mut updated = HashMap::new();
        updated.insert("b".to_string(), job("echo 2"));
        source.set(updated).await;

        let discovered = source.discover().await.unwrap();
        assert!(discovered.contains_key("b"));
        assert!(!discovered.contains_key("a"));
    }
}
