//! Run-new-container: launches a fresh container for each fire, waits
//! for it to exit, and removes it unless `delete=false`.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::RuntimeError;
use crate::event_watcher::{EventWatcher, wait_for_container_exit};
use crate::execution::Execution;
use crate::pipeline::JobRunnable;
use crate::runtime::{ContainerSpec, RuntimePort};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PullPolicy {
    Always,
    IfMissing,
}

pub struct RunJob {
    pub image: String,
    pub name_prefix: String,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub volumes: Vec<(String, String)>,
    pub pull: PullPolicy,
    pub delete: bool,
    pub wait_timeout: Duration,
    pub runtime: Arc<dyn RuntimePort>,
    pub event_watcher: Option<Arc<EventWatcher>>,
}

impl RunJob {
    pub fn new(image: String, name_prefix: String, runtime: Arc<dyn RuntimePort>) -> Self {
        RunJob {
            image,
            name_prefix,
            cmd: None,
            env: Vec::new(),
            working_dir: None,
            volumes: Vec::new(),
            pull: PullPolicy::IfMissing,
            delete: true,
            wait_timeout: Duration::from_secs(30),
            runtime,
            event_watcher: None,
        }
    }
}

impl Hash for RunJob {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.image.hash(state);
        self.name_prefix.hash(state);
        self.cmd.hash(state);
        self.env.hash(state);
        self.working_dir.hash(state);
        self.volumes.hash(state);
        self.pull.hash(state);
        self.delete.hash(state);
        self.wait_timeout.hash(state);
    }
}

#[async_trait]
impl JobRunnable for RunJob {
    async fn run(&self, exec: &mut Execution, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        match self.pull {
            PullPolicy::Always => self.runtime.pull_image(&self.image).await?,
            PullPolicy::IfMissing => {
                if !self.runtime.image_exists(&self.image).await? {
                    self.runtime.pull_image(&self.image).await?;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }

        let spec = ContainerSpec {
            image: self.image.clone(),
            name: Some(format!("{}-{}", self.name_prefix, exec.id)),
            cmd: self.cmd.clone(),
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
            volumes: self.volumes.clone(),
            labels: HashMap::new(),
            network: None,
        };

        let container_id = self.runtime.create_container(&spec).await?;
        let cleanup = |id: String, runtime: Arc<dyn RuntimePort>, delete: bool| async move {
            if delete {
                if let Err(e) = runtime.remove_container(&id, true).await {
                    warn!(container = %id, error = %e, "failed to remove container after run");
                }
            }
        };

        if let Err(e) = self.runtime.start_container(&container_id).await {
            cleanup(container_id.clone(), self.runtime.clone(), self.delete).await;
            return Err(e);
        }

        let wait_result = tokio::select! {
            res = self.wait_for_exit(&container_id) => res,
            _ = cancel.cancelled() => {
                let _ = self.runtime.stop_container(&container_id, Some(Duration::from_secs(5))).await;
                Err(RuntimeError::Cancelled)
            }
        };

        let (stdout, stderr) = exec.stdout_stderr_mut();
        if let Err(e) = self.runtime.copy_logs(&container_id, stdout, stderr).await {
            warn!(container = %container_id, error = %e, "failed to fetch logs");
        }

        cleanup(container_id.clone(), self.runtime.clone(), self.delete).await;

        match wait_result {
            Ok(0) => Ok(()),
            Ok(code) => Err(RuntimeError::NonZeroExit(code)),
            Err(e) => Err(e),
        }
    }
}

impl RunJob {
    async fn wait_for_exit(&self, container_id: &str) -> Result<i64, RuntimeError> {
        match &self.event_watcher {
            Some(watcher) => {
                wait_for_container_exit(watcher, self.runtime.as_ref(), container_id, self.wait_timeout).await
            }
            None => self.runtime.wait_container(container_id).await,
        }
    }
}
