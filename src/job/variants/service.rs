//! Run-swarm-service: creates a one-shot Swarm service, waits for all of
//! its tasks to reach a terminal state, and removes it.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::RuntimeError;
use crate::execution::Execution;
use crate::pipeline::JobRunnable;
use crate::runtime::{RuntimePort, ServiceSpec, TaskState};

pub struct ServiceJob {
    pub image: String,
    pub name_prefix: String,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub deadline: Duration,
    pub runtime: Arc<dyn RuntimePort>,
}

impl ServiceJob {
    pub fn new(image: String, name_prefix: String, runtime: Arc<dyn RuntimePort>) -> Self {
        ServiceJob {
            image,
            name_prefix,
            cmd: None,
            env: Vec::new(),
            deadline: Duration::from_secs(60),
            runtime,
        }
    }
}

impl Hash for ServiceJob {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.image.hash(state);
        self.name_prefix.hash(state);
        self.cmd.hash(state);
        self.env.hash(state);
        self.deadline.hash(state);
    }
}

#[async_trait]
impl JobRunnable for ServiceJob {
    async fn run(&self, exec: &mut Execution, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        let spec = ServiceSpec {
            name: format!("{}-{}", self.name_prefix, exec.id),
            image: self.image.clone(),
            cmd: self.cmd.clone(),
            env: self.env.clone(),
            replicas: 1,
        };

        let service_id = self.runtime.create_service(&spec).await?;
        let deadline = Instant::now() + self.deadline;

        let outcome = loop {
            if cancel.is_cancelled() {
                break Err(RuntimeError::Cancelled);
            }
            if Instant::now() >= deadline {
                break Err(RuntimeError::MaxTimeRunning);
            }

            let tasks = self.runtime.list_service_tasks(&service_id).await?;
            if !tasks.is_empty() && tasks.iter().all(|t| t.state.is_terminal()) {
                let worst_exit = tasks.iter().filter_map(|t| t.exit_code).max().unwrap_or(0);
                let any_failed = tasks.iter().any(|t| t.state == TaskState::Failed);
                break if any_failed || worst_exit != 0 {
                    Err(RuntimeError::NonZeroExit(worst_exit))
                } else {
                    Ok(())
                };
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = cancel.cancelled() => break Err(RuntimeError::Cancelled),
            }
        };

        if let Err(e) = self.runtime.remove_service(&service_id).await {
            warn!(service = %service_id, error = %e, "failed to remove service after run");
        }

        outcome
    }
}
