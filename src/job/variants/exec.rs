//! Exec-in-container: runs a command inside an already-running container
//! via the runtime's exec API (inspect, create exec, start it, demux the
//! output stream, map the exit code).

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;
use crate::execution::Execution;
use crate::pipeline::JobRunnable;
use crate::runtime::{ExecConfig, RuntimePort};

pub struct ExecJob {
    pub container_id: String,
    pub container_name: String,
    pub command: String,
    pub env: Vec<String>,
    pub tty: bool,
    pub runtime: Arc<dyn RuntimePort>,
}

impl ExecJob {
    pub fn new(container_id: String, container_name: String, command: String, runtime: Arc<dyn RuntimePort>) -> Self {
        ExecJob {
            container_id,
            container_name,
            command,
            env: Vec::new(),
            tty: false,
            runtime,
        }
    }
}

impl Hash for ExecJob {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.container_id.hash(state);
        self.container_name.hash(state);
        self.command.hash(state);
        self.env.hash(state);
        self.tty.hash(state);
    }
}

#[async_trait]
impl JobRunnable for ExecJob {
    async fn run(&self, exec: &mut Execution, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        let state = self.runtime.inspect_container(&self.container_id).await?;
        if !state.running {
            return Err(RuntimeError::Conflict(format!(
                "container '{}' is not running",
                self.container_name
            )));
        }

        let cmd = shlex::split(&self.command)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RuntimeError::Unexpected(format!("empty or malformed command: {}", self.command)))?;

        let cfg = ExecConfig {
            cmd,
            env: self.env.clone(),
            working_dir: None,
            tty: self.tty,
        };

        let (stdout, stderr) = exec.stdout_stderr_mut();
        let exit_code = tokio::select! {
            result = self.runtime.run_exec(&self.container_id, &cfg, stdout, stderr) => result?,
            _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
        };

        if exit_code != 0 {
            Err(RuntimeError::NonZeroExit(exit_code))
        } else {
            Ok(())
        }
    }
}
