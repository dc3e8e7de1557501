//! Local: runs a command directly on the host.

use std::hash::{Hash, Hasher};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::error::RuntimeError;
use crate::execution::Execution;
use crate::pipeline::JobRunnable;

pub struct LocalJob {
    pub command: String,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
}

impl LocalJob {
    pub fn new(command: String, working_dir: Option<String>, env: Vec<(String, String)>) -> Self {
        LocalJob { command, working_dir, env }
    }
}

impl Hash for LocalJob {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.command.hash(state);
        self.working_dir.hash(state);
        self.env.hash(state);
    }
}

#[async_trait]
impl JobRunnable for LocalJob {
    async fn run(&self, exec: &mut Execution, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        let args = shlex::split(&self.command)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RuntimeError::Unexpected(format!("empty or malformed command: {}", self.command)))?;

        let mut command = tokio::process::Command::new(&args[0]);
        command
            .args(&args[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        for (k, v) in &self.env {
            command.env(k, v);
        }

        let mut child = command
            .spawn()
            .map_err(|e| RuntimeError::Unexpected(format!("spawn failed: {e}")))?;

        let mut child_stdout = child.stdout.take().expect("piped stdout");
        let mut child_stderr = child.stderr.take().expect("piped stderr");

        let wait = async {
            let mut out_buf = Vec::new();
            let mut err_buf = Vec::new();
            let (out_res, err_res, status_res) = tokio::join!(
                child_stdout.read_to_end(&mut out_buf),
                child_stderr.read_to_end(&mut err_buf),
                child.wait(),
            );
            out_res.ok();
            err_res.ok();
            (out_buf, err_buf, status_res)
        };

        tokio::select! {
            (out_buf, err_buf, status_res) = wait => {
                exec.stdout_mut().write(&out_buf);
                exec.stderr_mut().write(&err_buf);
                let status = status_res.map_err(|e| RuntimeError::Unexpected(format!("wait failed: {e}")))?;
                match status.code() {
                    Some(0) => Ok(()),
                    Some(code) => Err(RuntimeError::NonZeroExit(code as i64)),
                    None => Err(RuntimeError::Cancelled),
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                Err(RuntimeError::Cancelled)
            }
        }
    }
}
