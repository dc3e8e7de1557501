//! Compose: invokes a locally available `docker compose` driver on a
//! validated file path and service name.

use std::hash::{Hash, Hasher};
use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::local::LocalJob;
use crate::error::RuntimeError;
use crate::execution::Execution;
use crate::pipeline::JobRunnable;

pub struct ComposeJob {
    pub file: String,
    pub service: String,
    pub command: String,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
}

impl ComposeJob {
    pub fn new(file: String, service: String, command: String) -> Self {
        ComposeJob {
            file,
            service,
            command,
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Rejects `..` path segments and absolute escapes outside the
    /// working directory.
    fn validate_file(&self) -> Result<(), RuntimeError> {
        let path = Path::new(&self.file);
        if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(RuntimeError::Forbidden(format!(
                "compose file path '{}' contains a parent-directory segment",
                self.file
            )));
        }
        Ok(())
    }

    /// Compose service names are `[a-zA-Z0-9_.-]+`; reject anything else
    /// before it reaches a shell.
    fn validate_service(&self) -> Result<(), RuntimeError> {
        let valid = !self.service.is_empty()
            && self
                .service
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid {
            return Err(RuntimeError::Forbidden(format!(
                "invalid compose service name: '{}'",
                self.service
            )));
        }
        Ok(())
    }
}

impl Hash for ComposeJob {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.file.hash(state);
        self.service.hash(state);
        self.command.hash(state);
        self.working_dir.hash(state);
        self.env.hash(state);
    }
}

#[async_trait]
impl JobRunnable for ComposeJob {
    async fn run(&self, exec: &mut Execution, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        self.validate_file()?;
        self.validate_service()?;

        let extra_args = shlex::split(&self.command).unwrap_or_default();
        let mut args = vec!["compose".to_string(), "-f".to_string(), self.file.clone(), "exec".to_string(), "-T".to_string(), self.service.clone()];
        args.extend(extra_args);
        let command_line = shlex::try_join(args.iter().map(|s| s.as_str()))
            .map_err(|e| RuntimeError::Unexpected(format!("failed to build compose command: {e}")))?;
        let inner = LocalJob::new(format!("docker {command_line}"), self.working_dir.clone(), self.env.clone());
        inner.run(exec, cancel).await
    }
}
