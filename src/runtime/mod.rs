//! The Runtime Port: an abstract interface over a container
//! runtime. Job variants and the Event Watcher depend only on
//! [`RuntimePort`]; no scheduling concern lives here.

mod bollard_adapter;
mod types;

pub use bollard_adapter::BollardRuntime;
pub use types::*;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::execution::OutputBuffer;

/// Capability-set abstraction over a container runtime.
///
/// Every method returns the classified [`RuntimeError`] taxonomy;
/// callers never see a raw driver error type.
#[async_trait]
pub trait RuntimePort: Send + Sync {
    // -- Containers ---------------------------------------------------
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;
    async fn stop_container(&self, id: &str, timeout: Option<std::time::Duration>) -> Result<(), RuntimeError>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError>;
    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>, RuntimeError>;
    /// Blocks (async) until the container reaches a terminal state,
    /// returning its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError>;
    async fn copy_logs(
        &self,
        id: &str,
        stdout: &mut OutputBuffer,
        stderr: &mut OutputBuffer,
    ) -> Result<(), RuntimeError>;
    async fn kill_container(&self, id: &str, signal: &str) -> Result<(), RuntimeError>;
    async fn pause_container(&self, id: &str) -> Result<(), RuntimeError>;
    async fn unpause_container(&self, id: &str) -> Result<(), RuntimeError>;
    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), RuntimeError>;

    // -- Exec -----------------------------------------------------------
    async fn create_exec(&self, container_id: &str, cfg: &ExecConfig) -> Result<String, RuntimeError>;
    async fn start_exec(
        &self,
        exec_id: &str,
        stdout: &mut OutputBuffer,
        stderr: &mut OutputBuffer,
    ) -> Result<(), RuntimeError>;
    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState, RuntimeError>;
    /// Convenience composition of create/start/poll used by the
    /// Exec-in-container variant.
    async fn run_exec(
        &self,
        container_id: &str,
        cfg: &ExecConfig,
        stdout: &mut OutputBuffer,
        stderr: &mut OutputBuffer,
    ) -> Result<i64, RuntimeError> {
        let id = self.create_exec(container_id, cfg).await?;
        self.start_exec(&id, stdout, stderr).await?;
        loop {
            let state = self.inspect_exec(&id).await?;
            if !state.running {
                return Ok(state.exit_code.unwrap_or(0));
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    // -- Images -----------------------------------------------------------
    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError>;
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError>;
    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError>;

    // -- Events -----------------------------------------------------------
    /// Subscribes to the runtime's event stream, filtered server-side
    /// where the driver supports it. The returned stream is closed by
    /// the driver when `cancel` fires; consumers never close it
    /// themselves.
    async fn subscribe_events(
        &self,
        filter: EventFilter,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<EventStream, RuntimeError>;

    // -- Services -----------------------------------------------------------
    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, RuntimeError>;
    async fn remove_service(&self, id: &str) -> Result<(), RuntimeError>;
    async fn list_service_tasks(&self, service_id: &str) -> Result<Vec<TaskSummary>, RuntimeError>;

    // -- System -----------------------------------------------------------
    async fn ping(&self) -> Result<(), RuntimeError>;
}
