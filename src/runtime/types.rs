//! Value types carried across the Runtime Port boundary.

use std::collections::HashMap;
use std::pin::Pin;

use futures::Stream;

#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub name: Option<String>,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub volumes: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub tty: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecState {
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub all: bool,
    pub label: Option<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub replicas: u64,
}

#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub id: String,
    pub service_id: String,
    pub state: TaskState,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Complete,
    Failed,
    Shutdown,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed | TaskState::Shutdown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerAction {
    Die,
    Kill,
    Stop,
    Oom,
}

#[derive(Debug, Clone)]
pub struct EventFilter {
    pub actions: Vec<ContainerAction>,
}

impl Default for EventFilter {
    fn default() -> Self {
        EventFilter {
            actions: vec![
                ContainerAction::Die,
                ContainerAction::Kill,
                ContainerAction::Stop,
                ContainerAction::Oom,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub container_id: String,
    pub action: ContainerAction,
    pub exit_code: Option<i64>,
}

/// A stream of container lifecycle events; the driver closes it when the
/// subscription's cancellation token fires.
pub type EventStream =
    Pin<Box<dyn Stream<Item = Result<ContainerEvent, crate::error::RuntimeError>> + Send>>;
