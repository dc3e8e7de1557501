//! The crate's reference [`RuntimePort`] implementation, built on
//! `bollard` for container inspection and exec. Feature completeness
//! against every real-world Docker edge case is out of scope; this
//! adapter exists so the port is runnable end-to-end against a live
//! daemon.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, RemoveContainerOptions, RemoveImageOptions, StartContainerOptions,
    StopContainerOptions,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::*;
use crate::error::RuntimeError;
use crate::execution::OutputBuffer;

pub struct BollardRuntime {
    docker: Docker,
}

impl BollardRuntime {
    pub fn new(docker: Docker) -> Self {
        BollardRuntime { docker }
    }

    /// Connects over a unix socket or TCP, with bollard's env-driven
    /// TLS defaults for the latter.
    pub fn connect(docker_host: &str) -> Result<Self, RuntimeError> {
        let docker = if let Some(path) = docker_host.strip_prefix("unix://") {
            Docker::connect_with_unix(path, 60, bollard::API_DEFAULT_VERSION)
        } else if docker_host.starts_with("tcp://") {
            Docker::connect_with_local_defaults()
        } else {
            return Err(RuntimeError::Unexpected(format!(
                "unsupported DOCKER_HOST: {docker_host}"
            )));
        }
        .map_err(|e| RuntimeError::ConnectionFailed(e.to_string()))?;
        Ok(BollardRuntime::new(docker))
    }
}

/// Classifies a `bollard::errors::Error` into the shared taxonomy.
fn classify(id: &str, err: bollard::errors::Error) -> RuntimeError {
    use bollard::errors::Error as BErr;
    match &err {
        BErr::DockerResponseServerError { status_code, message } => match *status_code {
            404 => RuntimeError::ContainerNotFound(id.to_string()),
            409 => RuntimeError::Conflict(message.clone()),
            401 => RuntimeError::Unauthorized(message.clone()),
            403 => RuntimeError::Forbidden(message.clone()),
            408 => RuntimeError::Timeout(message.clone()),
            _ => RuntimeError::Unexpected(format!("{status_code}: {message}")),
        },
        BErr::HyperResponseError { .. } | BErr::HyperLegacyError { .. } => {
            RuntimeError::ConnectionFailed(err.to_string())
        }
        _ => RuntimeError::Unexpected(err.to_string()),
    }
}

#[async_trait]
impl super::RuntimePort for BollardRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: Some(name.clone()),
            ..Default::default()
        });
        let config = bollard::models::ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            env: if spec.env.is_empty() { None } else { Some(spec.env.clone()) },
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };
        let resp = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| classify(spec.name.as_deref().unwrap_or(""), e))?;
        Ok(resp.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| classify(id, e))
    }

    async fn stop_container(&self, id: &str, timeout: Option<Duration>) -> Result<(), RuntimeError> {
        let options = timeout.map(|t| StopContainerOptions {
            t: Some(t.as_secs() as i32),
            ..Default::default()
        });
        self.docker
            .stop_container(id, options)
            .await
            .map_err(|e| classify(id, e))
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify(id, e))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(id, e))?;
        let state = details.state.unwrap_or_default();
        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
            status: state
                .status
                .map(|s| format!("{s:?}"))
                .unwrap_or_default(),
        })
    }

    async fn list_containers(&self, filter: &ContainerFilter) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let mut label_filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some((k, v)) = &filter.label {
            label_filters.insert("label".into(), vec![format!("{k}={v}")]);
        }
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: filter.all,
                filters: if label_filters.is_empty() { None } else { Some(label_filters) },
                ..Default::default()
            }))
            .await
            .map_err(|e| classify("", e))?;
        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let mut stream = self.docker.wait_container(id, None::<bollard::query_parameters::WaitContainerOptions>);
        match stream.next().await {
            Some(Ok(resp)) => Ok(resp.status_code),
            Some(Err(e)) => Err(classify(id, e)),
            None => Err(RuntimeError::Unexpected("wait stream ended with no response".into())),
        }
    }

    async fn copy_logs(
        &self,
        id: &str,
        stdout: &mut OutputBuffer,
        stderr: &mut OutputBuffer,
    ) -> Result<(), RuntimeError> {
        let options = bollard::query_parameters::LogsOptions {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| classify(id, e))? {
                LogOutput::StdOut { message } => stdout.write(&message),
                LogOutput::StdErr { message } => stderr.write(&message),
                LogOutput::Console { message } => stdout.write(&message),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(())
    }

    async fn kill_container(&self, id: &str, signal: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(
                id,
                Some(KillContainerOptions {
                    signal: signal.to_string(),
                }),
            )
            .await
            .map_err(|e| classify(id, e))
    }

    async fn pause_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker.pause_container(id).await.map_err(|e| classify(id, e))
    }

    async fn unpause_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker.unpause_container(id).await.map_err(|e| classify(id, e))
    }

    async fn rename_container(&self, id: &str, new_name: &str) -> Result<(), RuntimeError> {
        self.docker
            .rename_container(
                id,
                bollard::query_parameters::RenameContainerOptions {
                    name: new_name.to_string(),
                },
            )
            .await
            .map_err(|e| classify(id, e))
    }

    async fn create_exec(&self, container_id: &str, cfg: &ExecConfig) -> Result<String, RuntimeError> {
        let resp = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(cfg.tty),
                    cmd: Some(cfg.cmd.clone()),
                    env: if cfg.env.is_empty() { None } else { Some(cfg.env.clone()) },
                    working_dir: cfg.working_dir.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(container_id, e))?;
        Ok(resp.id)
    }

    async fn start_exec(
        &self,
        exec_id: &str,
        stdout: &mut OutputBuffer,
        stderr: &mut OutputBuffer,
    ) -> Result<(), RuntimeError> {
        match self
            .docker
            .start_exec(exec_id, None)
            .await
            .map_err(|e| classify(exec_id, e))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg.map_err(|e| classify(exec_id, e))? {
                        LogOutput::StdOut { message } => stdout.write(&message),
                        LogOutput::StdErr { message } => stderr.write(&message),
                        LogOutput::Console { message } => stdout.write(&message),
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {
                debug!(exec_id, "exec detached");
            }
        }
        Ok(())
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecState, RuntimeError> {
        let details = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| classify(exec_id, e))?;
        Ok(ExecState {
            running: details.running.unwrap_or(false),
            exit_code: details.exit_code,
        })
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let options = bollard::query_parameters::CreateImageOptions {
            from_image: Some(reference.to_string()),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            if let Err(e) = progress {
                return Err(classify(reference, e));
            }
        }
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let classified = classify(reference, e);
                if classified.is_not_found() {
                    Ok(false)
                } else {
                    Err(classified)
                }
            }
        }
    }

    async fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_image(reference, None::<RemoveImageOptions>, None)
            .await
            .map(|_| ())
            .map_err(|e| classify(reference, e))
    }

    async fn subscribe_events(
        &self,
        filter: EventFilter,
        cancel: CancellationToken,
    ) -> Result<EventStream, RuntimeError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("type".into(), vec!["container".into()]);
        filters.insert(
            "event".into(),
            filter
                .actions
                .iter()
                .map(|a| {
                    match a {
                        ContainerAction::Die => "die",
                        ContainerAction::Kill => "kill",
                        ContainerAction::Stop => "stop",
                        ContainerAction::Oom => "oom",
                    }
                    .to_string()
                })
                .collect(),
        );

        let options = bollard::query_parameters::EventsOptions {
            filters: Some(filters),
            ..Default::default()
        };
        let raw = self.docker.events(Some(options));

        let mapped = raw.filter_map(|item| async move {
            match item {
                Ok(msg) => {
                    let container_id = msg.actor.and_then(|a| a.id).unwrap_or_default();
                    let action = match msg.action.as_deref() {
                        Some("die") => ContainerAction::Die,
                        Some("kill") => ContainerAction::Kill,
                        Some("stop") => ContainerAction::Stop,
                        Some("oom") => ContainerAction::Oom,
                        _ => return None,
                    };
                    Some(Ok(ContainerEvent {
                        container_id,
                        action,
                        exit_code: None,
                    }))
                }
                Err(e) => Some(Err(classify("", e))),
            }
        });

        let stream = futures::stream::unfold(
            (Box::pin(mapped), cancel),
            |(mut inner, cancel)| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                tokio::select! {
                    item = inner.next() => item.map(|i| (i, (inner, cancel))),
                    _ = cancel.cancelled() => {
                        warn!("event subscription cancelled");
                        None
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<String, RuntimeError> {
        let service_spec = bollard::models::ServiceSpec {
            name: Some(spec.name.clone()),
            mode: Some(bollard::models::ServiceSpecMode {
                replicated: Some(bollard::models::ServiceSpecModeReplicated {
                    replicas: Some(spec.replicas as i64),
                }),
                ..Default::default()
            }),
            task_template: Some(bollard::models::TaskSpec {
                container_spec: Some(bollard::models::TaskSpecContainerSpec {
                    image: Some(spec.image.clone()),
                    command: spec.cmd.clone(),
                    env: if spec.env.is_empty() { None } else { Some(spec.env.clone()) },
                    ..Default::default()
                }),
                restart_policy: Some(bollard::models::TaskSpecRestartPolicy {
                    condition: Some(bollard::models::TaskSpecRestartPolicyConditionEnum::NONE),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let resp = self
            .docker
            .create_service(service_spec, None)
            .await
            .map_err(|e| classify(&spec.name, e))?;
        resp.id.ok_or_else(|| RuntimeError::Unexpected("service create returned no id".into()))
    }

    async fn remove_service(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker.delete_service(id).await.map_err(|e| classify(id, e))
    }

    async fn list_service_tasks(&self, service_id: &str) -> Result<Vec<TaskSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("service".to_string(), vec![service_id.to_string()]);
        let tasks = self
            .docker
            .list_tasks(Some(bollard::query_parameters::ListTasksOptions {
                filters: Some(filters),
            }))
            .await
            .map_err(|e| classify(service_id, e))?;

        Ok(tasks
            .into_iter()
            .map(|t| {
                let status = t.status.unwrap_or_default();
                let state_str = status.state.map(|s| format!("{s:?}")).unwrap_or_default();
                let state = match state_str.to_lowercase().as_str() {
                    s if s.contains("running") => TaskState::Running,
                    s if s.contains("complete") => TaskState::Complete,
                    s if s.contains("failed") || s.contains("rejected") => TaskState::Failed,
                    s if s.contains("shutdown") => TaskState::Shutdown,
                    _ => TaskState::Pending,
                };
                TaskSummary {
                    id: t.id.unwrap_or_default(),
                    service_id: service_id.to_string(),
                    state,
                    exit_code: status.container_status.and_then(|c| c.exit_code),
                }
            })
            .collect())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map(|_| ()).map_err(|e| classify("", e))
    }
}
