//! Discovers jobs from container labels across all five job variants, a
//! container label selector, and a host-jobs security toggle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use super::{DesiredJob, DesiredPayload, JobSource};
use crate::error::SourceError;
use crate::job::SourceTag;
use crate::job::variants::run::PullPolicy;
use crate::runtime::{ContainerFilter, RuntimePort};

/// The label suffixes recognized under `<prefix>.<kind>.<job-name>.`.
const FIELD_SCHEDULE: &str = "schedule";
const FIELD_COMMAND: &str = "command";
const FIELD_NO_OVERLAP: &str = "no-overlap";
const FIELD_RETRY_MAX: &str = "retry-max";
const FIELD_RETRY_DELAY_MS: &str = "retry-delay-ms";
const FIELD_RETRY_EXPONENTIAL: &str = "retry-exponential";
const FIELD_RETRY_MAX_DELAY_MS: &str = "retry-max-delay-ms";
const FIELD_ON_SUCCESS: &str = "on-success";
const FIELD_ON_FAILURE: &str = "on-failure";
const FIELD_HISTORY_LIMIT: &str = "history-limit";
const FIELD_MAX_RUNTIME_SECS: &str = "max-runtime-secs";
const FIELD_IMAGE: &str = "image";
const FIELD_PULL: &str = "pull";
const FIELD_DELETE: &str = "delete";
const FIELD_DIR: &str = "dir";
const FIELD_FILE: &str = "file";
const FIELD_SERVICE_NAME: &str = "service-name";

const KIND_EXEC: &str = "job-exec";
const KIND_RUN: &str = "job-run";
const KIND_SERVICE: &str = "job-service-run";
const KIND_LOCAL: &str = "job-local";
const KIND_COMPOSE: &str = "job-compose";

/// Labels accumulated for one `<prefix>.<kind>.<job-name>` group before
/// it's turned into a `DesiredJob`.
#[derive(Default)]
struct RawJob {
    fields: HashMap<String, String>,
}

impl RawJob {
    fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(|s| s.as_str())
    }

    fn bool_flag(&self, key: &str, default: bool) -> bool {
        self.get(key).map(|s| s.trim() == "true").unwrap_or(default)
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|s| s.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
            .unwrap_or_default()
    }
}

pub struct LabelSource {
    runtime: Arc<dyn RuntimePort>,
    prefixes: Vec<String>,
    container_filter_label: Option<(String, String)>,
    allow_host_jobs: bool,
    default_history_limit: usize,
}

impl LabelSource {
    pub fn new(
        runtime: Arc<dyn RuntimePort>,
        prefixes: Vec<String>,
        container_filter_label: Option<(String, String)>,
        allow_host_jobs: bool,
        default_history_limit: usize,
    ) -> Self {
        LabelSource {
            runtime,
            prefixes,
            container_filter_label,
            allow_host_jobs,
            default_history_limit,
        }
    }

    fn field_regex(prefix: &str, kind: &str) -> Regex {
        Regex::new(&format!(
            r"^{}\.{}\.([^.]+)\.([A-Za-z0-9_-]+)$",
            regex::escape(prefix),
            regex::escape(kind)
        ))
        .expect("valid regex")
    }

    fn common_fields(raw: &RawJob, default_history_limit: usize) -> Result<(String, u32, u64, bool, u64, bool, Vec<String>, Vec<String>, usize, Option<Duration>), String> {
        let schedule = raw.get(FIELD_SCHEDULE).ok_or_else(|| "missing schedule label".to_string())?.to_string();
        let max_retries: u32 = raw.get(FIELD_RETRY_MAX).map(|s| s.parse()).transpose().map_err(|e| format!("bad {FIELD_RETRY_MAX}: {e}"))?.unwrap_or(0);
        let retry_delay_ms: u64 = raw.get(FIELD_RETRY_DELAY_MS).map(|s| s.parse()).transpose().map_err(|e| format!("bad {FIELD_RETRY_DELAY_MS}: {e}"))?.unwrap_or(0);
        let retry_exponential = raw.bool_flag(FIELD_RETRY_EXPONENTIAL, false);
        let retry_max_delay_ms: u64 = raw.get(FIELD_RETRY_MAX_DELAY_MS).map(|s| s.parse()).transpose().map_err(|e| format!("bad {FIELD_RETRY_MAX_DELAY_MS}: {e}"))?.unwrap_or(u64::MAX);
        let no_overlap = raw.bool_flag(FIELD_NO_OVERLAP, false);
        let on_success = raw.list(FIELD_ON_SUCCESS);
        let on_failure = raw.list(FIELD_ON_FAILURE);
        let history_limit: usize = raw.get(FIELD_HISTORY_LIMIT).map(|s| s.parse()).transpose().map_err(|e| format!("bad {FIELD_HISTORY_LIMIT}: {e}"))?.unwrap_or(default_history_limit);
        let max_runtime = raw
            .get(FIELD_MAX_RUNTIME_SECS)
            .map(|s| s.parse::<u64>())
            .transpose()
            .map_err(|e| format!("bad {FIELD_MAX_RUNTIME_SECS}: {e}"))?
            .map(Duration::from_secs);
        Ok((schedule, max_retries, retry_delay_ms, retry_exponential, retry_max_delay_ms, no_overlap, on_success, on_failure, history_limit, max_runtime))
    }

    fn build_desired(
        kind: &str,
        name: &str,
        raw: &RawJob,
        container_id: &str,
        container_name: &str,
        default_history_limit: usize,
    ) -> Result<DesiredJob, String> {
        let (schedule, max_retries, retry_delay_ms, retry_exponential, retry_max_delay_ms, no_overlap, on_success, on_failure, history_limit, max_runtime) =
            Self::common_fields(raw, default_history_limit)?;

        let payload = match kind {
            KIND_EXEC => DesiredPayload::Exec {
                container_id: container_id.to_string(),
                container_name: container_name.to_string(),
                command: raw.get(FIELD_COMMAND).ok_or("missing command label")?.to_string(),
                env: Vec::new(),
                tty: false,
            },
            KIND_RUN => DesiredPayload::Run {
                image: raw.get(FIELD_IMAGE).ok_or("missing image label")?.to_string(),
                name_prefix: format!("ofelia-{name}"),
                cmd: raw.get(FIELD_COMMAND).and_then(|c| shlex::split(c)),
                env: Vec::new(),
                working_dir: raw.get(FIELD_DIR).map(|s| s.to_string()),
                volumes: Vec::new(),
                pull: if raw.bool_flag(FIELD_PULL, false) { PullPolicy::Always } else { PullPolicy::IfMissing },
                delete: raw.bool_flag(FIELD_DELETE, true),
                wait_timeout: Duration::from_secs(30),
            },
            KIND_SERVICE => DesiredPayload::Service {
                image: raw.get(FIELD_IMAGE).ok_or("missing image label")?.to_string(),
                name_prefix: format!("ofelia-{name}"),
                cmd: raw.get(FIELD_COMMAND).and_then(|c| shlex::split(c)),
                env: Vec::new(),
                deadline: Duration::from_secs(60),
            },
            KIND_LOCAL => DesiredPayload::Local {
                command: raw.get(FIELD_COMMAND).ok_or("missing command label")?.to_string(),
                working_dir: raw.get(FIELD_DIR).map(|s| s.to_string()),
                env: Vec::new(),
            },
            KIND_COMPOSE => DesiredPayload::Compose {
                file: raw.get(FIELD_FILE).ok_or("missing file label")?.to_string(),
                service: raw.get(FIELD_SERVICE_NAME).ok_or("missing service-name label")?.to_string(),
                command: raw.get(FIELD_COMMAND).ok_or("missing command label")?.to_string(),
            },
            other => return Err(format!("unknown job kind '{other}'")),
        };

        Ok(DesiredJob {
            schedule,
            max_retries,
            retry_delay_ms,
            retry_exponential,
            retry_max_delay_ms,
            no_overlap,
            on_success,
            on_failure,
            history_limit,
            max_runtime,
            payload,
        })
    }
}

#[async_trait]
impl JobSource for LabelSource {
    fn tag(&self) -> SourceTag {
        SourceTag::Label
    }

    async fn discover(&self) -> Result<HashMap<String, DesiredJob>, SourceError> {
        let containers = self
            .runtime
            .list_containers(&ContainerFilter { all: true, label: None })
            .await?;

        let mut discovered = HashMap::new();

        for container in containers {
            if let Some((key, value)) = &self.container_filter_label {
                let passes = container.labels.get(key).map(|v| v == value).unwrap_or(false);
                if !passes {
                    continue;
                }
            }

            let Some(prefix) = self.prefixes.iter().find(|p| {
                container
                    .labels
                    .get(&format!("{p}.enabled"))
                    .map(|v| v.trim() == "true")
                    .unwrap_or(false)
            }) else {
                continue;
            };

            let container_name = container
                .names
                .first()
                .cloned()
                .unwrap_or_else(|| container.id.chars().take(12).collect());

            for kind in [KIND_EXEC, KIND_RUN, KIND_SERVICE, KIND_LOCAL, KIND_COMPOSE] {
                let is_host_job = kind == KIND_LOCAL || kind == KIND_COMPOSE;

                let re = Self::field_regex(prefix, kind);
                let mut by_job: HashMap<String, RawJob> = HashMap::new();
                for (k, v) in &container.labels {
                    if let Some(caps) = re.captures(k) {
                        let job_name = caps[1].to_string();
                        let field = caps[2].to_string();
                        by_job.entry(job_name).or_default().fields.insert(field, v.clone());
                    }
                }

                for (local_name, raw) in by_job {
                    if is_host_job && !self.allow_host_jobs {
                        let violation = SourceError::SecurityPolicyViolation(format!(
                            "container '{container_name}' declares host job '{local_name}' ({kind}) but --allow-host-jobs is disabled"
                        ));
                        warn!(container = %container_name, job = %local_name, kind, "SECURITY POLICY VIOLATION: {violation}");
                        continue;
                    }

                    // Exec jobs are scoped to the container that defines
                    // them so two containers can reuse a job name.
                    let full_name = if kind == KIND_EXEC {
                        format!("{container_name}.{local_name}")
                    } else {
                        local_name.clone()
                    };

                    match Self::build_desired(kind, &local_name, &raw, &container.id, &container_name, self.default_history_limit) {
                        Ok(desired) => {
                            discovered.insert(full_name, desired);
                        }
                        Err(msg) => warn!(container = %container_name, job = %local_name, kind, error = %msg, "skipping malformed label job"),
                    }
                }
            }
        }

        Ok(discovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerState, ContainerSummary, ExecConfig, ExecState, ServiceSpec, TaskSummary};
    use crate::execution::OutputBuffer;
    use async_trait::async_trait as at;
    use tokio_util::sync::CancellationToken;

    struct FakeRuntime {
        containers: Vec<ContainerSummary>,
    }

    #[at]
    impl RuntimePort for FakeRuntime {
        async fn create_container(&self, _: &crate::runtime::ContainerSpec) -> Result<String, crate::error::RuntimeError> { unimplemented!() }
        async fn start_container(&self, _: &str) -> Result<(), crate::error::RuntimeError> { unimplemented!() }
        async fn stop_container(&self, _: &str, _: Option<Duration>) -> Result<(), crate::error::RuntimeError> { unimplemented!() }
        async fn remove_container(&self, _: &str, _: bool) -> Result<(), crate::error::RuntimeError> { unimplemented!() }
        async fn inspect_container(&self, _: &str) -> Result<ContainerState, crate::error::RuntimeError> { unimplemented!() }
        async fn list_containers(&self, _: &ContainerFilter) -> Result<Vec<ContainerSummary>, crate::error::RuntimeError> {
            Ok(self.containers.clone())
        }
        async fn wait_container(&self, _: &str) -> Result<i64, crate::error::RuntimeError> { unimplemented!() }
        async fn copy_logs(&self, _: &str, _: &mut OutputBuffer, _: &mut OutputBuffer) -> Result<(), crate::error::RuntimeError> { unimplemented!() }
        async fn kill_container(&self, _: &str, _: &str) -> Result<(), crate::error::RuntimeError> { unimplemented!() }
        async fn pause_container(&self, _: &str) -> Result<(), crate::error::RuntimeError> { unimplemented!() }
        async fn unpause_container(&self, _: &str) -> Result<(), crate::error::RuntimeError> { unimplemented!() }
        async fn rename_container(&self, _: &str, _: &str) -> Result<(), crate::error::RuntimeError> { unimplemented!() }
        async fn create_exec(&self, _: &str, _: &ExecConfig) -> Result<String, crate::error::RuntimeError> { unimplemented!() }
        async fn start_exec(&self, _: &str, _: &mut OutputBuffer, _: &mut OutputBuffer) -> Result<(), crate::error::RuntimeError> { unimplemented!() }
        async fn inspect_exec(&self, _: &str) -> Result<ExecState, crate::error::RuntimeError> { unimplemented!() }
        async fn pull_image(&self, _: &str) -> Result<(), crate::error::RuntimeError> { unimplemented!() }
        async fn image_exists(&self, _: &str) -> Result<bool, crate::error::RuntimeError> { unimplemented!() }
        async fn remove_image(&self, _: &str) -> Result<(), crate::error::RuntimeError> { unimplemented!() }
        async fn subscribe_events(&self, _: crate::runtime::EventFilter, _: CancellationToken) -> Result<crate::runtime::EventStream, crate::error::RuntimeError> { unimplemented!() }
        async fn create_service(&self, _: &ServiceSpec) -> Result<String, crate::error::RuntimeError> { unimplemented!() }
        async fn remove_service(&self, _: &str) -> Result<(), crate::error::RuntimeError> { unimplemented!() }
        async fn list_service_tasks(&self, _: &str) -> Result<Vec<TaskSummary>, crate::error::RuntimeError> { unimplemented!() }
        async fn ping(&self) -> Result<(), crate::error::RuntimeError> { Ok(()) }
    }

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn discovers_exec_job_scoped_per_container() {
        let container = ContainerSummary {
            id: "c1".into(),
            names: vec!["/web".into()],
            labels: labels(&[
                ("ofelia.enabled", "true"),
                ("ofelia.job-exec.backup.schedule", "@every 5m"),
                ("ofelia.job-exec.backup.command", "tar czf /tmp/x.tgz /data"),
            ]),
        };
        let runtime = Arc::new(FakeRuntime { containers: vec![container] });
        let source = LabelSource::new(runtime, vec!["ofelia".into()], None, false, 10);
        let discovered = source.discover().await.unwrap();
        assert!(discovered.contains_key("/web.backup"));
    }

    #[tokio::test]
    async fn local_job_requires_allow_host_jobs() {
        let container = ContainerSummary {
            id: "c1".into(),
            names: vec!["/web".into()],
            labels: labels(&[
                ("ofelia.enabled", "true"),
                ("ofelia.job-local.cleanup.schedule", "@every 5m"),
                ("ofelia.job-local.cleanup.command", "rm -rf /tmp/cache"),
            ]),
        };
        let runtime = Arc::new(FakeRuntime { containers: vec![container] });

        let blocked = LabelSource::new(runtime.clone(), vec!["ofelia".into()], None, false, 10);
        assert!(blocked.discover().await.unwrap().is_empty());

        let allowed = LabelSource::new(runtime, vec!["ofelia".into()], None, true, 10);
        assert!(allowed.discover().await.unwrap().contains_key("cleanup"));
    }

    #[tokio::test]
    async fn compose_job_requires_allow_host_jobs() {
        let container = ContainerSummary {
            id: "c1".into(),
            names: vec!["/web".into()],
            labels: labels(&[
                ("ofelia.enabled", "true"),
                ("ofelia.job-compose.migrate.schedule", "@every 5m"),
                ("ofelia.job-compose.migrate.file", "docker-compose.yml"),
                ("ofelia.job-compose.migrate.service-name", "db"),
                ("ofelia.job-compose.migrate.command", "migrate up"),
            ]),
        };
        let runtime = Arc::new(FakeRuntime { containers: vec![container] });

        let blocked = LabelSource::new(runtime.clone(), vec!["ofelia".into()], None, false, 10);
        assert!(blocked.discover().await.unwrap().is_empty());

        let allowed = LabelSource::new(runtime, vec!["ofelia".into()], None, true, 10);
        assert!(allowed.discover().await.unwrap().contains_key("migrate"));
    }

    #[tokio::test]
    async fn container_filter_label_excludes_non_matching_containers() {
        let container = ContainerSummary {
            id: "c1".into(),
            names: vec!["/web".into()],
            labels: labels(&[
                ("ofelia.enabled", "true"),
                ("env", "staging"),
                ("ofelia.job-exec.backup.schedule", "@every 5m"),
                ("ofelia.job-exec.backup.command", "true"),
            ]),
        };
        let runtime = Arc::new(FakeRuntime { containers: vec![container] });
        let source = LabelSource::new(runtime, vec!["ofelia".into()], Some(("env".into(), "production".into())), false, 10);
        assert!(source.discover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_required_field_skips_job_without_failing_discover() {
        let container = ContainerSummary {
            id: "c1".into(),
            names: vec!["/web".into()],
            labels: labels(&[
                ("ofelia.enabled", "true"),
                ("ofelia.job-exec.backup.schedule", "@every 5m"),
                // no command label
            ]),
        };
        let runtime = Arc::new(FakeRuntime { containers: vec![container] });
        let source = LabelSource::new(runtime, vec!["ofelia".into()], None, false, 10);
        assert!(source.discover().await.unwrap().is_empty());
    }
}
