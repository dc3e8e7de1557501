//! The Scheduler: the single source of truth for which
//! jobs are installed in the cron table and which are running. All
//! mutations go through one lock; no I/O happens while it's held.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SchedulerError;
use crate::job::{Job, JobHeader, JobKind, SourceTag};
use crate::pipeline::{ExecutionContext, Middleware, NotifyConfig, PipelineOutcome, PipelineRunner};

const REMOVED_LIMIT: usize = 50;

/// Everything the Reconciler (or an API caller) supplies about a job
/// beyond its runnable payload: the per-job middleware stack and the
/// notification/save configuration the pipeline needs at fire time.
pub struct JobSpec {
    pub header: JobHeader,
    pub kind: JobKind,
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub save_folder: Option<PathBuf>,
    pub notify: NotifyConfig,
    /// The source's hash of the `DesiredJob` this spec was built from, if
    /// any. The Reconciler stamps this so a later `desired_hash_of` lookup
    /// can compare like with like instead of rehashing the installed `Job`
    /// under a different hashing scheme.
    pub desired_hash: Option<u64>,
}

struct JobEntry {
    job: Arc<Job>,
    middlewares: Vec<Arc<dyn Middleware>>,
    save_folder: Option<PathBuf>,
    notify: NotifyConfig,
    desired_hash: Option<u64>,
    loop_cancel: CancellationToken,
    loop_handle: Option<JoinHandle<()>>,
}

impl JobEntry {
    fn stop_loop(&mut self) {
        self.loop_cancel.cancel();
        if let Some(handle) = self.loop_handle.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    active: HashMap<String, JobEntry>,
    active_order: Vec<String>,
    disabled: HashMap<String, JobEntry>,
    removed: HashMap<String, Arc<Job>>,
    removed_order: VecDeque<String>,
    origins: HashMap<String, SourceTag>,
    global_middlewares: Vec<Arc<dyn Middleware>>,
}

/// Snapshot information about an active job's cron entry, for UI /
/// introspection use.
pub struct EntryInfo {
    pub schedule: String,
    pub upcoming: Vec<DateTime<Utc>>,
    pub recent_fires: Vec<DateTime<Utc>>,
}

pub struct Scheduler {
    state: RwLock<SchedulerState>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Scheduler {
            state: RwLock::new(SchedulerState::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Installs process-global middlewares, applied after per-job
    /// middlewares for every fire from this point on — including fires of
    /// already-registered jobs.
    pub async fn use_middlewares(&self, mw: Vec<Arc<dyn Middleware>>) {
        let mut state = self.state.write().await;
        state.global_middlewares.extend(mw);
    }

    pub async fn add_job(self: &Arc<Self>, spec: JobSpec, source: SourceTag) -> Result<(), SchedulerError> {
        let name = spec.header.name.clone();
        let mut state = self.state.write().await;
        if state.active.contains_key(&name) {
            return Err(SchedulerError::AlreadyRegistered(name));
        }
        let job = Arc::new(Job::new(spec.header, spec.kind));
        let entry = self.spawn_entry(job, spec.middlewares, spec.save_folder, spec.notify, spec.desired_hash);
        state.active_order.push(name.clone());
        state.origins.insert(name.clone(), source);
        state.active.insert(name, entry);
        Ok(())
    }

    pub async fn remove_job(&self, name: &str) -> Result<(), SchedulerError> {
        let mut state = self.state.write().await;
        if let Some(mut entry) = state.active.remove(name) {
            entry.stop_loop();
            state.active_order.retain(|n| n != name);
            state.origins.remove(name);
            Self::archive_removed(&mut state, name.to_string(), entry.job);
        } else if let Some(mut entry) = state.disabled.remove(name) {
            entry.stop_loop();
            state.origins.remove(name);
            Self::archive_removed(&mut state, name.to_string(), entry.job);
        }
        // Idempotent on missing.
        Ok(())
    }

    fn archive_removed(state: &mut SchedulerState, name: String, job: Arc<Job>) {
        if state.removed_order.len() >= REMOVED_LIMIT {
            if let Some(oldest) = state.removed_order.pop_front() {
                state.removed.remove(&oldest);
            }
        }
        state.removed.insert(name.clone(), job);
        state.removed_order.push_back(name);
    }

    /// Atomically swaps a job's schedule/payload while preserving its
    /// history and running counter; running Executions started under the
    /// old job are left to finish).
    pub async fn update_job(self: &Arc<Self>, name: &str, spec: JobSpec) -> Result<(), SchedulerError> {
        let mut state = self.state.write().await;
        let Some(mut old_entry) = state.active.remove(name) else {
            return Err(SchedulerError::NotFound(name.to_string()));
        };
        old_entry.stop_loop();

        let new_job = Job::with_transferred_state(spec.header, spec.kind, &old_entry.job).await;
        let new_job = Arc::new(new_job);
        let entry = self.spawn_entry(new_job, spec.middlewares, spec.save_folder, spec.notify, spec.desired_hash);
        state.active.insert(name.to_string(), entry);
        Ok(())
    }

    pub async fn disable_job(&self, name: &str) -> Result<(), SchedulerError> {
        let mut state = self.state.write().await;
        let Some(mut entry) = state.active.remove(name) else {
            return Err(SchedulerError::NotFound(name.to_string()));
        };
        entry.stop_loop();
        state.active_order.retain(|n| n != name);
        state.disabled.insert(name.to_string(), entry);
        Ok(())
    }

    pub async fn enable_job(self: &Arc<Self>, name: &str) -> Result<(), SchedulerError> {
        let mut state = self.state.write().await;
        let Some(old) = state.disabled.remove(name) else {
            return Err(SchedulerError::NotFound(name.to_string()));
        };
        let entry = self.spawn_entry(old.job, old.middlewares, old.save_folder, old.notify, old.desired_hash);
        state.active_order.push(name.to_string());
        state.active.insert(name.to_string(), entry);
        Ok(())
    }

    /// Triggers an ad-hoc execution subject to the same pipeline and
    /// overlap policy as a scheduled fire.
    pub async fn run_job(self: &Arc<Self>, name: &str) -> Result<(), SchedulerError> {
        let (job, middlewares, save_folder, notify) = {
            let state = self.state.read().await;
            let entry = state
                .active
                .get(name)
                .or_else(|| state.disabled.get(name))
                .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
            (
                entry.job.clone(),
                entry.middlewares.clone(),
                entry.save_folder.clone(),
                entry.notify.clone(),
            )
        };
        let global = self.global_middlewares_snapshot().await;
        self.fire(job, middlewares, global, save_folder, notify).await;
        Ok(())
    }

    pub async fn jobs(&self) -> Vec<Arc<Job>> {
        let state = self.state.read().await;
        state
            .active_order
            .iter()
            .filter_map(|n| state.active.get(n))
            .map(|e| e.job.clone())
            .collect()
    }

    pub async fn disabled_jobs(&self) -> Vec<Arc<Job>> {
        let state = self.state.read().await;
        state.disabled.values().map(|e| e.job.clone()).collect()
    }

    pub async fn removed_jobs(&self) -> Vec<Arc<Job>> {
        let state = self.state.read().await;
        state.removed.values().cloned().collect()
    }

    pub async fn origin_of(&self, name: &str) -> Option<SourceTag> {
        self.state.read().await.origins.get(name).copied()
    }

    /// The hash of the `DesiredJob` the active job was last built from, as
    /// stamped by the Reconciler. `None` for jobs installed without one
    /// (e.g. directly via the API).
    pub async fn desired_hash_of(&self, name: &str) -> Option<u64> {
        self.state.read().await.active.get(name)?.desired_hash
    }

    pub async fn is_job_running(&self, name: &str) -> bool {
        let state = self.state.read().await;
        state
            .active
            .get(name)
            .or_else(|| state.disabled.get(name))
            .map(|e| e.job.is_running())
            .unwrap_or(false)
    }

    pub async fn history(&self, name: &str) -> Vec<Arc<Job>> {
        // Kept for symmetry with the other snapshot accessors; callers
        // read `job.history` directly under its own lock.
        let state = self.state.read().await;
        state
            .active
            .get(name)
            .or_else(|| state.disabled.get(name))
            .map(|e| vec![e.job.clone()])
            .unwrap_or_default()
    }

    pub async fn entry_by_name(&self, name: &str, forward: usize) -> Option<EntryInfo> {
        let state = self.state.read().await;
        let entry = state.active.get(name)?;
        let now = Utc::now();
        let upcoming = entry.job.header.schedule.upcoming(now, forward);
        let history = entry.job.history.lock().await;
        let recent_fires = history.iter().map(|e| e.start_time).collect();
        Some(EntryInfo {
            schedule: entry.job.header.schedule.to_string(),
            upcoming,
            recent_fires,
        })
    }

    /// Cancels all in-flight contexts and waits up to `grace` for running
    /// chains to drain; anything still in-flight afterward is abandoned.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        let mut state = self.state.write().await;
        for entry in state.active.values_mut() {
            entry.stop_loop();
        }
        for entry in state.disabled.values_mut() {
            entry.stop_loop();
        }
        drop(state);
        tokio::time::sleep(grace).await;
    }

    async fn global_middlewares_snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.state.read().await.global_middlewares.clone()
    }

    fn spawn_entry(
        self: &Arc<Self>,
        job: Arc<Job>,
        middlewares: Vec<Arc<dyn Middleware>>,
        save_folder: Option<PathBuf>,
        notify: NotifyConfig,
        desired_hash: Option<u64>,
    ) -> JobEntry {
        let loop_cancel = self.shutdown.child_token();

        let loop_handle = if job.header.schedule.is_triggered() {
            None
        } else {
            let scheduler = self.clone();
            let job_for_loop = job.clone();
            let middlewares_for_loop = middlewares.clone();
            let save_for_loop = save_folder.clone();
            let notify_for_loop = notify.clone();
            let cancel_for_loop = loop_cancel.clone();
            Some(tokio::spawn(async move {
                scheduler
                    .drive_schedule(job_for_loop, middlewares_for_loop, save_for_loop, notify_for_loop, cancel_for_loop)
                    .await;
            }))
        };

        JobEntry {
            job,
            middlewares,
            save_folder,
            notify,
            desired_hash,
            loop_cancel,
            loop_handle,
        }
    }

    /// Sleeps until each successive fire time and spawns a fire for it.
    /// The loop itself never blocks on the job running.
    async fn drive_schedule(
        self: Arc<Self>,
        job: Arc<Job>,
        middlewares: Vec<Arc<dyn Middleware>>,
        save_folder: Option<PathBuf>,
        notify: NotifyConfig,
        cancel: CancellationToken,
    ) {
        loop {
            let now = Utc::now();
            let Some(next) = job.header.schedule.next_after(now) else {
                return;
            };
            let sleep_for = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => return,
            }

            if cancel.is_cancelled() {
                return;
            }

            let scheduler = self.clone();
            let job = job.clone();
            let middlewares = middlewares.clone();
            let save_folder = save_folder.clone();
            let notify = notify.clone();
            tokio::spawn(async move {
                let global = scheduler.global_middlewares_snapshot().await;
                scheduler.fire(job, middlewares, global, save_folder, notify).await;
            });
        }
    }

    /// Runs one fire event through the pipeline and records it in the
    /// job's history; dispatches `on_success`/`on_failure` dependency
    /// hooks afterward.
    async fn fire(
        self: &Arc<Self>,
        job: Arc<Job>,
        mut middlewares: Vec<Arc<dyn Middleware>>,
        global: Vec<Arc<dyn Middleware>>,
        save_folder: Option<PathBuf>,
        notify: NotifyConfig,
    ) {
        middlewares.extend(global);
        let mut ctx = ExecutionContext::new(job.name().to_string(), job.running.clone());
        ctx.no_overlap = job.header.no_overlap;
        ctx.save_folder = save_folder;
        ctx.notify = notify;

        let runner = PipelineRunner::new(middlewares, job.header.retry).with_max_runtime(job.header.max_runtime);
        let cancel = self.shutdown.child_token();
        let (exec, outcome) = runner.run(&ctx, job.as_ref(), &cancel).await;

        debug!(job = %job.name(), outcome = ?outcome, attempt = exec.attempt, "execution finished");

        let hooks = match outcome {
            PipelineOutcome::Success => job.header.on_success.clone(),
            PipelineOutcome::Failed => job.header.on_failure.clone(),
            PipelineOutcome::Skipped => Vec::new(),
        };

        {
            let mut history = job.history.lock().await;
            history.push(exec);
        }

        for dep in hooks {
            let scheduler = self.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.run_job(&dep).await {
                    warn!(job = %dep, error = %e, "dependency hook could not trigger job");
                }
            });
        }
    }
}


fn _diag_assert_send() {
    fn assert_send<T: Send>(_: T) {}
    fn check(scheduler: std::sync::Arc<Scheduler>, job: std::sync::Arc<crate::job::Job>, mw: Vec<std::sync::Arc<dyn crate::pipeline::Middleware>>, global: Vec<std::sync::Arc<dyn crate::pipeline::Middleware>>, save_folder: Option<std::path::PathBuf>, notify: crate::pipeline::NotifyConfig) {
        assert_send(scheduler.fire(job, mw, global, save_folder, notify));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSchedule, LocalJob};
    use std::str::FromStr;

    fn local_spec(name: &str, schedule: &str, command: &str) -> JobSpec {
        JobSpec {
            header: JobHeader::new(name, JobSchedule::from_str(schedule).unwrap(), SourceTag::File),
            kind: JobKind::Local(LocalJob::new(command.to_string(), None, vec![])),
            middlewares: vec![],
            save_folder: None,
            notify: NotifyConfig::default(),
            desired_hash: None,
        }
    }

    #[tokio::test]
    async fn add_job_rejects_duplicate_name() {
        let scheduler = Scheduler::new();
        scheduler.add_job(local_spec("a", "@triggered", "true"), SourceTag::File).await.unwrap();
        let err = scheduler.add_job(local_spec("a", "@triggered", "true"), SourceTag::File).await.unwrap_err();
        assert_eq!(err, SchedulerError::AlreadyRegistered("a".into()));
    }

    #[tokio::test]
    async fn remove_job_is_idempotent_on_missing() {
        let scheduler = Scheduler::new();
        scheduler.remove_job("does-not-exist").await.unwrap();
    }

    #[tokio::test]
    async fn update_job_fails_on_missing_name() {
        let scheduler = Scheduler::new();
        let err = scheduler.update_job("missing", local_spec("missing", "@triggered", "true")).await.unwrap_err();
        assert_eq!(err, SchedulerError::NotFound("missing".into()));
    }

    #[tokio::test]
    async fn triggered_job_runs_only_via_run_job() {
        let scheduler = Scheduler::new();
        scheduler.add_job(local_spec("a", "@triggered", "true"), SourceTag::File).await.unwrap();
        scheduler.run_job("a").await.unwrap();
        // Let the spawned fire complete.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let jobs = scheduler.jobs().await;
        let history = jobs[0].history.lock().await;
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn disable_then_enable_preserves_history() {
        let scheduler = Scheduler::new();
        scheduler.add_job(local_spec("a", "@triggered", "true"), SourceTag::File).await.unwrap();
        scheduler.run_job("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.disable_job("a").await.unwrap();
        assert!(scheduler.jobs().await.is_empty());
        assert_eq!(scheduler.disabled_jobs().await.len(), 1);
        scheduler.enable_job("a").await.unwrap();
        let jobs = scheduler.jobs().await;
        assert_eq!(jobs.len(), 1);
        let history = jobs[0].history.lock().await;
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn remove_job_archives_for_introspection() {
        let scheduler = Scheduler::new();
        scheduler.add_job(local_spec("a", "@triggered", "true"), SourceTag::File).await.unwrap();
        scheduler.remove_job("a").await.unwrap();
        assert!(scheduler.jobs().await.is_empty());
        assert_eq!(scheduler.removed_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn is_job_running_reflects_running_counter() {
        let scheduler = Scheduler::new();
        scheduler.add_job(local_spec("a", "@triggered", "sleep 0.2"), SourceTag::File).await.unwrap();
        scheduler.run_job("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(scheduler.is_job_running("a").await);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!scheduler.is_job_running("a").await);
    }
}
