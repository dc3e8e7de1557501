//! A single long-lived subscription to the runtime's event stream,
//! demultiplexed to interested Job variants.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::metrics;
use crate::runtime::{ContainerEvent, EventFilter, RuntimePort};

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct Consumer {
    predicate: Predicate,
    tx: Option<oneshot::Sender<Result<ContainerEvent, RuntimeError>>>,
}

/// Subscribes once to the runtime's event stream and fans matching events
/// out to registered consumers.
pub struct EventWatcher {
    consumers: Arc<DashMap<Uuid, Consumer>>,
    cancel: CancellationToken,
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

impl EventWatcher {
    /// Starts the background subscription task. Cancelling `cancel`
    /// terminates it and drops all pending consumers with a `Cancelled`
    /// error.
    pub fn spawn(runtime: Arc<dyn RuntimePort>, cancel: CancellationToken) -> Self {
        let consumers: Arc<DashMap<Uuid, Consumer>> = Arc::new(DashMap::new());
        let task_consumers = consumers.clone();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                if task_cancel.is_cancelled() {
                    break;
                }
                match runtime
                    .subscribe_events(EventFilter::default(), task_cancel.clone())
                    .await
                {
                    Ok(mut stream) => {
                        backoff = INITIAL_BACKOFF;
                        loop {
                            tokio::select! {
                                item = stream.next() => {
                                    match item {
                                        Some(Ok(event)) => dispatch(&task_consumers, Ok(event)),
                                        Some(Err(e)) => {
                                            warn!(error = %e, "event stream error; resubscribing");
                                            break;
                                        }
                                        None => {
                                            info!("event stream closed; resubscribing");
                                            break;
                                        }
                                    }
                                }
                                _ = task_cancel.cancelled() => {
                                    info!("event watcher cancelled");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, backoff_ms = backoff.as_millis(), "failed to subscribe to events");
                    }
                }

                if task_cancel.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = task_cancel.cancelled() => break,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }

            // Terminate all pending consumers; never leave a sender hanging.
            for mut entry in task_consumers.iter_mut() {
                if let Some(tx) = entry.value_mut().tx.take() {
                    let _ = tx.send(Err(RuntimeError::Cancelled));
                }
            }
            task_consumers.clear();
        });

        EventWatcher { consumers, cancel }
    }

    /// Registers a predicate and waits for the first matching event, or a
    /// `Timeout` classified error if none arrives within `timeout` — at
    /// which point the caller should fall back to periodic inspection.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
        timeout: Duration,
    ) -> Result<ContainerEvent, RuntimeError> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.consumers.insert(
            id,
            Consumer {
                predicate: Box::new(predicate),
                tx: Some(tx),
            },
        );

        let result = tokio::select! {
            res = rx => res.unwrap_or(Err(RuntimeError::Cancelled)),
            _ = tokio::time::sleep(timeout) => Err(RuntimeError::Timeout("no matching event within deadline".into())),
        };

        self.consumers.remove(&id);
        result
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

fn dispatch(consumers: &DashMap<Uuid, Consumer>, event: Result<ContainerEvent, RuntimeError>) {
    let Ok(ref ev) = event else { return };
    let matched: Vec<Uuid> = consumers
        .iter()
        .filter(|c| (c.value().predicate)(&ev.container_id))
        .map(|c| *c.key())
        .collect();
    for id in matched {
        if let Some((_, mut consumer)) = consumers.remove(&id) {
            if let Some(tx) = consumer.tx.take() {
                let _ = tx.send(event.clone());
            }
        }
    }
}

/// Waits for `container_id` to reach a terminal state via the event
/// watcher, falling back to polling `Inspect` if no event arrives within
/// `timeout`.
pub async fn wait_for_container_exit(
    watcher: &EventWatcher,
    runtime: &dyn RuntimePort,
    container_id: &str,
    timeout: Duration,
) -> Result<i64, RuntimeError> {
    match watcher
        .wait_for(
            {
                let id = container_id.to_string();
                move |cid: &str| cid == id
            },
            timeout,
        )
        .await
    {
        Ok(event) => {
            if let Some(code) = event.exit_code {
                return Ok(code);
            }
            runtime.inspect_container(container_id).await.map(|s| s.exit_code.unwrap_or(0))
        }
        Err(e) if e.is_timeout() => {
            metrics::global().record_fallback();
            poll_until_terminal(runtime, container_id).await
        }
        Err(e) => Err(e),
    }
}

async fn poll_until_terminal(runtime: &dyn RuntimePort, container_id: &str) -> Result<i64, RuntimeError> {
    loop {
        let state = runtime.inspect_container(container_id).await?;
        if !state.running {
            return Ok(state.exit_code.unwrap_or(0));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerAction, EventFilter};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeRuntime {
        events: tokio::sync::Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<ContainerEvent>>>,
    }

    #[async_trait]
    impl RuntimePort for FakeRuntime {
        async fn create_container(&self, _: &crate::runtime::ContainerSpec) -> Result<String, RuntimeError> { unimplemented!() }
        async fn start_container(&self, _: &str) -> Result<(), RuntimeError> { unimplemented!() }
        async fn stop_container(&self, _: &str, _: Option<Duration>) -> Result<(), RuntimeError> { unimplemented!() }
        async fn remove_container(&self, _: &str, _: bool) -> Result<(), RuntimeError> { unimplemented!() }
        async fn inspect_container(&self, _: &str) -> Result<crate::runtime::ContainerState, RuntimeError> {
            Ok(crate::runtime::ContainerState { running: false, exit_code: Some(0), status: "exited".into() })
        }
        async fn list_containers(&self, _: &crate::runtime::ContainerFilter) -> Result<Vec<crate::runtime::ContainerSummary>, RuntimeError> { Ok(vec![]) }
        async fn wait_container(&self, _: &str) -> Result<i64, RuntimeError> { Ok(0) }
        async fn copy_logs(&self, _: &str, _: &mut crate::execution::OutputBuffer, _: &mut crate::execution::OutputBuffer) -> Result<(), RuntimeError> { Ok(()) }
        async fn kill_container(&self, _: &str, _: &str) -> Result<(), RuntimeError> { unimplemented!() }
        async fn pause_container(&self, _: &str) -> Result<(), RuntimeError> { unimplemented!() }
        async fn unpause_container(&self, _: &str) -> Result<(), RuntimeError> { unimplemented!() }
        async fn rename_container(&self, _: &str, _: &str) -> Result<(), RuntimeError> { unimplemented!() }
        async fn create_exec(&self, _: &str, _: &crate::runtime::ExecConfig) -> Result<String, RuntimeError> { unimplemented!() }
        async fn start_exec(&self, _: &str, _: &mut crate::execution::OutputBuffer, _: &mut crate::execution::OutputBuffer) -> Result<(), RuntimeError> { unimplemented!() }
        async fn inspect_exec(&self, _: &str) -> Result<crate::runtime::ExecState, RuntimeError> { unimplemented!() }
        async fn pull_image(&self, _: &str) -> Result<(), RuntimeError> { unimplemented!() }
        async fn image_exists(&self, _: &str) -> Result<bool, RuntimeError> { unimplemented!() }
        async fn remove_image(&self, _: &str) -> Result<(), RuntimeError> { unimplemented!() }
        async fn subscribe_events(&self, _: EventFilter, _: CancellationToken) -> Result<crate::runtime::EventStream, RuntimeError> {
            let mut guard = self.events.lock().await;
            let rx = guard.take().expect("events already subscribed");
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|ev| (Ok(ev), rx))
            });
            Ok(Box::pin(stream))
        }
        async fn create_service(&self, _: &crate::runtime::ServiceSpec) -> Result<String, RuntimeError> { unimplemented!() }
        async fn remove_service(&self, _: &str) -> Result<(), RuntimeError> { unimplemented!() }
        async fn list_service_tasks(&self, _: &str) -> Result<Vec<crate::runtime::TaskSummary>, RuntimeError> { unimplemented!() }
        async fn ping(&self) -> Result<(), RuntimeError> { Ok(()) }
    }

    #[tokio::test]
    async fn wait_for_resolves_on_matching_event() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let runtime: Arc<dyn RuntimePort> = Arc::new(FakeRuntime { events: tokio::sync::Mutex::new(Some(rx)) });
        let cancel = CancellationToken::new();
        let watcher = EventWatcher::spawn(runtime, cancel.clone());

        tx.send(ContainerEvent { container_id: "abc".into(), action: ContainerAction::Die, exit_code: Some(3) }).unwrap();

        let matched = AtomicBool::new(false);
        let result = watcher
            .wait_for(move |cid| { matched.store(cid == "abc", Ordering::SeqCst); cid == "abc" }, Duration::from_secs(2))
            .await;
        assert!(result.is_ok());
        assert_eq!(result.unwrap().exit_code, Some(3));
        cancel.cancel();
    }

    #[tokio::test]
    async fn wait_for_times_out_without_matching_event() {
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let runtime: Arc<dyn RuntimePort> = Arc::new(FakeRuntime { events: tokio::sync::Mutex::new(Some(rx)) });
        let cancel = CancellationToken::new();
        let watcher = EventWatcher::spawn(runtime, cancel.clone());

        let result = watcher.wait_for(|_| false, Duration::from_millis(50)).await;
        assert!(result.unwrap_err().is_timeout());
        cancel.cancel();
    }
}
