use super::{Dispatcher, ScheduledTask, TaskChain};
use crate::config::DispatchRetryPolicy;
use crate::core::{FlowlogError, Result, Timestamp};
use crate::worker::{FlowlogWorker, TaskOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Level, event};

/// In-process task queue drained by a fixed pool of tokio workers.
///
/// Clones share the same queue. The queue closes once every clone is dropped,
/// after which the workers finish what is left and exit.
#[derive(Clone)]
pub struct LocalDispatcher {
    tx: mpsc::UnboundedSender<TaskChain>,
}

/// Owner of the worker pool behind a [`LocalDispatcher`].
pub struct LocalDispatcherHandle {
    stop_tx: Option<watch::Sender<bool>>,
    join_handles: Vec<JoinHandle<()>>,
}

impl LocalDispatcher {
    /// Starts `concurrency` workers executing chains with `worker`.
    pub fn spawn(
        worker: Arc<FlowlogWorker>,
        concurrency: usize,
        retry: DispatchRetryPolicy,
    ) -> (Self, LocalDispatcherHandle) {
        let (tx, rx) = mpsc::unbounded_channel::<TaskChain>();
        let (stop_tx, stop_rx) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));

        let join_handles = (0..concurrency.max(1))
            .map(|worker_index| {
                let rx = rx.clone();
                let worker = worker.clone();
                let retry = retry.clone();
                let mut stop_rx = stop_rx.clone();
                tokio::spawn(async move {
                    loop {
                        let next = {
                            let mut queue = rx.lock().await;
                            tokio::select! {
                                _ = stop_rx.changed() => None,
                                chain = queue.recv() => chain,
                            }
                        };
                        let Some(chain) = next else {
                            break;
                        };
                        run_chain(&worker, chain, &retry).await;
                    }
                    event!(Level::DEBUG, worker_index, "dispatch worker stopped");
                })
            })
            .collect();

        (
            Self { tx },
            LocalDispatcherHandle {
                stop_tx: Some(stop_tx),
                join_handles,
            },
        )
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn submit(&self, chain: TaskChain) -> Result<()> {
        if chain.is_empty() {
            return Ok(());
        }
        self.tx
            .send(chain)
            .map_err(|_| FlowlogError::Dispatch("dispatch queue is closed".to_string()))
    }
}

impl LocalDispatcherHandle {
    /// Waits until the queue is closed and every queued chain has run.
    pub async fn drain(mut self) -> Result<()> {
        self.join_all().await
    }

    /// Stops the workers after the chains they are running finish. Queued
    /// chains that were not started are dropped.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        self.join_all().await
    }

    async fn join_all(&mut self) -> Result<()> {
        let handles = std::mem::take(&mut self.join_handles);
        for result in futures::future::join_all(handles).await {
            result.map_err(|err| FlowlogError::Dispatch(format!("dispatch worker join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for LocalDispatcherHandle {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        for handle in self.join_handles.drain(..) {
            handle.abort();
        }
    }
}

/// Runs a chain in order. Once a step fails or is skipped, every later step
/// that depends on its predecessor is abandoned.
async fn run_chain(
    worker: &FlowlogWorker,
    chain: TaskChain,
    retry: &DispatchRetryPolicy,
) {
    let total = chain.len();
    let mut previous_end: Option<Timestamp> = None;
    let mut broken = false;

    for (index, item) in chain.into_items().into_iter().enumerate() {
        let ScheduledTask {
            task,
            depends_on_previous,
        } = item;
        if broken && depends_on_previous {
            event!(
                Level::WARN,
                account_id = %task.account().account_id,
                abandoned = total - index,
                "abandoning rest of task chain"
            );
            break;
        }

        match execute_with_retry(worker, &task, previous_end, retry).await {
            Ok(TaskOutcome::Collected { end_time }) => {
                previous_end = Some(end_time);
                broken = false;
            }
            Ok(TaskOutcome::Purged { .. }) => {
                previous_end = None;
                broken = false;
            }
            Ok(TaskOutcome::Skipped) => {
                previous_end = None;
                broken = true;
            }
            Err(_) => {
                previous_end = None;
                broken = true;
            }
        }
    }
}

async fn execute_with_retry(
    worker: &FlowlogWorker,
    task: &super::FlowlogTask,
    previous_end: Option<Timestamp>,
    retry: &DispatchRetryPolicy,
) -> Result<TaskOutcome> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match worker.execute(task, previous_end).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if attempt < max_attempts => {
                let backoff = retry.backoff_for(attempt);
                event!(
                    Level::WARN,
                    account_id = %task.account().account_id,
                    task = task.kind(),
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "task failed, retrying"
                );
                sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => {
                event!(
                    Level::ERROR,
                    account_id = %task.account().account_id,
                    task = task.kind(),
                    attempts = attempt,
                    error = %err,
                    kind = err.kind(),
                    "task failed"
                );
                return Err(err);
            }
        }
    }
}
