//! Execution side of dispatched tasks. Runs on whichever node dequeues them.

use crate::coordination::{CoordinationPaths, CoordinationStore, LockOutcome};
use crate::core::{AccountDescriptor, ProgressRecord, Result, Timestamp, format_timestamp};
use crate::dispatch::{FlowlogTask, StartTime};
use crate::upstream::{ArchivePurger, FlowLogCollector};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// What running one task achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// A window was collected and the account cursor now points at `end_time`.
    Collected { end_time: Timestamp },
    /// Another node holds the account lock; nothing was done.
    Skipped,
    Purged { deleted: usize },
}

pub struct FlowlogWorker {
    store: CoordinationStore,
    paths: CoordinationPaths,
    collector: Arc<dyn FlowLogCollector>,
    purger: Arc<dyn ArchivePurger>,
}

impl FlowlogWorker {
    pub fn new(
        store: CoordinationStore,
        paths: CoordinationPaths,
        collector: Arc<dyn FlowLogCollector>,
        purger: Arc<dyn ArchivePurger>,
    ) -> Self {
        Self {
            store,
            paths,
            collector,
            purger,
        }
    }

    pub fn store(&self) -> &CoordinationStore {
        &self.store
    }

    /// Runs `task`. `previous_end` is the end time of the preceding task of
    /// the same chain, used by [`StartTime::FromPrevious`].
    pub async fn execute(
        &self,
        task: &FlowlogTask,
        previous_end: Option<Timestamp>,
    ) -> Result<TaskOutcome> {
        match task {
            FlowlogTask::Collect {
                account,
                start_time,
            } => {
                let start = match start_time {
                    StartTime::At(ts) => Some(*ts),
                    StartTime::Default => None,
                    StartTime::FromPrevious => previous_end,
                };
                self.process_collection(account, start).await
            }
            FlowlogTask::Purge { account } => {
                let deleted = self.process_purge(account).await?;
                Ok(TaskOutcome::Purged { deleted })
            }
        }
    }

    /// Collects one window for `account` under its lock and advances the
    /// account's progress record to the window end.
    pub async fn process_collection(
        &self,
        account: &AccountDescriptor,
        start_time: Option<Timestamp>,
    ) -> Result<TaskOutcome> {
        let account_id = account.account_id.as_str();
        let span = info_span!(
            "flowlog.collect.account",
            account_id,
            from = %start_time.as_ref().map(format_timestamp).unwrap_or_else(|| "default".to_string())
        );
        let lock_path = self.paths.account_lock(account_id);

        let outcome = self
            .store
            .with_lock(&lock_path, move || self.collect_locked(account, start_time))
            .instrument(span.clone())
            .await;

        let _enter = span.enter();
        match outcome {
            Ok(LockOutcome::Acquired(end_time)) => Ok(TaskOutcome::Collected { end_time }),
            Ok(LockOutcome::Unavailable) => {
                event!(Level::INFO, "collection for account already running on another node");
                Ok(TaskOutcome::Skipped)
            }
            Err(err) => {
                event!(Level::ERROR, error = %err, kind = err.kind(), "collection failed");
                Err(err)
            }
        }
    }

    async fn collect_locked(
        &self,
        account: &AccountDescriptor,
        start_time: Option<Timestamp>,
    ) -> Result<Timestamp> {
        let account_id = account.account_id.as_str();
        event!(Level::INFO, "collecting flow logs");
        let end_time = self
            .collector
            .collect_logs(account_id, &account.bucket_name, start_time)
            .await?;

        let path = self.paths.account(account_id);
        self.store
            .set(&path, &ProgressRecord::new(end_time, self.store.identity()))
            .await?;
        event!(
            Level::INFO,
            to = %format_timestamp(&end_time),
            "collected flow logs"
        );
        Ok(end_time)
    }

    /// Deletes expired archive objects of `account`.
    pub async fn process_purge(&self, account: &AccountDescriptor) -> Result<usize> {
        let span = info_span!("flowlog.purge.account", account_id = %account.account_id);
        async {
            let result = self.purger.purge_old_objects(account).await;
            match &result {
                Ok(deleted) => event!(Level::INFO, deleted, "purged flow logs"),
                Err(err) => {
                    event!(Level::ERROR, error = %err, kind = err.kind(), "purge failed")
                }
            }
            result
        }
        .instrument(span)
        .await
    }
}
