//! Periodic collect and purge cycles, coordinated across every node.
//!
//! Each tick runs `Idle -> LockAttempt -> {Skipped | Gated | Running} -> Idle`:
//! the global lock decides which node runs the cycle, the global progress
//! record decides whether the cycle is due, and only a completed fan-out
//! advances the record by one interval.

use crate::config::FlowlogConfig;
use crate::coordination::{CoordinationPaths, CoordinationStore, LockOutcome};
use crate::core::{
    AccountDescriptor, Clock, ProgressRecord, Result, Timestamp, format_timestamp,
};
use crate::delta::DeltaCorrector;
use crate::dispatch::{Dispatcher, FlowlogTask, StartTime, TaskChain};
use crate::trigger::{AccountAction, can_run_periodic_trigger, evaluate_account};
use crate::upstream::AccountDirectory;
use chrono::Duration;
use std::fmt;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Collect,
    Purge,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collect => write!(f, "collect"),
            Self::Purge => write!(f, "purge"),
        }
    }
}

/// Per-tick tallies of a cycle that ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub accounts: usize,
    /// Accounts that got a single task (collection or purge).
    pub submitted: usize,
    /// Accounts that got a catch-up chain.
    pub corrected: usize,
    /// Total tasks across all catch-up chains.
    pub correction_tasks: usize,
    /// Accounts skipped because their previous window is still open.
    pub overflowed: usize,
    /// Accounts skipped because their id cannot be used as a path segment.
    pub rejected: usize,
}

/// Terminal state of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another node holds the cycle lock.
    Skipped,
    /// The cycle is not due yet.
    Gated { next_start_time: Option<Timestamp> },
    /// No enabled accounts; the schedule was not advanced.
    NoAccounts,
    Completed {
        report: CycleReport,
        next_start_time: Timestamp,
    },
}

pub struct PeriodicCoordinator {
    store: CoordinationStore,
    paths: CoordinationPaths,
    accounts: Arc<dyn AccountDirectory>,
    dispatcher: Arc<dyn Dispatcher>,
    clock: Arc<dyn Clock>,
    collect_interval: Duration,
    purge_interval: Duration,
    collection_window: Duration,
    tick_slack: Duration,
    delta: DeltaCorrector,
}

impl PeriodicCoordinator {
    pub fn new(
        config: &FlowlogConfig,
        store: CoordinationStore,
        accounts: Arc<dyn AccountDirectory>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            paths: CoordinationPaths::from_config(config),
            accounts,
            dispatcher,
            clock,
            collect_interval: config.collect_interval_duration(),
            purge_interval: config.purge_interval_duration(),
            collection_window: config.collection_window_duration(),
            tick_slack: config.tick_slack_duration(),
            delta: DeltaCorrector::from_config(config),
        }
    }

    pub fn paths(&self) -> &CoordinationPaths {
        &self.paths
    }

    /// One tick of the collect cycle.
    pub async fn run_collect_cycle(&self) -> Result<CycleOutcome> {
        self.run_cycle(CycleKind::Collect).await
    }

    /// One tick of the purge cycle.
    pub async fn run_purge_cycle(&self) -> Result<CycleOutcome> {
        self.run_cycle(CycleKind::Purge).await
    }

    async fn run_cycle(&self, kind: CycleKind) -> Result<CycleOutcome> {
        let now = self.clock.now();
        let tick_start = now - self.tick_slack;
        let lock_path = match kind {
            CycleKind::Collect => self.paths.collect_lock(),
            CycleKind::Purge => self.paths.purge_lock(),
        };
        let span = info_span!(
            "flowlog.cycle",
            cycle = %kind,
            node = %self.store.identity()
        );

        async {
            let outcome = self
                .store
                .with_lock(&lock_path, move || self.run_locked(kind, now, tick_start))
                .await;
            match outcome {
                Ok(LockOutcome::Acquired(outcome)) => Ok(outcome),
                Ok(LockOutcome::Unavailable) => {
                    event!(Level::INFO, "periodic task already running on another node");
                    Ok(CycleOutcome::Skipped)
                }
                Err(err) => {
                    event!(
                        Level::ERROR,
                        path = %lock_path,
                        error = %err,
                        kind = err.kind(),
                        "periodic cycle failed"
                    );
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_locked(
        &self,
        kind: CycleKind,
        now: Timestamp,
        tick_start: Timestamp,
    ) -> Result<CycleOutcome> {
        let (trigger_path, interval) = match kind {
            CycleKind::Collect => (self.paths.collect_trigger(), self.collect_interval),
            CycleKind::Purge => (self.paths.purge_trigger(), self.purge_interval),
        };

        let record = self
            .store
            .get_or_create(&trigger_path, &ProgressRecord::empty())
            .await?;
        if !can_run_periodic_trigger(&record, now) {
            return Ok(CycleOutcome::Gated {
                next_start_time: record.next_start_time,
            });
        }

        let accounts = self.accounts.list_enabled_accounts().await?;
        if accounts.is_empty() {
            event!(Level::INFO, "could not find flow-log enabled accounts");
            return Ok(CycleOutcome::NoAccounts);
        }

        event!(Level::INFO, accounts = accounts.len(), "submitting tasks for accounts");
        let mut report = CycleReport {
            accounts: accounts.len(),
            ..CycleReport::default()
        };
        for account in &accounts {
            if !is_usable_account_id(&account.account_id) {
                event!(
                    Level::WARN,
                    account_id = %account.account_id,
                    "skipping account with unusable id"
                );
                report.rejected += 1;
                continue;
            }
            let handled = match kind {
                CycleKind::Collect => self.collect_account(account, now, &mut report).await,
                CycleKind::Purge => self.purge_account(account, &mut report).await,
            };
            if let Err(err) = handled {
                event!(
                    Level::ERROR,
                    account_id = %account.account_id,
                    path = %self.paths.account(&account.account_id),
                    error = %err,
                    kind = err.kind(),
                    "failed to submit task for account"
                );
                return Err(err);
            }
        }

        let next_start_time = tick_start + interval;
        self.store
            .set(
                &trigger_path,
                &ProgressRecord::new(next_start_time, self.store.identity()),
            )
            .await?;
        event!(
            Level::INFO,
            submitted = report.submitted,
            corrected = report.corrected,
            overflowed = report.overflowed,
            next_start_time = %format_timestamp(&next_start_time),
            "submitted tasks for accounts, periodic task will run again at next start time"
        );
        Ok(CycleOutcome::Completed {
            report,
            next_start_time,
        })
    }

    async fn collect_account(
        &self,
        account: &AccountDescriptor,
        now: Timestamp,
        report: &mut CycleReport,
    ) -> Result<()> {
        let account_id = account.account_id.as_str();
        let path = self.paths.account(account_id);
        let mut record = self
            .store
            .get_or_create(&path, &ProgressRecord::empty())
            .await?;

        match evaluate_account(&mut record, account, now, self.collection_window) {
            AccountAction::CorrectDelta => {
                let runs = self
                    .delta
                    .correct_delta(self.dispatcher.as_ref(), account, &record, now)
                    .await?;
                if runs > 0 {
                    report.corrected += 1;
                    report.correction_tasks += runs as usize;
                }
            }
            AccountAction::Overflow => {
                event!(Level::INFO, account_id, "detected overflow for account");
                report.overflowed += 1;
            }
            AccountAction::Collect => {
                let start_time = StartTime::from_cursor(record.next_start_time);
                self.dispatcher
                    .submit(TaskChain::single(FlowlogTask::Collect {
                        account: account.clone(),
                        start_time,
                    }))
                    .await?;
                report.submitted += 1;
                event!(
                    Level::INFO,
                    account_id,
                    start_time = %record
                        .next_start_time
                        .as_ref()
                        .map(format_timestamp)
                        .unwrap_or_else(|| "default".to_string()),
                    last_updated_by = record.updated_by.as_deref().unwrap_or("none"),
                    "submitted collection task"
                );
            }
        }
        Ok(())
    }

    async fn purge_account(
        &self,
        account: &AccountDescriptor,
        report: &mut CycleReport,
    ) -> Result<()> {
        self.dispatcher
            .submit(TaskChain::single(FlowlogTask::Purge {
                account: account.clone(),
            }))
            .await?;
        report.submitted += 1;
        event!(
            Level::INFO,
            account_id = %account.account_id,
            "submitted purge task"
        );
        Ok(())
    }
}

/// Account ids become coordination path segments.
fn is_usable_account_id(account_id: &str) -> bool {
    !account_id.trim().is_empty()
        && !account_id.contains('/')
        && account_id != "."
        && account_id != ".."
}
