use crate::coordinator::{CycleOutcome, PeriodicCoordinator};
use crate::core::{FlowlogError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{Level, event};

/// Background tick source driving both periodic cycles on this node.
///
/// Ticking more often than the configured intervals is expected; the
/// coordinator gates each cycle on its persisted schedule.
pub struct PeriodicScheduler {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl PeriodicScheduler {
    pub fn spawn(coordinator: Arc<PeriodicCoordinator>, tick_every: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let tick_every = tick_every.max(Duration::from_millis(10));

        let join_handle = tokio::spawn(async move {
            let mut ticker = interval(tick_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            event!(Level::INFO, tick_ms = tick_every.as_millis() as u64, "scheduler loop started");
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        break;
                    }
                    _ = ticker.tick() => {
                        log_tick("collect", coordinator.run_collect_cycle().await);
                        log_tick("purge", coordinator.run_purge_cycle().await);
                    }
                }
            }
            event!(Level::INFO, "scheduler loop stopped");
        });

        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }

    /// Signals the loop to stop and waits for the current tick to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| FlowlogError::Dispatch(format!("scheduler join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

fn log_tick(cycle: &str, result: Result<CycleOutcome>) {
    match result {
        Ok(CycleOutcome::Completed { report, .. }) => {
            event!(Level::DEBUG, cycle, accounts = report.accounts, "tick completed")
        }
        Ok(outcome) => event!(Level::DEBUG, cycle, outcome = ?outcome, "tick ended early"),
        Err(err) => event!(
            Level::ERROR,
            cycle,
            error = %err,
            kind = err.kind(),
            "tick failed, retrying on next tick"
        ),
    }
}
