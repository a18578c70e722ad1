use crate::config::FlowlogConfig;
use crate::core::{AccountDescriptor, ProgressRecord, Result, Timestamp, format_timestamp};
use crate::dispatch::{Dispatcher, FlowlogTask, StartTime, TaskChain};
use chrono::Duration;
use tracing::{Level, event};

/// Schedules bounded catch-up work for an account that fell behind.
#[derive(Debug, Clone)]
pub struct DeltaCorrector {
    window: Duration,
    max_correction_runs: u32,
}

impl DeltaCorrector {
    pub fn new(window: Duration, max_correction_runs: u32) -> Self {
        Self {
            window,
            max_correction_runs,
        }
    }

    pub fn from_config(config: &FlowlogConfig) -> Self {
        Self::new(
            config.collection_window_duration(),
            config.max_correction_runs,
        )
    }

    pub fn max_correction_runs(&self) -> u32 {
        self.max_correction_runs
    }

    /// Number of whole windows missed since `start`, capped at the configured
    /// maximum.
    pub fn runs_to_schedule(&self, start: Timestamp, now: Timestamp) -> u32 {
        let window_secs = self.window.num_seconds();
        if window_secs <= 0 {
            return 0;
        }
        let elapsed_secs = (now - start).num_seconds();
        if elapsed_secs <= 0 {
            return 0;
        }
        let missed = elapsed_secs / window_secs;
        u32::try_from(missed)
            .unwrap_or(u32::MAX)
            .min(self.max_correction_runs)
    }

    /// Builds the catch-up chain: the first run starts at the saved cursor,
    /// each later one where its predecessor stopped.
    pub fn build_chain(
        &self,
        account: &AccountDescriptor,
        record: &ProgressRecord,
        now: Timestamp,
    ) -> Option<TaskChain> {
        let start = record.next_start_time?;
        let runs = self.runs_to_schedule(start, now);
        if runs == 0 {
            return None;
        }
        let tasks = (0..runs).map(|index| FlowlogTask::Collect {
            account: account.clone(),
            start_time: if index == 0 {
                StartTime::At(start)
            } else {
                StartTime::FromPrevious
            },
        });
        Some(TaskChain::sequential(tasks))
    }

    /// Submits the catch-up chain for `account` and returns its length.
    pub async fn correct_delta(
        &self,
        dispatcher: &dyn Dispatcher,
        account: &AccountDescriptor,
        record: &ProgressRecord,
        now: Timestamp,
    ) -> Result<u32> {
        let Some(chain) = self.build_chain(account, record, now) else {
            return Ok(0);
        };
        let runs = chain.len() as u32;
        event!(
            Level::INFO,
            account_id = %account.account_id,
            start_time = %record
                .next_start_time
                .as_ref()
                .map(format_timestamp)
                .unwrap_or_default(),
            runs,
            "correcting delta"
        );
        dispatcher.submit(chain).await?;
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn runs_are_floor_of_missed_windows() {
        let corrector = DeltaCorrector::new(Duration::seconds(3600), 12);
        assert_eq!(corrector.runs_to_schedule(now() - Duration::seconds(3599), now()), 0);
        assert_eq!(corrector.runs_to_schedule(now() - Duration::seconds(7201), now()), 2);
        assert_eq!(corrector.runs_to_schedule(now() - Duration::seconds(3 * 3600 + 59), now()), 3);
        assert_eq!(corrector.runs_to_schedule(now() + Duration::seconds(10), now()), 0);
    }

    #[test]
    fn runs_never_exceed_cap() {
        let corrector = DeltaCorrector::new(Duration::seconds(3600), 12);
        assert_eq!(corrector.runs_to_schedule(now() - Duration::hours(30), now()), 12);
        assert_eq!(corrector.runs_to_schedule(now() - Duration::days(365), now()), 12);
    }

    #[test]
    fn chain_starts_at_cursor_then_follows_previous() {
        let corrector = DeltaCorrector::new(Duration::seconds(3600), 12);
        let account = AccountDescriptor::new("acc-1", "bucket");
        let start = now() - Duration::hours(4);
        let record = ProgressRecord::new(start, "node-a");

        let chain = corrector.build_chain(&account, &record, now()).unwrap();
        assert_eq!(chain.len(), 4);
        let items = chain.items();
        assert_eq!(
            items[0].task,
            FlowlogTask::Collect {
                account: account.clone(),
                start_time: StartTime::At(start)
            }
        );
        assert!(!items[0].depends_on_previous);
        for item in &items[1..] {
            assert!(item.depends_on_previous);
            assert!(matches!(
                item.task,
                FlowlogTask::Collect {
                    start_time: StartTime::FromPrevious,
                    ..
                }
            ));
        }
    }

    #[test]
    fn no_chain_without_cursor_or_missed_window() {
        let corrector = DeltaCorrector::new(Duration::seconds(3600), 12);
        let account = AccountDescriptor::new("acc-1", "bucket");
        assert!(
            corrector
                .build_chain(&account, &ProgressRecord::empty(), now())
                .is_none()
        );
        let recent = ProgressRecord::new(now() - Duration::minutes(5), "node-a");
        assert!(corrector.build_chain(&account, &recent, now()).is_none());
    }
}
