use super::FlowLogCollector;
use super::archive::{FsArchive, object_key};
use super::http::{FlowDirection, FlowLogSource};
use crate::core::{Clock, FlowlogError, Result, Timestamp, format_timestamp};
use async_trait::async_trait;
use chrono::{Duration, SubsecRound};
use serde_json::json;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

/// Time range covered by one collection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionWindow {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl CollectionWindow {
    /// With a cursor the window runs forward from it; without one it is the
    /// lookback window ending now. Bounds are whole seconds.
    pub fn resolve(start: Option<Timestamp>, now: Timestamp, length: Duration) -> Self {
        match start {
            Some(start) => {
                let start = start.trunc_subsecs(0);
                Self {
                    start,
                    end: start + length,
                }
            }
            None => {
                let end = now.trunc_subsecs(0);
                Self {
                    start: end - length,
                    end,
                }
            }
        }
    }
}

/// Collector that pulls both flow directions from a [`FlowLogSource`] and
/// stores them as one archive object per window.
pub struct ArchivingCollector {
    source: Arc<dyn FlowLogSource>,
    archive: FsArchive,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl ArchivingCollector {
    pub fn new(
        source: Arc<dyn FlowLogSource>,
        archive: FsArchive,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            archive,
            window,
            clock,
        }
    }
}

#[async_trait]
impl FlowLogCollector for ArchivingCollector {
    async fn collect_logs(
        &self,
        account_id: &str,
        bucket_name: &str,
        start_time: Option<Timestamp>,
    ) -> Result<Timestamp> {
        let window = CollectionWindow::resolve(start_time, self.clock.now(), self.window);
        let span = info_span!(
            "flowlog.collect.window",
            account_id,
            start_time = %format_timestamp(&window.start),
            end_time = %format_timestamp(&window.end)
        );
        async {
            let mut records = self
                .source
                .fetch_records(account_id, &window, FlowDirection::Destination)
                .await?;
            records.extend(
                self.source
                    .fetch_records(account_id, &window, FlowDirection::Source)
                    .await?,
            );
            let count = records.len();

            let body = serde_json::to_vec(&json!({ "log_data": records }))?;
            let key = object_key(bucket_name, &window.start);
            self.archive
                .put_object(bucket_name, &key, &body)
                .await
                .map_err(|err| FlowlogError::collection(account_id, err))?;

            event!(Level::INFO, records = count, key = %key, "flow logs archived");
            Ok::<_, FlowlogError>(window.end)
        }
        .instrument(span)
        .await
    }
}
