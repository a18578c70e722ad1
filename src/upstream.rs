//! Contracts of the systems the coordination layer drives, plus the
//! implementations the daemon ships with.

pub mod archive;
pub mod collector;
pub mod http;

use crate::core::{AccountDescriptor, Result, Timestamp};
use async_trait::async_trait;

pub use archive::{FsArchive, is_expired, object_key, object_time};
pub use collector::{ArchivingCollector, CollectionWindow};
pub use http::{FlowDirection, FlowLogSource, HttpAccountDirectory, HttpFlowLogSource};

/// Lists accounts that currently have flow-log collection enabled.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// An empty list is a valid answer; failures are `FlowlogError::Upstream`.
    async fn list_enabled_accounts(&self) -> Result<Vec<AccountDescriptor>>;
}

/// Collects one window of flow logs for an account and archives it.
#[async_trait]
pub trait FlowLogCollector: Send + Sync {
    /// Collects `[start, start + window]`, or the default lookback window
    /// ending now when `start_time` is `None`, and returns the window end.
    ///
    /// Re-running with the same `start_time` must produce the same archive
    /// object and the same end time.
    async fn collect_logs(
        &self,
        account_id: &str,
        bucket_name: &str,
        start_time: Option<Timestamp>,
    ) -> Result<Timestamp>;
}

/// Deletes archived objects past their retention.
#[async_trait]
pub trait ArchivePurger: Send + Sync {
    /// Returns how many objects were deleted. Safe to repeat.
    async fn purge_old_objects(&self, account: &AccountDescriptor) -> Result<usize>;
}
