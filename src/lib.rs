// ============================================================================
// flowlogd Library
// ============================================================================

pub mod config;
pub mod coordination;
pub mod coordinator;
pub mod core;
pub mod delta;
pub mod dispatch;
pub mod prelude;
pub mod scheduler;
pub mod trigger;
pub mod upstream;
pub mod worker;

// Re-export main types for convenience
pub use config::{DispatchRetryPolicy, FlowlogConfig, UpstreamConfig};
pub use coordination::{
    CoordinationBackend, CoordinationPaths, CoordinationStore, FsCoordinationBackend,
    InMemoryCoordinationBackend, LockOutcome, LockToken,
};
pub use coordinator::{CycleKind, CycleOutcome, CycleReport, PeriodicCoordinator};
pub use crate::core::{
    AccountDescriptor, Clock, FlowlogError, ManualClock, ProgressRecord, Result, SystemClock,
    Timestamp,
};
pub use delta::DeltaCorrector;
pub use dispatch::{
    Dispatcher, FlowlogTask, LocalDispatcher, LocalDispatcherHandle, ScheduledTask, StartTime,
    TaskChain,
};
pub use scheduler::PeriodicScheduler;
pub use trigger::{
    AccountAction, can_run_periodic_trigger, check_delta, check_overflow, evaluate_account,
};
pub use upstream::{
    AccountDirectory, ArchivePurger, ArchivingCollector, CollectionWindow, FlowLogCollector,
    FsArchive, HttpAccountDirectory, HttpFlowLogSource,
};
pub use worker::{FlowlogWorker, TaskOutcome};

// ============================================================================
// Node assembly
// ============================================================================

use std::sync::Arc;

/// Everything one node needs to coordinate cycles and execute dispatched work
/// in-process.
///
/// # Examples
///
/// ```ignore
/// use flowlogd::{FlowlogConfig, FlowlogNode};
///
/// # async fn run() -> flowlogd::Result<()> {
/// let config = FlowlogConfig::from_json_file("/etc/flowlogd/flowlogd.json")?;
/// let node = FlowlogNode::from_config(&config)?;
/// node.coordinator.run_collect_cycle().await?;
/// node.shutdown().await
/// # }
/// ```
pub struct FlowlogNode {
    pub store: CoordinationStore,
    pub coordinator: Arc<PeriodicCoordinator>,
    pub worker: Arc<FlowlogWorker>,
    workers: LocalDispatcherHandle,
}

impl FlowlogNode {
    /// Wires a node from explicit parts.
    pub fn assemble(
        config: &FlowlogConfig,
        backend: Arc<dyn CoordinationBackend>,
        accounts: Arc<dyn AccountDirectory>,
        collector: Arc<dyn FlowLogCollector>,
        purger: Arc<dyn ArchivePurger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = CoordinationStore::from_config(backend, config);
        let paths = CoordinationPaths::from_config(config);
        let worker = Arc::new(FlowlogWorker::new(
            store.clone(),
            paths,
            collector,
            purger,
        ));
        let (dispatcher, workers) = LocalDispatcher::spawn(
            worker.clone(),
            config.worker_concurrency,
            config.dispatch_retry.clone(),
        );
        let coordinator = Arc::new(PeriodicCoordinator::new(
            config,
            store.clone(),
            accounts,
            Arc::new(dispatcher),
            clock,
        ));
        Self {
            store,
            coordinator,
            worker,
            workers,
        }
    }

    /// Wires the production node: filesystem coordination, HTTP upstream and
    /// filesystem archive.
    pub fn from_config(config: &FlowlogConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let archive = FsArchive::new(
            config.archive_root.clone(),
            config.purge_retention(),
            clock.clone(),
        );
        let collector = ArchivingCollector::new(
            Arc::new(HttpFlowLogSource::new(&config.upstream)?),
            archive.clone(),
            config.collection_window_duration(),
            clock.clone(),
        );
        Ok(Self::assemble(
            config,
            Arc::new(FsCoordinationBackend::new(config.coordination_root.clone())),
            Arc::new(HttpAccountDirectory::new(&config.upstream)?),
            Arc::new(collector),
            Arc::new(archive),
            clock,
        ))
    }

    /// Closes the dispatch queue and waits for queued work to finish.
    pub async fn drain(self) -> Result<()> {
        let Self {
            coordinator,
            workers,
            ..
        } = self;
        drop(coordinator);
        workers.drain().await
    }

    /// Stops the local workers once their current chains finish.
    pub async fn shutdown(self) -> Result<()> {
        self.workers.shutdown().await
    }
}
