//! Recommended entrypoints grouped by role.
//!
//! `node` is what a daemon embedding the coordinator needs.
//! `backend` is the escape hatch for plugging in another coordination service
//! or upstream.

pub mod node {
    //! Running a node: configuration, assembly and the two cycle entry points.
    pub use crate::{
        CycleOutcome, CycleReport, FlowlogConfig, FlowlogError, FlowlogNode, PeriodicCoordinator,
        PeriodicScheduler, Result,
    };
}

pub mod backend {
    //! Contracts to implement when swapping a collaborator.
    pub use crate::coordination::{CoordinationBackend, LockToken};
    pub use crate::dispatch::{Dispatcher, TaskChain};
    pub use crate::upstream::{AccountDirectory, ArchivePurger, FlowLogCollector, FlowLogSource};
}
