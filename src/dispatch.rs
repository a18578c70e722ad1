//! Units of work handed from the coordinator to whichever worker picks them up.

pub mod local;

use crate::core::{AccountDescriptor, Result, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use local::{LocalDispatcher, LocalDispatcherHandle};

/// Where a collection task starts reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartTime {
    /// Resume from this cursor.
    At(Timestamp),
    /// No cursor yet: the collector uses its default lookback window.
    Default,
    /// Start where the previous task of the same chain ended.
    FromPrevious,
}

impl StartTime {
    pub fn from_cursor(cursor: Option<Timestamp>) -> Self {
        match cursor {
            Some(ts) => Self::At(ts),
            None => Self::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowlogTask {
    Collect {
        account: AccountDescriptor,
        start_time: StartTime,
    },
    Purge {
        account: AccountDescriptor,
    },
}

impl FlowlogTask {
    pub fn account(&self) -> &AccountDescriptor {
        match self {
            Self::Collect { account, .. } | Self::Purge { account } => account,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Collect { .. } => "collect",
            Self::Purge { .. } => "purge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task: FlowlogTask,
    /// Run only after the previous task of the chain has completed.
    pub depends_on_previous: bool,
}

/// Ordered work items submitted together.
///
/// Items flagged `depends_on_previous` never start before their predecessor
/// finished; a chain of one is a plain independent task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskChain {
    items: Vec<ScheduledTask>,
}

impl TaskChain {
    pub fn single(task: FlowlogTask) -> Self {
        Self {
            items: vec![ScheduledTask {
                task,
                depends_on_previous: false,
            }],
        }
    }

    /// Builds a strictly sequential chain: every task after the first depends
    /// on its predecessor.
    pub fn sequential(tasks: impl IntoIterator<Item = FlowlogTask>) -> Self {
        let items = tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| ScheduledTask {
                task,
                depends_on_previous: index > 0,
            })
            .collect();
        Self { items }
    }

    pub fn items(&self) -> &[ScheduledTask] {
        &self.items
    }

    pub fn into_items(self) -> Vec<ScheduledTask> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Fire-and-forget hand-off to the task queue.
///
/// `submit` returns once the chain is enqueued; completion is only observable
/// through the progress records the tasks write.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn submit(&self, chain: TaskChain) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_chain_links_every_item_after_the_first() {
        let account = AccountDescriptor::new("acc-1", "bucket");
        let chain = TaskChain::sequential((0..3).map(|_| FlowlogTask::Collect {
            account: account.clone(),
            start_time: StartTime::FromPrevious,
        }));
        let flags: Vec<bool> = chain
            .items()
            .iter()
            .map(|item| item.depends_on_previous)
            .collect();
        assert_eq!(flags, vec![false, true, true]);
    }

    #[test]
    fn single_chain_has_no_dependency() {
        let chain = TaskChain::single(FlowlogTask::Purge {
            account: AccountDescriptor::new("acc-1", "bucket"),
        });
        assert_eq!(chain.len(), 1);
        assert!(!chain.items()[0].depends_on_previous);
    }
}
