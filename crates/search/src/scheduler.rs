//! Priority work queues consulted by the executor's dispatch loop.

use std::collections::VecDeque;

use crate::types::SearchableId;

/// Why a node sits in a queue. Variants are listed in dispatch priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    /// Query changed and the node already holds a result.
    Refresh,
    /// The node lost its last parent.
    Removal,
    /// Reactive invalidation, or a query change for a node without a result.
    Update,
    /// Newly discovered child.
    Addition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Work {
    pub kind: WorkKind,
    pub id: SearchableId,
}

/// Four FIFO queues popped strictly in [`WorkKind`] order.
///
/// Queues do not deduplicate; callers guard pushes with the node's scheduling
/// flags.
#[derive(Debug, Default)]
pub struct WorkQueues {
    refresh: VecDeque<SearchableId>,
    removal: VecDeque<SearchableId>,
    update: VecDeque<SearchableId>,
    addition: VecDeque<SearchableId>,
}

impl WorkQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: WorkKind, id: SearchableId) {
        self.queue_mut(kind).push_back(id);
    }

    /// Takes one entry from the highest-priority non-empty queue.
    pub fn pop(&mut self) -> Option<Work> {
        [
            WorkKind::Refresh,
            WorkKind::Removal,
            WorkKind::Update,
            WorkKind::Addition,
        ]
        .into_iter()
        .find_map(|kind| self.queue_mut(kind).pop_front().map(|id| Work { kind, id }))
    }

    pub fn len(&self) -> usize {
        self.refresh.len() + self.removal.len() + self.update.len() + self.addition.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.refresh.clear();
        self.removal.clear();
        self.update.clear();
        self.addition.clear();
    }

    fn queue_mut(&mut self, kind: WorkKind) -> &mut VecDeque<SearchableId> {
        match kind {
            WorkKind::Refresh => &mut self.refresh,
            WorkKind::Removal => &mut self.removal,
            WorkKind::Update => &mut self.update,
            WorkKind::Addition => &mut self.addition,
        }
    }
}
