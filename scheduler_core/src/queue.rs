use std::{cmp::Ordering, collections::BinaryHeap};

use chrono::{DateTime, Utc};

use crate::task::{Task, TaskId, TaskPriority};

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: TaskPriority,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: TaskId,
}

// BinaryHeap is a max-heap, so the comparison is inverted: the most urgent
// priority, then the oldest creation time, then the earliest push wins.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of runnable task ids keyed by `(priority, created_at)`.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    heap: BinaryHeap<QueueEntry>,
    seq: u64,
}

impl DispatchQueue {
    pub fn push(&mut self, task: &Task) {
        self.seq += 1;
        self.heap.push(QueueEntry {
            priority: task.priority,
            created_at: task.created_at,
            seq: self.seq,
            task_id: task.task_id.clone(),
        });
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        self.heap.pop().map(|entry| entry.task_id)
    }

    pub fn remove(&mut self, task_id: &str) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.task_id != task_id);
        self.heap.len() != before
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
