//! Pending-task priority queue with an id index.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use super::model::{Task, TaskFn, TaskPriority};

/// Heap key: higher priority first, then lower sequence (FIFO within a band)
#[derive(Debug, PartialEq, Eq)]
struct QueueKey {
    priority: TaskPriority,
    sequence: u64,
    task_id: String,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct PendingEntry {
    task: Task,
    job: TaskFn,
}

/// Max-heap of pending tasks. Every heap key has exactly one entry in `entries`.
#[derive(Default)]
pub(crate) struct PendingQueue {
    heap: BinaryHeap<QueueKey>,
    entries: HashMap<String, PendingEntry>,
}

impl PendingQueue {
    pub(crate) fn push(&mut self, task: Task, job: TaskFn, sequence: u64) {
        self.heap.push(QueueKey {
            priority: task.priority,
            sequence,
            task_id: task.id.clone(),
        });
        self.entries.insert(task.id.clone(), PendingEntry { task, job });
    }

    pub(crate) fn pop(&mut self) -> Option<(Task, TaskFn)> {
        while let Some(key) = self.heap.pop() {
            if let Some(entry) = self.entries.remove(&key.task_id) {
                return Some((entry.task, entry.job));
            }
        }
        None
    }

    pub(crate) fn get(&self, task_id: &str) -> Option<&Task> {
        self.entries.get(task_id).map(|entry| &entry.task)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending tasks in the order they would be dequeued
    pub(crate) fn tasks_in_order(&self) -> Vec<Task> {
        let mut keys: Vec<&QueueKey> = self.heap.iter().collect();
        keys.sort_by(|a, b| b.cmp(a));
        keys.into_iter()
            .filter_map(|key| self.get(&key.task_id).cloned())
            .collect()
    }

    pub(crate) fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.entries.values().map(|entry| &entry.task)
    }
}
