//! Priority queue of pending retrieval tasks.
//!
//! Tasks are ordered by priority (higher values first, total order over
//! `f32`), then by submission sequence (FIFO within equal priority).

use super::service::TaskId;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A task waiting for a worker.
#[derive(Debug, Clone, Copy)]
pub struct QueuedTask {
    pub id: TaskId,
    pub priority: f32,
    sequence: u64,
}

impl QueuedTask {
    pub fn new(id: TaskId, priority: f32, sequence: u64) -> Self {
        Self {
            id,
            priority,
            sequence,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

// Ordering for BinaryHeap: higher priority first, then lower sequence (older) first
impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.priority.total_cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            ordering => ordering,
        }
    }
}

/// Max-heap of queued tasks.
///
/// Not thread-safe; the service keeps it inside its registry mutex.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueuedTask>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: QueuedTask) {
        self.heap.push(task);
    }

    /// Removes and returns the highest-priority task.
    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.heap.pop()
    }

    pub fn peek(&self) -> Option<&QueuedTask> {
        self.heap.peek()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Removes the task with `id`. Returns whether it was queued.
    pub fn remove(&mut self, id: TaskId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|t| t.id != id);
        self.heap.len() != before
    }

    /// Raises the priority of a queued task, keeping its sequence.
    ///
    /// Lower priorities are ignored. Returns whether the task was re-ordered.
    pub fn raise(&mut self, id: TaskId, priority: f32) -> bool {
        let Some(current) = self.heap.iter().find(|t| t.id == id).copied() else {
            return false;
        };
        if priority.total_cmp(&current.priority) != Ordering::Greater {
            return false;
        }
        self.heap.retain(|t| t.id != id);
        self.heap.push(QueuedTask {
            priority,
            ..current
        });
        true
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: u64, priority: f32, sequence: u64) -> QueuedTask {
        QueuedTask::new(TaskId(id), priority, sequence)
    }

    #[test]
    fn test_higher_priority_first() {
        let mut queue = PriorityQueue::new();
        queue.push(task(1, 0.0, 0));
        queue.push(task(2, 10.0, 1));
        queue.push(task(3, -5.0, 2));

        assert_eq!(queue.pop().unwrap().id, TaskId(2));
        assert_eq!(queue.pop().unwrap().id, TaskId(1));
        assert_eq!(queue.pop().unwrap().id, TaskId(3));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = PriorityQueue::new();
        for i in 0..5 {
            queue.push(task(i, 1.0, i));
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).map(|t| t.id.0).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_nan_priority_is_ordered() {
        let mut queue = PriorityQueue::new();
        queue.push(task(1, f32::NAN, 0));
        queue.push(task(2, 1.0, 1));
        assert_eq!(queue.len(), 2);
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_some());
    }

    #[test]
    fn test_remove() {
        let mut queue = PriorityQueue::new();
        queue.push(task(1, 1.0, 0));
        queue.push(task(2, 1.0, 1));
        assert!(queue.remove(TaskId(1)));
        assert!(!queue.remove(TaskId(1)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().unwrap().id, TaskId(2));
    }

    #[test]
    fn test_raise_reorders() {
        let mut queue = PriorityQueue::new();
        queue.push(task(1, 1.0, 0));
        queue.push(task(2, 2.0, 1));

        assert!(!queue.raise(TaskId(1), 0.5));
        assert!(queue.raise(TaskId(1), 3.0));
        assert!(!queue.raise(TaskId(99), 3.0));
        assert_eq!(queue.pop().unwrap().id, TaskId(1));
    }
}
