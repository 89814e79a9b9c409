//! Admission queue.
//!
//! Orders queued tasks by priority (higher first), then creation time, then
//! insertion order. Removal is lazy: stale heap entries are skipped on pop.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::domain::DownloadTask;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    created_at_ms: i64,
    seq: u64,
    task_id: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at_ms.cmp(&self.created_at_ms))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct AdmissionQueue {
    heap: BinaryHeap<QueueEntry>,
    /// Live entries: task id to the sequence number of its heap entry.
    live: HashMap<String, u64>,
    next_seq: u64,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a task. Returns `false` if it is already queued.
    pub fn push(&mut self, task: &DownloadTask) -> bool {
        if self.live.contains_key(&task.id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(task.id.clone(), seq);
        self.heap.push(QueueEntry {
            priority: task.spec.priority,
            created_at_ms: task.created_at.timestamp_millis(),
            seq,
            task_id: task.id.clone(),
        });
        true
    }

    /// Take the next task to admit.
    pub fn pop(&mut self) -> Option<String> {
        while let Some(entry) = self.heap.pop() {
            if self.live.get(&entry.task_id) == Some(&entry.seq) {
                self.live.remove(&entry.task_id);
                return Some(entry.task_id);
            }
        }
        None
    }

    /// Drop a task from the queue. Returns whether it was queued.
    pub fn remove(&mut self, task_id: &str) -> bool {
        self.live.remove(task_id).is_some()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.live.contains_key(task_id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DownloadSpec, MediaType};
    use chrono::{Duration, Utc};

    fn task(priority: i32, age_secs: i64) -> DownloadTask {
        let mut task = DownloadTask::new(
            DownloadSpec::new("https://x/a.mp4", MediaType::File).with_priority(priority),
        );
        task.created_at = Utc::now() - Duration::seconds(age_secs);
        task
    }

    #[test]
    fn test_priority_then_creation_order() {
        let mut queue = AdmissionQueue::new();
        let newer = task(0, 10);
        let older = task(0, 20);
        let urgent = task(5, 0);
        for t in [&newer, &older, &urgent] {
            assert!(queue.push(t));
        }

        assert_eq!(queue.pop(), Some(urgent.id));
        assert_eq!(queue.pop(), Some(older.id));
        assert_eq!(queue.pop(), Some(newer.id));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_same_timestamp_is_fifo() {
        let mut queue = AdmissionQueue::new();
        let first = task(0, 0);
        let mut second = task(0, 0);
        second.created_at = first.created_at;
        queue.push(&first);
        queue.push(&second);
        assert_eq!(queue.pop(), Some(first.id));
        assert_eq!(queue.pop(), Some(second.id));
    }

    #[test]
    fn test_remove_and_requeue() {
        let mut queue = AdmissionQueue::new();
        let a = task(1, 0);
        let b = task(0, 0);
        queue.push(&a);
        queue.push(&b);
        assert!(!queue.push(&a));

        assert!(queue.remove(&a.id));
        assert!(!queue.remove(&a.id));
        assert_eq!(queue.len(), 1);

        // The stale entry of `a` must not resurface after a re-push.
        assert!(queue.push(&a));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(a.id.clone()));
        assert_eq!(queue.pop(), Some(b.id));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }
}
