// Layer 1: Standard library imports
use std::cmp::Ordering;
use std::collections::BinaryHeap;

// Layer 2: Third-party crate imports
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// Layer 3: Internal module imports
// (none)

/// One scheduled task: a deadline, a stable sequence number, the payload,
/// and the token that can cancel it before it starts.
#[derive(Debug)]
pub struct ScheduledEntry<T> {
    execute_at: Instant,
    seq: u64,
    cancel: CancellationToken,
    task: T,
}

impl<T> ScheduledEntry<T> {
    /// The deadline of this entry.
    pub fn execute_at(&self) -> Instant {
        self.execute_at
    }

    /// Consume the entry, yielding the task payload.
    pub fn into_task(self) -> T {
        self.task
    }
}

// BinaryHeap is a max-heap; reverse the ordering to pop the earliest
// (deadline, seq) pair first.
impl<T> PartialEq for ScheduledEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.execute_at == other.execute_at && self.seq == other.seq
    }
}

impl<T> Eq for ScheduledEntry<T> {}

impl<T> PartialOrd for ScheduledEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ScheduledEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.execute_at, other.seq).cmp(&(self.execute_at, self.seq))
    }
}

/// Per-actor priority queue of delayed tasks.
///
/// Tasks execute in `(deadline, insertion sequence)` order, so two tasks
/// scheduled for the same instant run in the order they were scheduled.
/// Cancelled tasks are skipped at pop time; a deadline already armed for an
/// earlier entry needs no re-arming because the wake timer always tracks
/// [`TaskQueue::next_deadline`]. Waking early is harmless: draining rechecks
/// `now` and leaves not-yet-due entries queued.
///
/// The queue is owned by the actor's runner task; all mutation happens from
/// that task, so no lock is involved.
pub struct TaskQueue<T> {
    heap: BinaryHeap<ScheduledEntry<T>>,
    next_seq: u64,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), next_seq: 0 }
    }

    /// Schedule `task` for `execute_at`. Returns the token that cancels it.
    pub fn push(&mut self, execute_at: Instant, task: T, cancel: CancellationToken) -> CancellationToken {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ScheduledEntry { execute_at, seq, cancel: cancel.clone(), task });
        cancel
    }

    /// The earliest deadline still pending, pruning already-cancelled heads.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(head) = self.heap.peek() {
            if head.cancel.is_cancelled() {
                self.heap.pop();
                continue;
            }
            return Some(head.execute_at);
        }
        None
    }

    /// Pop the next task due at or before `now`, skipping cancelled entries.
    ///
    /// Call repeatedly to drain everything due; tasks come out in
    /// `(deadline, seq)` order.
    pub fn pop_due(&mut self, now: Instant) -> Option<T> {
        while let Some(head) = self.heap.peek() {
            if head.execute_at > now {
                return None;
            }
            // Unreachable None: peek above guarantees an entry.
            let entry = self.heap.pop()?;
            if entry.cancel.is_cancelled() {
                continue;
            }
            return Some(entry.task);
        }
        None
    }

    /// Remove and return every remaining entry, cancelled or not.
    ///
    /// Used at actor shutdown so each pending task's cancel hook can run.
    pub fn drain(&mut self) -> Vec<ScheduledEntry<T>> {
        self.heap.drain().collect()
    }

    /// Number of queued entries, including cancelled ones not yet pruned.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue_with(entries: &[(u64, &str)]) -> (TaskQueue<String>, Instant) {
        let base = Instant::now();
        let mut q = TaskQueue::new();
        for (offset_ms, tag) in entries {
            q.push(base + Duration::from_millis(*offset_ms), (*tag).to_string(), CancellationToken::new());
        }
        (q, base)
    }

    #[test]
    fn test_pops_in_deadline_order() {
        let (mut q, base) = queue_with(&[(30, "c"), (10, "a"), (20, "b")]);
        let now = base + Duration::from_millis(100);
        assert_eq!(q.pop_due(now).as_deref(), Some("a"));
        assert_eq!(q.pop_due(now).as_deref(), Some("b"));
        assert_eq!(q.pop_due(now).as_deref(), Some("c"));
        assert_eq!(q.pop_due(now), None);
    }

    #[test]
    fn test_equal_deadlines_run_fifo() {
        let (mut q, base) = queue_with(&[(10, "first"), (10, "second"), (10, "third")]);
        let now = base + Duration::from_millis(10);
        assert_eq!(q.pop_due(now).as_deref(), Some("first"));
        assert_eq!(q.pop_due(now).as_deref(), Some("second"));
        assert_eq!(q.pop_due(now).as_deref(), Some("third"));
    }

    #[test]
    fn test_not_due_stays_queued() {
        let (mut q, base) = queue_with(&[(50, "later")]);
        assert_eq!(q.pop_due(base + Duration::from_millis(10)), None);
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_due(base + Duration::from_millis(50)).as_deref(), Some("later"));
    }

    #[test]
    fn test_cancelled_entries_are_skipped() {
        let base = Instant::now();
        let mut q = TaskQueue::new();
        let token = q.push(base, "cancelled".to_string(), CancellationToken::new());
        q.push(base + Duration::from_millis(1), "kept".to_string(), CancellationToken::new());
        token.cancel();

        let now = base + Duration::from_millis(5);
        assert_eq!(q.pop_due(now).as_deref(), Some("kept"));
        assert_eq!(q.pop_due(now), None);
    }

    #[test]
    fn test_next_deadline_prunes_cancelled_head() {
        let base = Instant::now();
        let mut q = TaskQueue::new();
        let token = q.push(base, "cancelled".to_string(), CancellationToken::new());
        q.push(base + Duration::from_millis(40), "kept".to_string(), CancellationToken::new());
        token.cancel();

        assert_eq!(q.next_deadline(), Some(base + Duration::from_millis(40)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_drain_returns_everything() {
        let (mut q, _) = queue_with(&[(10, "a"), (20, "b")]);
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert!(q.is_empty());
    }
}
