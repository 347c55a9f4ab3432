//! Shard-aware scan scheduler: groups pending work by chunk so co-located
//! scans share one sequential pass over shared tables, gated by the memory
//! manager.
//!
//! The scheduler drains the active chunk before advancing. A memory-starved
//! chunk is never skipped; skipping would fan page locks across too many
//! chunks and thrash.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use condor_common::{ChunkId, CondorResult};

use crate::chunk_tasks::{ChunkTasks, ReadyState};
use crate::mem_man::MemMan;
use crate::task::Task;

/// Scheduler-level bookkeeping consulted while scanning past `NotReady`
/// chunks: how many chunks the owning scheduler already has active, and
/// whether a candidate is among them.
pub trait SchedulerPolicy: Send + Sync {
    fn active_chunk_count(&self) -> usize;
    fn max_active_chunks(&self) -> usize;
    fn chunk_already_active(&self, chunk_id: ChunkId) -> bool;
}

/// Policy that never limits how many chunks may be active.
pub struct UnlimitedActiveChunks;

impl SchedulerPolicy for UnlimitedActiveChunks {
    fn active_chunk_count(&self) -> usize {
        0
    }
    fn max_active_chunks(&self) -> usize {
        usize::MAX
    }
    fn chunk_already_active(&self, _chunk_id: ChunkId) -> bool {
        false
    }
}

struct Inner {
    chunk_map: BTreeMap<ChunkId, ChunkTasks>,
    active_chunk: Option<ChunkId>,
    ready_chunk: Option<ChunkId>,
    task_count: usize,
    next_seq: u64,
}

/// Snapshot of scheduler state for logging and tests.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub chunk_count: usize,
    pub task_count: usize,
    pub active_chunk: Option<ChunkId>,
}

/// The two-level shard scan queue. One mutex guards all state; `ChunkTasks`
/// relies on it.
pub struct ChunkTasksQueue {
    inner: Mutex<Inner>,
    mem_man: Arc<dyn MemMan>,
    policy: Arc<dyn SchedulerPolicy>,
}

impl ChunkTasksQueue {
    pub fn new(mem_man: Arc<dyn MemMan>) -> Self {
        Self::with_policy(mem_man, Arc::new(UnlimitedActiveChunks))
    }

    pub fn with_policy(mem_man: Arc<dyn MemMan>, policy: Arc<dyn SchedulerPolicy>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                chunk_map: BTreeMap::new(),
                active_chunk: None,
                ready_chunk: None,
                task_count: 0,
                next_seq: 0,
            }),
            mem_man,
            policy,
        }
    }

    /// Queue a task with the other tasks of its chunk.
    pub fn queue_task(&self, task: Arc<Task>) {
        let mut inner = self.inner.lock();
        let chunk_id = task.chunk_id();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.task_count += 1;
        inner
            .chunk_map
            .entry(chunk_id)
            .or_insert_with(|| ChunkTasks::new(chunk_id))
            .queue(task, seq);
    }

    /// True when a task could be handed out right now.
    pub fn ready(&self, flexible: bool) -> CondorResult<bool> {
        let mut inner = self.inner.lock();
        self.ready_locked(&mut inner, flexible)
    }

    /// Pop the next admissible task, or `None` when nothing is runnable.
    /// The caller waits on its own notification and retries.
    pub fn get_task(&self, flexible: bool) -> CondorResult<Option<Arc<Task>>> {
        let mut inner = self.inner.lock();
        self.ready_locked(&mut inner, flexible)?;
        if let Some(chunk_id) = inner.ready_chunk.take() {
            if let Some(ct) = inner.chunk_map.get_mut(&chunk_id) {
                if let Some(task) = ct.take_ready() {
                    tracing::debug!(chunk_id = %chunk_id, task = %task.id_str(), "task dispatched");
                    return Ok(Some(task));
                }
            }
        }
        Ok(None)
    }

    /// Called when a runner finishes a task.
    pub fn task_complete(&self, task: &Task) {
        let mut inner = self.inner.lock();
        if let Some(ct) = inner.chunk_map.get_mut(&task.chunk_id()) {
            ct.task_complete(task);
            inner.task_count = inner.task_count.saturating_sub(1);
        }
    }

    /// Remove a still-queued task (cancellation / redirect). A task already
    /// in flight is not removable; it completes naturally.
    pub fn remove_task(&self, task: &Task) -> Option<Arc<Task>> {
        let mut inner = self.inner.lock();
        let removed = inner.chunk_map.get_mut(&task.chunk_id())?.remove_task(task);
        if removed.is_some() {
            inner.task_count = inner.task_count.saturating_sub(1);
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().chunk_map.is_empty()
    }

    /// Queued plus in-flight tasks.
    pub fn task_count(&self) -> usize {
        self.inner.lock().task_count
    }

    /// True when `get_task` would source its next task from a different
    /// chunk than the current active one. Used by owners to pick a good
    /// moment for priority changes.
    pub fn next_task_different_chunk(&self) -> bool {
        let inner = self.inner.lock();
        match inner.active_chunk {
            None => true,
            Some(chunk_id) => inner
                .chunk_map
                .get(&chunk_id)
                .map(|ct| ct.ready_to_advance())
                .unwrap_or(true),
        }
    }

    pub fn active_chunk_id(&self) -> Option<ChunkId> {
        self.inner.lock().active_chunk
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let inner = self.inner.lock();
        SchedulerSnapshot {
            chunk_count: inner.chunk_map.len(),
            task_count: inner.task_count,
            active_chunk: inner.active_chunk,
        }
    }

    /// Invariant: the running task count equals the per-chunk totals.
    #[cfg(test)]
    pub fn counts_consistent(&self) -> bool {
        let inner = self.inner.lock();
        let sum: usize = inner.chunk_map.values().map(|ct| ct.task_total()).sum();
        sum == inner.task_count
    }

    /// Next chunk id after `key` in map order, wrapping to the first.
    fn next_chunk(map: &BTreeMap<ChunkId, ChunkTasks>, key: ChunkId) -> Option<ChunkId> {
        use std::ops::Bound::{Excluded, Unbounded};
        map.range((Excluded(key), Unbounded))
            .next()
            .map(|(k, _)| *k)
            .or_else(|| map.keys().next().copied())
    }

    /// Core admission pass. Starts at the active chunk and only moves on
    /// when the current chunk has nothing left to offer; the active chunk
    /// itself advances only once fully drained.
    fn ready_locked(&self, inner: &mut Inner, flexible: bool) -> CondorResult<bool> {
        if inner.ready_chunk.is_some() {
            return Ok(true);
        }
        if inner.chunk_map.is_empty() {
            return Ok(false);
        }

        // If the active chunk is invalid, start at the beginning.
        let valid = inner
            .active_chunk
            .map(|k| inner.chunk_map.contains_key(&k))
            .unwrap_or(false);
        if !valid {
            let first = *inner.chunk_map.keys().next().expect("map not empty");
            inner.active_chunk = Some(first);
            // Flag it active so newly queued tasks go to pending.
            inner
                .chunk_map
                .get_mut(&first)
                .expect("first key present")
                .set_active(true);
        }
        let active = inner.active_chunk.expect("set above");

        match inner
            .chunk_map
            .get_mut(&active)
            .expect("active chunk present")
            .ready(flexible, &*self.mem_man)?
        {
            ReadyState::Ready => {
                inner.ready_chunk = Some(active);
                return Ok(true);
            }
            ReadyState::NoResources => {
                // Do not advance past a starved chunk.
                return Ok(false);
            }
            ReadyState::NotReady => {}
        }

        // Should the active chunk be advanced?
        if inner
            .chunk_map
            .get(&active)
            .expect("active chunk present")
            .ready_to_advance()
        {
            let next = Self::next_chunk(&inner.chunk_map, active).expect("map not empty");
            {
                let old = inner
                    .chunk_map
                    .get_mut(&active)
                    .expect("active chunk present");
                // Clearing the flag promotes any pending tasks.
                old.set_active(false);
            }
            if inner
                .chunk_map
                .get(&active)
                .expect("active chunk present")
                .is_empty()
            {
                inner.chunk_map.remove(&active);
                if next == active {
                    // That was the last chunk.
                    inner.active_chunk = None;
                    return Ok(false);
                }
            }
            inner.active_chunk = Some(next);
            let new_active = inner
                .chunk_map
                .get_mut(&next)
                .expect("next chunk present");
            new_active.move_pending_to_active();
            new_active.set_active(true);
            tracing::debug!(chunk_id = %next, "active chunk advanced");
        }

        // Scan forward (with wrap) past chunks with nothing to run. Stop at
        // READY or NO_RESOURCES, or after one full cycle.
        let start = inner.active_chunk.expect("set above");
        let mut key = start;
        let mut state = inner
            .chunk_map
            .get_mut(&key)
            .expect("chunk present")
            .ready(flexible, &*self.mem_man)?;
        while state == ReadyState::NotReady {
            key = Self::next_chunk(&inner.chunk_map, key).expect("map not empty");
            if key == start {
                return Ok(false);
            }
            if self.policy.active_chunk_count() >= self.policy.max_active_chunks()
                && !self.policy.chunk_already_active(key)
            {
                // At the scheduler-wide active-chunk limit; do not touch a
                // fresh chunk.
                return Ok(false);
            }
            state = inner
                .chunk_map
                .get_mut(&key)
                .expect("chunk present")
                .ready(flexible, &*self.mem_man)?;
        }
        if state == ReadyState::NoResources {
            // Advancing past a chunk without enough resources would cause
            // scheduling trouble well beyond this one query.
            return Ok(false);
        }
        inner.ready_chunk = Some(key);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_man::{BudgetMemMan, GrantAllMemMan};
    use crate::task::NullReplyChannel;
    use condor_common::config::MemManConfig;
    use condor_common::{JobId, QueryId, ScanInfo, ScanRating, TableRef};
    use condor_proto::Fragment;

    fn task(query: u64, job: u32, chunk: i32, rating: i32, tables: &[&str]) -> Arc<Task> {
        Task::new(
            QueryId(query),
            JobId(job),
            ChunkId(chunk),
            ScanInfo {
                info_tables: tables.iter().map(|t| TableRef::new("LSST", *t)).collect(),
                rating: ScanRating(rating),
            },
            Fragment {
                result_table: "r".into(),
                query: "SELECT 1".into(),
                subchunks: vec![],
            },
            Arc::new(NullReplyChannel),
        )
    }

    fn drain(q: &ChunkTasksQueue) -> Vec<(i32, u64)> {
        let mut order = Vec::new();
        while let Some(t) = q.get_task(false).unwrap() {
            order.push((t.chunk_id().0, t.query_id().0));
            q.task_complete(&t);
        }
        order
    }

    #[test]
    fn test_empty_queue() {
        let q = ChunkTasksQueue::new(Arc::new(GrantAllMemMan::new()));
        assert!(q.is_empty());
        assert!(!q.ready(false).unwrap());
        assert!(q.get_task(false).unwrap().is_none());
        assert!(q.next_task_different_chunk());
    }

    #[test]
    fn test_single_chunk_fifo_within_rating() {
        let q = ChunkTasksQueue::new(Arc::new(GrantAllMemMan::new()));
        q.queue_task(task(1, 0, 5, 0, &[]));
        q.queue_task(task(2, 0, 5, 0, &[]));
        q.queue_task(task(3, 0, 5, 0, &[]));
        assert_eq!(q.task_count(), 3);
        let order = drain(&q);
        assert_eq!(order, vec![(5, 1), (5, 2), (5, 3)]);
        assert_eq!(q.task_count(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_active_chunk_drained_before_advance() {
        let q = ChunkTasksQueue::new(Arc::new(GrantAllMemMan::new()));
        q.queue_task(task(1, 0, 1, 0, &[]));
        q.queue_task(task(2, 0, 2, 0, &[]));
        q.queue_task(task(3, 0, 1, 0, &[]));
        let order = drain(&q);
        // Both chunk-1 tasks run before chunk 2, despite interleaved arrival.
        assert_eq!(order, vec![(1, 1), (1, 3), (2, 2)]);
    }

    #[test]
    fn test_slow_tables_first_within_chunk() {
        let q = ChunkTasksQueue::new(Arc::new(GrantAllMemMan::new()));
        q.queue_task(task(1, 0, 1, 3, &[]));
        q.queue_task(task(2, 0, 1, 1, &[]));
        q.queue_task(task(3, 0, 1, 2, &[]));
        let order = drain(&q);
        assert_eq!(order, vec![(1, 2), (1, 3), (1, 1)]);
    }

    #[test]
    fn test_starved_chunk_blocks_scheduler() {
        let mm = Arc::new(BudgetMemMan::new(&MemManConfig {
            budget_bytes: 100,
            default_table_bytes: 10,
        }));
        mm.register("LSST", "Object", ChunkId(7), 500);
        mm.register("LSST", "Object", ChunkId(8), 10);
        let q = ChunkTasksQueue::new(Arc::clone(&mm) as Arc<dyn MemMan>);
        for job in 0..4 {
            q.queue_task(task(1, job, 7, 0, &["Object"]));
        }
        q.queue_task(task(1, 9, 8, 0, &["Object"]));

        // Chunk 7 is starved; the scheduler must not skip to chunk 8.
        assert!(!q.ready(false).unwrap());
        assert!(q.get_task(false).unwrap().is_none());
        assert_eq!(q.active_chunk_id(), Some(ChunkId(7)));

        // Once memory recovers, the same tasks become ready and run.
        mm.set_budget(1000);
        let order = drain(&q);
        assert_eq!(
            order,
            vec![(7, 1), (7, 1), (7, 1), (7, 1), (8, 1)]
        );
    }

    #[test]
    fn test_task_count_invariant_under_mixed_ops() {
        let q = ChunkTasksQueue::new(Arc::new(GrantAllMemMan::new()));
        q.queue_task(task(1, 0, 1, 0, &[]));
        q.queue_task(task(1, 1, 1, 0, &[]));
        q.queue_task(task(1, 2, 2, 0, &[]));
        assert!(q.counts_consistent());

        let t = q.get_task(false).unwrap().unwrap();
        // Popped into in-flight: still counted.
        assert_eq!(q.task_count(), 3);
        assert!(q.counts_consistent());

        q.task_complete(&t);
        assert_eq!(q.task_count(), 2);
        assert!(q.counts_consistent());
    }

    #[test]
    fn test_remove_task_decrements_only_when_erased() {
        let q = ChunkTasksQueue::new(Arc::new(GrantAllMemMan::new()));
        let a = task(1, 0, 1, 0, &[]);
        let b = task(1, 1, 1, 0, &[]);
        q.queue_task(Arc::clone(&a));
        q.queue_task(Arc::clone(&b));

        assert!(q.remove_task(&a).is_some());
        assert_eq!(q.task_count(), 1);

        // b goes in flight; not removable, count unchanged.
        let got = q.get_task(false).unwrap().unwrap();
        assert!(q.remove_task(&got).is_none());
        assert_eq!(q.task_count(), 1);
        assert!(q.counts_consistent());
    }

    #[test]
    fn test_tasks_queued_on_active_chunk_wait_for_next_visit() {
        let q = ChunkTasksQueue::new(Arc::new(GrantAllMemMan::new()));
        q.queue_task(task(1, 0, 1, 0, &[]));
        q.queue_task(task(2, 0, 2, 0, &[]));

        let t1 = q.get_task(false).unwrap().unwrap();
        assert_eq!(t1.chunk_id(), ChunkId(1));
        // Chunk 1 is active now; a new task for it lands on pending.
        q.queue_task(task(3, 0, 1, 0, &[]));
        q.task_complete(&t1);

        let order = drain(&q);
        // The pending task does not extend chunk 1's turn; chunk 2 runs
        // first and the scheduler wraps back.
        assert_eq!(order, vec![(2, 2), (1, 3)]);
    }

    #[test]
    fn test_next_task_different_chunk() {
        let q = ChunkTasksQueue::new(Arc::new(GrantAllMemMan::new()));
        q.queue_task(task(1, 0, 1, 0, &[]));
        assert!(q.next_task_different_chunk());

        let t = q.get_task(false).unwrap().unwrap();
        // Task in flight on the active chunk: still draining it.
        assert!(!q.next_task_different_chunk());
        q.task_complete(&t);
        assert!(q.next_task_different_chunk());
    }

    struct TwoActivePolicy;
    impl SchedulerPolicy for TwoActivePolicy {
        fn active_chunk_count(&self) -> usize {
            2
        }
        fn max_active_chunks(&self) -> usize {
            2
        }
        fn chunk_already_active(&self, chunk_id: ChunkId) -> bool {
            chunk_id == ChunkId(1)
        }
    }

    #[test]
    fn test_policy_limit_stops_scan_at_fresh_chunk() {
        // Chunk 1 has only an in-flight task (NotReady), chunk 2 has work,
        // but the policy is at its limit and chunk 2 is not active yet.
        let q = ChunkTasksQueue::with_policy(
            Arc::new(GrantAllMemMan::new()),
            Arc::new(TwoActivePolicy),
        );
        q.queue_task(task(1, 0, 1, 0, &[]));
        q.queue_task(task(2, 0, 2, 0, &[]));

        let t = q.get_task(false).unwrap().unwrap();
        assert_eq!(t.chunk_id(), ChunkId(1));
        // Chunk 1 not drained (in-flight), scan reaches chunk 2, policy
        // stops it.
        assert!(!q.ready(false).unwrap());
        assert!(q.get_task(false).unwrap().is_none());

        q.task_complete(&t);
        let order = drain(&q);
        assert_eq!(order, vec![(2, 2)]);
    }

    #[test]
    fn test_chunks_visited_in_numeric_order() {
        let q = ChunkTasksQueue::new(Arc::new(GrantAllMemMan::new()));
        q.queue_task(task(1, 0, 30, 0, &[]));
        q.queue_task(task(2, 0, 10, 0, &[]));
        q.queue_task(task(3, 0, 20, 0, &[]));
        let order = drain(&q);
        assert_eq!(order, vec![(10, 2), (20, 3), (30, 1)]);
    }
}
