//! Per-shard task bookkeeping: a slow-tables-first heap of runnable tasks,
//! a pending list for tasks that arrive while the shard is active, and the
//! set of tasks currently in flight.
//!
//! ChunkTasks has no lock of its own; it relies on the owning queue's mutex.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use condor_common::{ChunkId, CondorError, CondorResult, JobId, QueryId, ScanRating};

use crate::mem_man::{Handle, LockType, MemMan, MemManError, TableLock};
use crate::task::Task;

/// Outcome of asking a shard whether it can hand out a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Ready,
    NotReady,
    /// The memory manager refused the top task. The scheduler must not
    /// skip past this shard: fanning page locks across more shards would
    /// thrash.
    NoResources,
}

/// Heap entry ordering: slowest tables first (lowest scan rating), FIFO
/// within a rating class.
struct HeapEntry {
    rating: ScanRating,
    seq: u64,
    task: Arc<Task>,
}

impl HeapEntry {
    fn key(&self) -> (ScanRating, u64) {
        (self.rating, self.seq)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; reverse so the lowest key pops first.
        other.key().cmp(&self.key())
    }
}

/// All queued state for one shard.
pub struct ChunkTasks {
    chunk_id: ChunkId,
    active: bool,
    active_tasks: BinaryHeap<HeapEntry>,
    pending_tasks: Vec<HeapEntry>,
    in_flight: HashSet<(QueryId, JobId)>,
    ready_task: Option<Arc<Task>>,
    resource_starved: bool,
}

impl ChunkTasks {
    pub fn new(chunk_id: ChunkId) -> Self {
        Self {
            chunk_id,
            active: false,
            active_tasks: BinaryHeap::new(),
            pending_tasks: Vec::new(),
            in_flight: HashSet::new(),
            ready_task: None,
            resource_starved: false,
        }
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Queue a task. While the shard is active, new tasks go to the pending
    /// list so one hot shard cannot monopolize the scheduler.
    pub fn queue(&mut self, task: Arc<Task>, seq: u64) {
        let entry = HeapEntry {
            rating: task.scan_info().rating,
            seq,
            task,
        };
        let state = if self.active {
            self.pending_tasks.push(entry);
            "PENDING"
        } else {
            self.active_tasks.push(entry);
            "ACTIVE"
        };
        tracing::debug!(
            chunk_id = %self.chunk_id,
            state = state,
            active = self.active_tasks.len(),
            pending = self.pending_tasks.len(),
            "queued task"
        );
    }

    /// Flag this shard as the one the scheduler is draining. Clearing the
    /// flag promotes pending tasks.
    pub fn set_active(&mut self, active: bool) {
        if self.active && !active {
            self.move_pending_to_active();
        }
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn move_pending_to_active(&mut self) {
        for entry in self.pending_tasks.drain(..) {
            self.active_tasks.push(entry);
        }
    }

    /// True when there is nothing queued (in-flight tasks do not count).
    pub fn is_empty(&self) -> bool {
        self.active_tasks.is_empty() && self.pending_tasks.is_empty() && self.ready_task.is_none()
    }

    /// The scheduler may advance past this shard only when nothing is
    /// runnable and nothing is in flight.
    pub fn ready_to_advance(&self) -> bool {
        self.active_tasks.is_empty() && self.ready_task.is_none() && self.in_flight.is_empty()
    }

    /// @return old value.
    pub fn set_resource_starved(&mut self, starved: bool) -> bool {
        let old = self.resource_starved;
        self.resource_starved = starved;
        old
    }

    pub fn is_resource_starved(&self) -> bool {
        self.resource_starved
    }

    /// Can this shard hand out a task? Cheap in the common nothing-to-do
    /// path; only the top task ever talks to the memory manager.
    pub fn ready(&mut self, flexible: bool, mem_man: &dyn MemMan) -> CondorResult<ReadyState> {
        if self.ready_task.is_some() {
            return Ok(ReadyState::Ready);
        }
        let Some(top) = self.active_tasks.peek() else {
            return Ok(ReadyState::NotReady);
        };
        let task = Arc::clone(&top.task);

        if !task.has_mem_handle() {
            if task.chunk_id() != self.chunk_id {
                // Survivable, but it defeats shared page residency.
                tracing::error!(
                    chunk_id = %self.chunk_id,
                    task_chunk = %task.chunk_id(),
                    task = %task.id_str(),
                    "task queued on wrong chunk"
                );
            }
            let lock = if flexible {
                LockType::Flexible
            } else {
                LockType::Required
            };
            let locks: Vec<TableLock> = task
                .scan_info()
                .info_tables
                .iter()
                .map(|t| TableLock {
                    table: t.clone(),
                    lock,
                })
                .collect();
            match mem_man.prepare(&locks, self.chunk_id) {
                Ok(handle) => {
                    task.set_mem_handle(handle);
                    self.set_resource_starved(false);
                    tracing::debug!(
                        chunk_id = %self.chunk_id,
                        task = %task.id_str(),
                        handle = handle.0,
                        flexible = flexible,
                        "memory handle granted"
                    );
                }
                Err(MemManError::OutOfMemory { needed, available }) => {
                    self.set_resource_starved(true);
                    tracing::debug!(
                        chunk_id = %self.chunk_id,
                        needed = needed,
                        available = available,
                        "shard starved for memory"
                    );
                    return Ok(ReadyState::NoResources);
                }
                Err(MemManError::NotFound(table)) => {
                    // The scan will fail cleanly on the missing table and
                    // the czar retries; run it with the empty handle.
                    tracing::error!(
                        chunk_id = %self.chunk_id,
                        task = %task.id_str(),
                        table = %table,
                        "memory manager: chunk table not found"
                    );
                    task.set_mem_handle(Handle::EMPTY);
                    self.set_resource_starved(false);
                }
                Err(MemManError::Io(msg)) => {
                    // Any file-system error here is unrecoverable for the
                    // worker.
                    return Err(CondorError::fatal(
                        "E-MEMMAN-001",
                        format!("memory manager file system error: {msg}"),
                    ));
                }
            }
        }

        let entry = self.active_tasks.pop().expect("peeked entry must pop");
        self.ready_task = Some(entry.task);
        Ok(ReadyState::Ready)
    }

    /// Hand out the cached ready task and track it as in flight.
    pub fn take_ready(&mut self) -> Option<Arc<Task>> {
        let task = self.ready_task.take()?;
        if task.chunk_id() == self.chunk_id {
            self.in_flight.insert((task.query_id(), task.job_id()));
        }
        Some(task)
    }

    pub fn task_complete(&mut self, task: &Task) {
        self.in_flight.remove(&(task.query_id(), task.job_id()));
    }

    /// Remove a queued task (cancellation). In-flight tasks are not
    /// removable; they finish naturally.
    pub fn remove_task(&mut self, task: &Task) -> Option<Arc<Task>> {
        let query_id = task.query_id();
        let job_id = task.job_id();

        let mut entries: Vec<HeapEntry> = std::mem::take(&mut self.active_tasks).into_vec();
        let mut removed = None;
        if let Some(pos) = entries
            .iter()
            .position(|e| e.task.ids_match(query_id, job_id))
        {
            removed = Some(entries.remove(pos).task);
        }
        self.active_tasks = entries.into_iter().collect();
        if removed.is_some() {
            return removed;
        }

        if let Some(pos) = self
            .pending_tasks
            .iter()
            .position(|e| e.task.ids_match(query_id, job_id))
        {
            return Some(self.pending_tasks.remove(pos).task);
        }
        None
    }

    /// Tasks this shard accounts for: queued plus in flight.
    pub fn task_total(&self) -> usize {
        self.active_tasks.len()
            + self.pending_tasks.len()
            + usize::from(self.ready_task.is_some())
            + self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_man::GrantAllMemMan;
    use crate::task::NullReplyChannel;
    use condor_common::{ScanInfo, TableRef};
    use condor_proto::Fragment;

    fn task(query: u64, job: u32, chunk: i32, rating: i32) -> Arc<Task> {
        Task::new(
            QueryId(query),
            JobId(job),
            ChunkId(chunk),
            ScanInfo {
                info_tables: vec![TableRef::new("LSST", "Object")],
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

    #[test]
    fn test_slow_tables_first_then_fifo() {
        let mm = GrantAllMemMan::new();
        let mut ct = ChunkTasks::new(ChunkId(1));
        ct.queue(task(1, 0, 1, 2), 0);
        ct.queue(task(2, 0, 1, 1), 1);
        ct.queue(task(3, 0, 1, 1), 2);
        ct.queue(task(4, 0, 1, 3), 3);

        let mut order = Vec::new();
        while ct.ready(false, &mm).unwrap() == ReadyState::Ready {
            order.push(ct.take_ready().unwrap().query_id().0);
        }
        assert_eq!(order, vec![2, 3, 1, 4]);
    }

    #[test]
    fn test_pending_while_active() {
        let mm = GrantAllMemMan::new();
        let mut ct = ChunkTasks::new(ChunkId(1));
        ct.set_active(true);
        ct.queue(task(1, 0, 1, 0), 0);
        // Queued while active: lands on pending, not runnable yet.
        assert_eq!(ct.ready(false, &mm).unwrap(), ReadyState::NotReady);
        ct.set_active(false);
        assert_eq!(ct.ready(false, &mm).unwrap(), ReadyState::Ready);
    }

    #[test]
    fn test_ready_to_advance_requires_no_in_flight() {
        let mm = GrantAllMemMan::new();
        let mut ct = ChunkTasks::new(ChunkId(1));
        let t = task(1, 0, 1, 0);
        ct.queue(Arc::clone(&t), 0);
        assert!(!ct.ready_to_advance());
        assert_eq!(ct.ready(false, &mm).unwrap(), ReadyState::Ready);
        let got = ct.take_ready().unwrap();
        assert!(!ct.ready_to_advance());
        ct.task_complete(&got);
        assert!(ct.ready_to_advance());
    }

    #[test]
    fn test_empty_heap_not_ready() {
        let mm = GrantAllMemMan::new();
        let mut ct = ChunkTasks::new(ChunkId(1));
        assert_eq!(ct.ready(false, &mm).unwrap(), ReadyState::NotReady);
        assert!(ct.is_empty());
    }

    #[test]
    fn test_remove_task_from_heap_and_pending() {
        let mm = GrantAllMemMan::new();
        let mut ct = ChunkTasks::new(ChunkId(1));
        let a = task(1, 0, 1, 0);
        let b = task(2, 0, 1, 0);
        ct.queue(Arc::clone(&a), 0);
        ct.set_active(true);
        ct.queue(Arc::clone(&b), 1);

        // a is in the heap, b is pending.
        assert!(ct.remove_task(&a).is_some());
        assert!(ct.remove_task(&a).is_none());
        assert!(ct.remove_task(&b).is_some());
        ct.set_active(false);
        assert_eq!(ct.ready(false, &mm).unwrap(), ReadyState::NotReady);
    }

    #[test]
    fn test_remove_in_flight_returns_none() {
        let mm = GrantAllMemMan::new();
        let mut ct = ChunkTasks::new(ChunkId(1));
        let t = task(1, 0, 1, 0);
        ct.queue(Arc::clone(&t), 0);
        assert_eq!(ct.ready(false, &mm).unwrap(), ReadyState::Ready);
        let got = ct.take_ready().unwrap();
        assert!(ct.remove_task(&got).is_none());
        assert_eq!(ct.task_total(), 1);
    }

    #[test]
    fn test_heap_reorders_after_remove() {
        let mm = GrantAllMemMan::new();
        let mut ct = ChunkTasks::new(ChunkId(1));
        let a = task(1, 0, 1, 1);
        ct.queue(Arc::clone(&a), 0);
        ct.queue(task(2, 0, 1, 2), 1);
        ct.queue(task(3, 0, 1, 3), 2);
        assert!(ct.remove_task(&a).is_some());
        assert_eq!(ct.ready(false, &mm).unwrap(), ReadyState::Ready);
        assert_eq!(ct.take_ready().unwrap().query_id().0, 2);
    }

    #[test]
    fn test_starved_flag_set_and_cleared() {
        let mut ct = ChunkTasks::new(ChunkId(1));
        assert!(!ct.set_resource_starved(true));
        assert!(ct.is_resource_starved());
        assert!(ct.set_resource_starved(false));
        assert!(!ct.is_resource_starved());
    }
}
