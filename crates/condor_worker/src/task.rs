//! One shard's fragment of a user query, as executed on a worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use condor_common::{ChunkId, CondorResult, JobId, QueryId, ScanInfo, ScanRating, TableRef};
use condor_proto::{Fragment, TaskMsg};

use crate::mem_man::Handle;

/// Where a task's reply frames go. The transport owns the other end.
pub trait ReplyChannel: Send + Sync {
    fn send(&self, frame: Vec<u8>) -> CondorResult<()>;
    /// Signals that no further frames will arrive for this task.
    fn close(&self);
}

/// Reply channel that drops everything. Used by tests and by tasks whose
/// session was severed before they ran.
pub struct NullReplyChannel;

impl ReplyChannel for NullReplyChannel {
    fn send(&self, _frame: Vec<u8>) -> CondorResult<()> {
        Ok(())
    }
    fn close(&self) {}
}

/// One scan task. Identity is `(query_id, job_id)`; shared between the
/// session that owns it, the scheduler that queues it, and the runner
/// thread that executes it.
pub struct Task {
    query_id: QueryId,
    job_id: JobId,
    chunk_id: ChunkId,
    scan_info: ScanInfo,
    fragment: Fragment,
    mem_handle: Mutex<Option<Handle>>,
    cancelled: AtomicBool,
    reply: Arc<dyn ReplyChannel>,
}

impl Task {
    pub fn new(
        query_id: QueryId,
        job_id: JobId,
        chunk_id: ChunkId,
        scan_info: ScanInfo,
        fragment: Fragment,
        reply: Arc<dyn ReplyChannel>,
    ) -> Arc<Task> {
        Arc::new(Task {
            query_id,
            job_id,
            chunk_id,
            scan_info,
            fragment,
            mem_handle: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            reply,
        })
    }

    /// Materialize tasks from a decoded task message, one per fragment,
    /// preserving fragment order. All tasks share the reply channel.
    pub fn from_msg(msg: &TaskMsg, reply: Arc<dyn ReplyChannel>) -> Vec<Arc<Task>> {
        let scan_info = ScanInfo {
            info_tables: msg
                .scan_tables
                .iter()
                .map(|t| TableRef::new(msg.db.clone(), t.clone()))
                .collect(),
            rating: ScanRating(msg.scan_rating),
        };
        msg.fragments
            .iter()
            .map(|frag| {
                Task::new(
                    QueryId(msg.session),
                    JobId(msg.job_id),
                    ChunkId(msg.chunk_id),
                    scan_info.clone(),
                    frag.clone(),
                    Arc::clone(&reply),
                )
            })
            .collect()
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn scan_info(&self) -> &ScanInfo {
        &self.scan_info
    }

    pub fn fragment(&self) -> &Fragment {
        &self.fragment
    }

    pub fn reply(&self) -> &Arc<dyn ReplyChannel> {
        &self.reply
    }

    pub fn ids_match(&self, query_id: QueryId, job_id: JobId) -> bool {
        self.query_id == query_id && self.job_id == job_id
    }

    /// `"QI=<q>;JI=<j>"` tag used in log lines.
    pub fn id_str(&self) -> String {
        format!("{};{}", self.query_id, self.job_id)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn has_mem_handle(&self) -> bool {
        self.mem_handle.lock().is_some()
    }

    pub fn set_mem_handle(&self, handle: Handle) {
        *self.mem_handle.lock() = Some(handle);
    }

    pub fn take_mem_handle(&self) -> Option<Handle> {
        self.mem_handle.lock().take()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("query_id", &self.query_id)
            .field("job_id", &self.job_id)
            .field("chunk_id", &self.chunk_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
