//! Worker-side session: receives task dispatches, owns the resulting tasks,
//! and propagates cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use condor_common::{CondorError, CondorResult, ResourcePath};
use condor_proto::decode_task_msg;

use crate::runner::Waker;
use crate::scheduler::ChunkTasksQueue;
use crate::task::{ReplyChannel, Task};

/// Validates a request's resource path against what this worker serves.
pub trait ResourceValidator: Send + Sync {
    fn validate(&self, resource: &ResourcePath) -> bool;
}

/// Validator that accepts everything (single-node tests).
pub struct AcceptAllValidator;

impl ResourceValidator for AcceptAllValidator {
    fn validate(&self, _resource: &ResourcePath) -> bool {
        true
    }
}

/// One transport session on the worker. The task list is guarded by a
/// single lock; the cancelled flag is read on every long-running task tick.
pub struct WorkerSession {
    validator: Arc<dyn ResourceValidator>,
    scheduler: Arc<ChunkTasksQueue>,
    waker: Option<Arc<Waker>>,
    tasks: Mutex<Vec<Arc<Task>>>,
    cancelled: AtomicBool,
    provisioned: AtomicBool,
}

impl WorkerSession {
    pub fn new(validator: Arc<dyn ResourceValidator>, scheduler: Arc<ChunkTasksQueue>) -> Self {
        Self {
            validator,
            scheduler,
            waker: None,
            tasks: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
            provisioned: AtomicBool::new(true),
        }
    }

    /// Attach the runner pool's waker so queued tasks wake idle runners.
    pub fn with_waker(mut self, waker: Arc<Waker>) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Validate, decode and queue one task dispatch. Returns the number of
    /// tasks queued; the reply streams back asynchronously. The timeout is
    /// enforced by the transport, which reports expiry as a cancelled
    /// request.
    pub fn process_request(
        &self,
        resource: &ResourcePath,
        payload: &[u8],
        timeout: Duration,
        reply: Arc<dyn ReplyChannel>,
    ) -> CondorResult<usize> {
        if !self.provisioned.load(Ordering::Acquire) {
            return Err(CondorError::Dispatch("session unprovisioned".into()));
        }
        if !self.validator.validate(resource) {
            tracing::warn!(resource = %resource, "request for unknown resource rejected");
            return Err(CondorError::Dispatch(format!(
                "unknown resource: {resource}"
            )));
        }
        let msg = decode_task_msg(payload)?;
        if msg.chunk_id != resource.chunk_id.0 || msg.db != resource.db {
            return Err(CondorError::Dispatch(format!(
                "task message for {}/{} does not match resource {resource}",
                msg.db, msg.chunk_id
            )));
        }

        let tasks = Task::from_msg(&msg, reply);
        let count = tasks.len();
        {
            let mut held = self.tasks.lock();
            for task in &tasks {
                held.push(Arc::clone(task));
            }
        }
        for task in tasks {
            self.scheduler.queue_task(task);
        }
        if let Some(waker) = &self.waker {
            waker.notify_all();
        }
        tracing::debug!(
            resource = %resource,
            count = count,
            timeout_ms = timeout.as_millis() as u64,
            "tasks queued"
        );
        Ok(count)
    }

    /// Transport notification that the request ended. On cancel, every
    /// still-queued task from this session is cancelled and removed; tasks
    /// already in flight complete naturally and discard their results.
    pub fn request_finished(&self, cancel: bool) {
        if !cancel {
            return;
        }
        self.cancelled.store(true, Ordering::Release);
        let held: Vec<Arc<Task>> = self.tasks.lock().drain(..).collect();
        for task in held {
            task.cancel();
            self.scheduler.remove_task(&task);
        }
        if let Some(waker) = &self.waker {
            waker.notify_all();
        }
        tracing::debug!("session cancelled, queued tasks removed");
    }

    /// Sever the session.
    pub fn unprovision(&self, forced: bool) {
        self.provisioned.store(false, Ordering::Release);
        if forced {
            self.request_finished(true);
        } else {
            self.tasks.lock().clear();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_man::GrantAllMemMan;
    use crate::task::NullReplyChannel;
    use condor_common::ChunkId;
    use condor_proto::{encode_task_msg, Fragment, TaskMsg};

    struct OnlyChunkOne;
    impl ResourceValidator for OnlyChunkOne {
        fn validate(&self, resource: &ResourcePath) -> bool {
            resource.chunk_id == ChunkId(1)
        }
    }

    fn msg(chunk: i32, fragments: usize) -> Vec<u8> {
        encode_task_msg(&TaskMsg {
            session: 7,
            job_id: 0,
            db: "LSST".into(),
            chunk_id: chunk,
            fragments: (0..fragments)
                .map(|i| Fragment {
                    result_table: "r".into(),
                    query: format!("SELECT {i}"),
                    subchunks: vec![],
                })
                .collect(),
            scan_tables: vec![],
            scan_rating: 0,
        })
    }

    fn session() -> (WorkerSession, Arc<ChunkTasksQueue>) {
        let scheduler = Arc::new(ChunkTasksQueue::new(Arc::new(GrantAllMemMan::new())));
        let session = WorkerSession::new(Arc::new(OnlyChunkOne), Arc::clone(&scheduler));
        (session, scheduler)
    }

    #[test]
    fn test_process_request_queues_one_task_per_fragment() {
        let (session, scheduler) = session();
        let n = session
            .process_request(
                &ResourcePath::new("LSST", ChunkId(1)),
                &msg(1, 3),
                Duration::from_secs(5),
                Arc::new(NullReplyChannel),
            )
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(scheduler.task_count(), 3);
    }

    #[test]
    fn test_unknown_resource_rejected() {
        let (session, scheduler) = session();
        let err = session
            .process_request(
                &ResourcePath::new("LSST", ChunkId(99)),
                &msg(99, 1),
                Duration::from_secs(5),
                Arc::new(NullReplyChannel),
            )
            .unwrap_err();
        assert!(matches!(err, CondorError::Dispatch(_)));
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_resource_message_mismatch_rejected() {
        let (session, _) = session();
        let err = session
            .process_request(
                &ResourcePath::new("LSST", ChunkId(1)),
                &msg(2, 1),
                Duration::from_secs(5),
                Arc::new(NullReplyChannel),
            )
            .unwrap_err();
        assert!(matches!(err, CondorError::Dispatch(_)));
    }

    #[test]
    fn test_garbage_payload_is_decode_error() {
        let (session, _) = session();
        let err = session
            .process_request(
                &ResourcePath::new("LSST", ChunkId(1)),
                &[1, 2, 3],
                Duration::from_secs(5),
                Arc::new(NullReplyChannel),
            )
            .unwrap_err();
        assert!(matches!(err, CondorError::ProtocolDecode(_)));
    }

    #[test]
    fn test_cancel_removes_queued_tasks() {
        let (session, scheduler) = session();
        session
            .process_request(
                &ResourcePath::new("LSST", ChunkId(1)),
                &msg(1, 2),
                Duration::from_secs(5),
                Arc::new(NullReplyChannel),
            )
            .unwrap();
        assert_eq!(scheduler.task_count(), 2);
        session.request_finished(true);
        assert!(session.is_cancelled());
        assert_eq!(scheduler.task_count(), 0);
        // Idempotent.
        session.request_finished(true);
        assert_eq!(scheduler.task_count(), 0);
    }

    #[test]
    fn test_request_finished_without_cancel_keeps_tasks() {
        let (session, scheduler) = session();
        session
            .process_request(
                &ResourcePath::new("LSST", ChunkId(1)),
                &msg(1, 2),
                Duration::from_secs(5),
                Arc::new(NullReplyChannel),
            )
            .unwrap();
        session.request_finished(false);
        assert!(!session.is_cancelled());
        assert_eq!(scheduler.task_count(), 2);
    }

    #[test]
    fn test_unprovisioned_session_rejects_requests() {
        let (session, _) = session();
        session.unprovision(false);
        let err = session
            .process_request(
                &ResourcePath::new("LSST", ChunkId(1)),
                &msg(1, 1),
                Duration::from_secs(5),
                Arc::new(NullReplyChannel),
            )
            .unwrap_err();
        assert!(matches!(err, CondorError::Dispatch(_)));
    }
}
