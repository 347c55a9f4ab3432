//! Shard job dispatch and completion tracking for one user query.
//!
//! Each job gets its own dispatch/receive thread: the worker's response
//! bytes are pumped into the job's `MergingHandler` in `buffer_len()`-sized
//! reads, converging on the shared merger. `join` blocks until every job is
//! terminal.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use condor_common::{ChunkId, CondorError, CondorResult, JobId, QueryId, ResourcePath};

use crate::messages::{MessageStore, Severity, MSG_MERGED, MSG_RESULT_ERROR};
use crate::recv::{Flush, MergingHandler};

/// Everything needed to dispatch one shard job.
pub struct JobDescription {
    pub query_id: QueryId,
    pub job_id: JobId,
    pub chunk_id: ChunkId,
    pub resource: ResourcePath,
    pub payload: Vec<u8>,
}

/// Terminal and non-terminal states of one shard job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Success,
    Error(String),
    Cancelled,
}

/// Tracking record for one dispatched job.
pub struct JobQuery {
    pub job_id: JobId,
    pub chunk_id: ChunkId,
    cancelled: Arc<AtomicBool>,
    status: Mutex<JobStatus>,
}

impl JobQuery {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn status(&self) -> JobStatus {
        self.status.lock().clone()
    }
}

/// Transport seam: submit a task message to a worker, get back the raw
/// response byte stream. Chunking of the stream is arbitrary; the executive
/// reframes it for the handler.
pub trait WorkerDispatcher: Send + Sync {
    fn submit(&self, resource: &ResourcePath, payload: &[u8]) -> CondorResult<Receiver<Vec<u8>>>;
}

struct ExecShared {
    msg_store: Arc<MessageStore>,
    jobs: Mutex<HashMap<JobId, Arc<JobQuery>>>,
    inflight: Mutex<usize>,
    done_cv: Condvar,
    first_error: Mutex<Option<String>>,
}

impl ExecShared {
    fn job_done(&self) {
        let mut inflight = self.inflight.lock();
        *inflight = inflight.saturating_sub(1);
        if *inflight == 0 {
            self.done_cv.notify_all();
        }
    }

    /// Cancel every job once a shard failed beyond recovery.
    fn cancel_all_jobs(&self) {
        for job in self.jobs.lock().values() {
            job.cancel();
        }
    }

    fn record_error(&self, chunk_id: ChunkId, msg: &str) {
        self.msg_store
            .add_message(chunk_id, MSG_RESULT_ERROR, Severity::Error, msg);
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(msg.to_string());
        }
    }
}

/// Dispatcher and completion tracker for one user query's shard jobs.
pub struct Executive {
    dispatcher: Arc<dyn WorkerDispatcher>,
    shared: Arc<ExecShared>,
    query_id: Mutex<Option<QueryId>>,
    cancelled: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Executive {
    pub fn new(dispatcher: Arc<dyn WorkerDispatcher>, msg_store: Arc<MessageStore>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            shared: Arc::new(ExecShared {
                msg_store,
                jobs: Mutex::new(HashMap::new()),
                inflight: Mutex::new(0),
                done_cv: Condvar::new(),
                first_error: Mutex::new(None),
            }),
            query_id: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn set_query_id(&self, query_id: QueryId) {
        *self.query_id.lock() = Some(query_id);
    }

    /// Register and dispatch one shard job. The handler was built around
    /// the same cancel flag.
    pub fn add(&self, desc: JobDescription, handler: MergingHandler, cancelled: Arc<AtomicBool>) {
        let job = Arc::new(JobQuery {
            job_id: desc.job_id,
            chunk_id: desc.chunk_id,
            cancelled,
            status: Mutex::new(JobStatus::Running),
        });
        self.shared.jobs.lock().insert(desc.job_id, Arc::clone(&job));
        *self.shared.inflight.lock() += 1;

        let dispatcher = Arc::clone(&self.dispatcher);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("job-{}", desc.job_id.0))
            .spawn(move || pump_job(dispatcher, shared, desc, handler, job))
            .expect("spawn job thread");
        self.handles.lock().push(handle);
    }

    /// Block until every dispatched job is terminal.
    /// @return true when all jobs succeeded.
    pub fn join(&self) -> bool {
        {
            let mut inflight = self.shared.inflight.lock();
            while *inflight > 0 {
                self.shared.done_cv.wait(&mut inflight);
            }
        }
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
        let jobs = self.shared.jobs.lock();
        let ok = jobs.values().all(|j| j.status() == JobStatus::Success);
        tracing::debug!(jobs = jobs.len(), success = ok, "executive joined");
        ok
    }

    /// Cancel all jobs. Idempotent; safe from any thread.
    pub fn squash(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("executive squash");
        self.shared.cancel_all_jobs();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn num_inflight(&self) -> usize {
        *self.shared.inflight.lock()
    }

    pub fn first_error(&self) -> Option<String> {
        self.shared.first_error.lock().clone()
    }

    pub fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.shared.jobs.lock().get(&job_id).map(|j| j.status())
    }
}

fn pump_job(
    dispatcher: Arc<dyn WorkerDispatcher>,
    shared: Arc<ExecShared>,
    desc: JobDescription,
    mut handler: MergingHandler,
    job: Arc<JobQuery>,
) {
    let outcome = pump_stream(&*dispatcher, &desc, &mut handler, &job);
    match outcome {
        Ok(()) => {
            *job.status.lock() = JobStatus::Success;
            shared.msg_store.add_message(
                desc.chunk_id,
                MSG_MERGED,
                Severity::Info,
                format!("chunk {} merged from {}", desc.chunk_id, handler.worker_name()),
            );
        }
        Err(e) if e.is_cancelled() || job.is_cancelled() => {
            *job.status.lock() = JobStatus::Cancelled;
        }
        Err(e) => {
            let msg = e.to_string();
            *job.status.lock() = JobStatus::Error(msg.clone());
            shared.record_error(desc.chunk_id, &msg);
            if !e.is_recoverable() {
                // Default policy: one unrecoverable shard failure aborts
                // the whole query.
                shared.cancel_all_jobs();
            }
        }
    }
    shared.job_done();
}

fn pump_stream(
    dispatcher: &dyn WorkerDispatcher,
    desc: &JobDescription,
    handler: &mut MergingHandler,
    job: &JobQuery,
) -> CondorResult<()> {
    let rx: Receiver<Vec<u8>> = dispatcher
        .submit(&desc.resource, &desc.payload)
        .map_err(|e| e.with_context(format!("dispatch {}", desc.resource)))?;

    let mut pending: VecDeque<u8> = VecDeque::new();
    loop {
        let need = handler.buffer_len();
        while pending.len() < need {
            match rx.recv() {
                Ok(bytes) => pending.extend(bytes),
                Err(_) => {
                    // Stream closed. A cancelled worker legitimately sends
                    // nothing; anything else is a broken reply.
                    if job.is_cancelled() {
                        return Err(CondorError::Cancelled(desc.query_id));
                    }
                    return Err(CondorError::Dispatch(format!(
                        "response stream from {} ended early ({} of {} bytes buffered)",
                        desc.resource,
                        pending.len(),
                        need
                    )));
                }
            }
        }
        let frame: Vec<u8> = pending.drain(..need).collect();
        match handler.flush(&frame)? {
            Flush::MoreExpected => continue,
            Flush::Finished => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{InfileMerger, MemResultDb, MergerConfig, ResultDbConn};
    use condor_proto::{encode_response_stream, ResponseRow};
    use std::sync::mpsc;

    /// Dispatcher that replies to every submit with a fixed row set, split
    /// into arbitrary byte chunks to exercise the reframing loop.
    struct CannedDispatcher {
        rows: Vec<ResponseRow>,
        chunk_bytes: usize,
    }

    impl WorkerDispatcher for CannedDispatcher {
        fn submit(
            &self,
            _resource: &ResourcePath,
            _payload: &[u8],
        ) -> CondorResult<Receiver<Vec<u8>>> {
            let (tx, rx) = mpsc::channel();
            let frames = encode_response_stream("w1", &self.rows, None, 100).unwrap();
            let all: Vec<u8> = frames.concat();
            for piece in all.chunks(self.chunk_bytes) {
                tx.send(piece.to_vec()).unwrap();
            }
            Ok(rx)
        }
    }

    /// Dispatcher whose streams close without sending anything.
    struct DeadDispatcher;

    impl WorkerDispatcher for DeadDispatcher {
        fn submit(
            &self,
            _resource: &ResourcePath,
            _payload: &[u8],
        ) -> CondorResult<Receiver<Vec<u8>>> {
            let (_tx, rx) = mpsc::channel();
            Ok(rx)
        }
    }

    /// Dispatcher that keeps its streams open until told to drop them.
    #[derive(Default)]
    struct HoldDispatcher {
        senders: parking_lot::Mutex<Vec<mpsc::Sender<Vec<u8>>>>,
    }

    impl HoldDispatcher {
        fn drop_streams(&self) {
            self.senders.lock().clear();
        }

        /// Block until `count` streams have been handed out.
        fn wait_for_streams(&self, count: usize) {
            let start = std::time::Instant::now();
            while self.senders.lock().len() < count {
                assert!(
                    start.elapsed() < std::time::Duration::from_secs(2),
                    "dispatch never happened"
                );
                std::thread::yield_now();
            }
        }
    }

    impl WorkerDispatcher for HoldDispatcher {
        fn submit(
            &self,
            _resource: &ResourcePath,
            _payload: &[u8],
        ) -> CondorResult<Receiver<Vec<u8>>> {
            let (tx, rx) = mpsc::channel();
            self.senders.lock().push(tx);
            Ok(rx)
        }
    }

    fn fixture() -> (Arc<MessageStore>, Arc<InfileMerger>, Arc<MemResultDb>) {
        let db = Arc::new(MemResultDb::new());
        let merger = Arc::new(InfileMerger::new(
            &MergerConfig::new("qres"),
            db.clone() as Arc<dyn ResultDbConn>,
        ));
        (Arc::new(MessageStore::new()), merger, db)
    }

    fn job(
        store: &Arc<MessageStore>,
        merger: &Arc<InfileMerger>,
        job_id: u32,
        chunk: i32,
    ) -> (JobDescription, MergingHandler, Arc<AtomicBool>) {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handler = MergingHandler::new(
            Arc::clone(merger),
            merger.table_name().to_string(),
            QueryId(1),
            ChunkId(chunk),
            Arc::clone(&cancelled),
            Arc::clone(store),
        );
        (
            JobDescription {
                query_id: QueryId(1),
                job_id: JobId(job_id),
                chunk_id: ChunkId(chunk),
                resource: ResourcePath::new("LSST", ChunkId(chunk)),
                payload: vec![],
            },
            handler,
            cancelled,
        )
    }

    #[test]
    fn test_two_jobs_join_success() {
        let (store, merger, db) = fixture();
        let exec = Executive::new(
            Arc::new(CannedDispatcher {
                rows: vec![ResponseRow::of(&["1"])],
                chunk_bytes: 7, // deliberately misaligned with frame sizes
            }),
            Arc::clone(&store),
        );
        for i in 0..2 {
            let (desc, handler, flag) = job(&store, &merger, i, i as i32 + 1);
            exec.add(desc, handler, flag);
        }
        assert!(exec.join());
        assert_eq!(exec.num_inflight(), 0);
        assert_eq!(merger.row_count(), 2);
        assert_eq!(db.rows(merger.table_name()).unwrap().len(), 2);
        assert_eq!(exec.job_status(JobId(0)), Some(JobStatus::Success));
    }

    #[test]
    fn test_dead_stream_fails_job_and_join() {
        let (store, merger, _db) = fixture();
        let exec = Executive::new(Arc::new(DeadDispatcher), Arc::clone(&store));
        let (desc, handler, flag) = job(&store, &merger, 0, 1);
        exec.add(desc, handler, flag);
        assert!(!exec.join());
        assert!(matches!(
            exec.job_status(JobId(0)),
            Some(JobStatus::Error(_))
        ));
        assert!(exec.first_error().unwrap().contains("ended early"));
    }

    #[test]
    fn test_squash_is_idempotent_and_cancels_jobs() {
        let (store, merger, _db) = fixture();
        let dispatcher = Arc::new(HoldDispatcher::default());
        let exec = Executive::new(Arc::clone(&dispatcher) as Arc<dyn WorkerDispatcher>, Arc::clone(&store));
        let (desc, handler, flag) = job(&store, &merger, 0, 1);
        exec.add(desc, handler, Arc::clone(&flag));
        // The job thread is parked on its open response stream.
        dispatcher.wait_for_streams(1);
        exec.squash();
        exec.squash();
        assert!(exec.is_cancelled());
        assert!(flag.load(Ordering::Acquire));
        // Closing the stream lets the cancelled job drain.
        dispatcher.drop_streams();
        assert!(!exec.join());
        assert_eq!(exec.job_status(JobId(0)), Some(JobStatus::Cancelled));
    }

    #[test]
    fn test_join_with_no_jobs_succeeds() {
        let (store, _merger, _db) = fixture();
        let exec = Executive::new(Arc::new(DeadDispatcher), store);
        assert!(exec.join());
    }
}
