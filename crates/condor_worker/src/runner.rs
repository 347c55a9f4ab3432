//! Runner pool: one thread per concurrent scan slot, each pulling from the
//! shard scan scheduler. The pool owns the wake-up condvar; the scheduler
//! itself never blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use condor_common::{CondorError, CondorResult};
use condor_proto::{encode_response_stream, ResponseError, ResponseRow, ERR_SCAN_FAILED,
    ERR_TABLE_MISSING};

use crate::mem_man::MemMan;
use crate::scheduler::ChunkTasksQueue;
use crate::task::Task;

/// Executes one admitted scan task against the local store.
pub trait ScanExecutor: Send + Sync {
    fn execute(&self, task: &Task) -> CondorResult<Vec<ResponseRow>>;
}

/// Wake-up signal shared by the runners and whoever queues tasks.
pub struct Waker {
    mx: Mutex<()>,
    cv: Condvar,
}

impl Waker {
    pub fn new() -> Arc<Waker> {
        Arc::new(Waker {
            mx: Mutex::new(()),
            cv: Condvar::new(),
        })
    }

    pub fn notify_all(&self) {
        self.cv.notify_all();
    }

    pub fn wait_for(&self, timeout: Duration) {
        let mut guard = self.mx.lock();
        let _ = self.cv.wait_for(&mut guard, timeout);
    }
}

/// Fixed pool of scan runners.
pub struct ScanRunnerPool {
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct RunnerShared {
    scheduler: Arc<ChunkTasksQueue>,
    executor: Arc<dyn ScanExecutor>,
    mem_man: Arc<dyn MemMan>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    wname: String,
    max_rows_per_frame: usize,
}

impl ScanRunnerPool {
    /// Start `slots` runner threads.
    pub fn start(
        scheduler: Arc<ChunkTasksQueue>,
        executor: Arc<dyn ScanExecutor>,
        mem_man: Arc<dyn MemMan>,
        wname: impl Into<String>,
        slots: usize,
        max_rows_per_frame: usize,
    ) -> Arc<ScanRunnerPool> {
        let waker = Waker::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(RunnerShared {
            scheduler,
            executor,
            mem_man,
            waker: Arc::clone(&waker),
            shutdown: Arc::clone(&shutdown),
            wname: wname.into(),
            max_rows_per_frame,
        });

        let mut handles = Vec::with_capacity(slots.max(1));
        for slot in 0..slots.max(1) {
            let shared = Arc::clone(&shared);
            handles.push(
                std::thread::Builder::new()
                    .name(format!("scan-runner-{slot}"))
                    .spawn(move || runner_loop(&shared))
                    .expect("spawn scan runner"),
            );
        }

        Arc::new(ScanRunnerPool {
            waker,
            shutdown,
            handles: Mutex::new(handles),
        })
    }

    /// The condvar task producers should notify after queueing.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Stop the runners and join them.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.waker.notify_all();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }
}

fn runner_loop(shared: &RunnerShared) {
    while !shared.shutdown.load(Ordering::Acquire) {
        match shared.scheduler.get_task(true) {
            Ok(Some(task)) => {
                run_task(shared, &task);
                // Completion may have made the next chunk admissible.
                shared.waker.notify_all();
            }
            Ok(None) => {
                shared.waker.wait_for(Duration::from_millis(50));
            }
            Err(e) => {
                // A fatal admission error takes the whole worker down; in
                // process form, stop every runner.
                tracing::error!(error = %e, "scheduler failure, stopping runners");
                shared.shutdown.store(true, Ordering::Release);
                shared.waker.notify_all();
            }
        }
    }
}

fn run_task(shared: &RunnerShared, task: &Arc<Task>) {
    if task.is_cancelled() {
        finish_task(shared, task);
        task.reply().close();
        return;
    }

    let (rows, error) = match shared.executor.execute(task) {
        Ok(rows) => (rows, None),
        Err(CondorError::NotFound(msg)) => (
            Vec::new(),
            Some(ResponseError {
                code: ERR_TABLE_MISSING,
                msg,
            }),
        ),
        Err(e) => (
            Vec::new(),
            Some(ResponseError {
                code: ERR_SCAN_FAILED,
                msg: e.to_string(),
            }),
        ),
    };

    // Cooperative cancellation: a scan that finished after a kill discards
    // its results at reply time.
    if task.is_cancelled() {
        tracing::debug!(task = %task.id_str(), "cancelled, discarding results");
        finish_task(shared, task);
        task.reply().close();
        return;
    }

    match encode_response_stream(&shared.wname, &rows, error, shared.max_rows_per_frame) {
        Ok(frames) => {
            for frame in frames {
                if let Err(e) = task.reply().send(frame) {
                    tracing::warn!(task = %task.id_str(), error = %e, "reply channel closed");
                    break;
                }
            }
        }
        Err(e) => {
            tracing::error!(task = %task.id_str(), error = %e, "response encode failed");
        }
    }
    task.reply().close();
    finish_task(shared, task);
}

fn finish_task(shared: &RunnerShared, task: &Arc<Task>) {
    if let Some(handle) = task.take_mem_handle() {
        shared.mem_man.release(handle);
    }
    shared.scheduler.task_complete(task);
}
