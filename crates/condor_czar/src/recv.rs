//! Per-shard streaming receive: frames a worker's response stream, verifies
//! integrity, and hands decoded bodies to the merger.
//!
//! One state machine owns both the read side and the merge side. The
//! transport adapter reads `buffer_len()` bytes and calls `flush`; exactly
//! one state transition happens per call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use condor_common::{ChunkId, CondorError, CondorResult, QueryId};
use condor_proto::{
    decode_response_body, md5_digest, unwrap_header, ResponseBody, ResponseHeader,
    ERR_TABLE_MISSING, RESPONSE_HEADER_ENVELOPE, UNKNOWN_WORKER,
};

use crate::merge::InfileMerger;
use crate::messages::{
    MessageStore, Severity, MSG_RESULT_DECODE, MSG_RESULT_ERROR, MSG_RESULT_MD5, MSG_WORKER_ERROR,
};

/// Receive states. `ResultRecv` is terminal success; the `*Err` states are
/// terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgState {
    Invalid,
    HeaderSizeWait,
    ResultWait,
    ResultExtra,
    ResultRecv,
    HeaderErr,
    ResultErr,
}

impl MsgState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgState::Invalid => "INVALID",
            MsgState::HeaderSizeWait => "HEADER_SIZE_WAIT",
            MsgState::ResultWait => "RESULT_WAIT",
            MsgState::ResultExtra => "RESULT_EXTRA",
            MsgState::ResultRecv => "RESULT_RECV",
            MsgState::HeaderErr => "HEADER_ERR",
            MsgState::ResultErr => "RESULT_ERR",
        }
    }
}

/// What `flush` tells the transport to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Read `buffer_len()` more bytes and call again.
    MoreExpected,
    /// Final frame merged; the stream is complete.
    Finished,
}

/// Decoded header and body of the frame currently in flight. A fresh
/// container is allocated between continuation frames so a prior body
/// stays valid while the next one is parsed.
#[derive(Debug, Default)]
pub struct WorkerResponse {
    pub header: Option<ResponseHeader>,
    pub body: Option<ResponseBody>,
}

/// Error recorded by the handler, surfaced to the message store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub code: i32,
    pub msg: String,
}

/// Per-shard result receiver and merge driver.
pub struct MergingHandler {
    state: MsgState,
    buffer_len: usize,
    response: WorkerResponse,
    wname: String,
    merger: Arc<InfileMerger>,
    table_name: String,
    query_id: QueryId,
    chunk_id: ChunkId,
    /// Owning job's cancel flag; consulted before every merge.
    cancelled: Arc<AtomicBool>,
    msg_store: Arc<MessageStore>,
    /// True once any bytes have been forwarded to the merger.
    flushed: bool,
    error: Mutex<Option<HandlerError>>,
}

impl MergingHandler {
    pub fn new(
        merger: Arc<InfileMerger>,
        table_name: impl Into<String>,
        query_id: QueryId,
        chunk_id: ChunkId,
        cancelled: Arc<AtomicBool>,
        msg_store: Arc<MessageStore>,
    ) -> Self {
        Self {
            state: MsgState::HeaderSizeWait,
            buffer_len: RESPONSE_HEADER_ENVELOPE,
            response: WorkerResponse::default(),
            wname: UNKNOWN_WORKER.to_string(),
            merger,
            table_name: table_name.into(),
            query_id,
            chunk_id,
            cancelled,
            msg_store,
            flushed: false,
            error: Mutex::new(None),
        }
    }

    /// How many bytes the transport must supply to the next `flush`.
    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn state(&self) -> MsgState {
        self.state
    }

    pub fn worker_name(&self) -> &str {
        &self.wname
    }

    /// True once anything has been merged; a partial merge cannot be
    /// retracted.
    pub fn finished(&self) -> bool {
        self.flushed
    }

    pub fn error(&self) -> Option<HandlerError> {
        self.error.lock().clone()
    }

    /// Process exactly one framed event. The caller must supply exactly
    /// `buffer_len()` bytes.
    pub fn flush(&mut self, data: &[u8]) -> CondorResult<Flush> {
        tracing::debug!(
            from = %self.wname,
            state = self.state.as_str(),
            len = data.len(),
            "flush"
        );
        if data.len() != self.buffer_len {
            // A worker sent corrupted data, or the transport raced a
            // resize. The race is expected only between continuation
            // frames; anywhere else the stream is corrupt.
            tracing::error!(
                from = %self.wname,
                expected = self.buffer_len,
                got = data.len(),
                state = self.state.as_str(),
                "flush size mismatch"
            );
            if self.state != MsgState::ResultExtra {
                let msg = format!(
                    "flush size mismatch: expected {} got {}",
                    self.buffer_len,
                    data.len()
                );
                self.set_error(MSG_RESULT_ERROR, &msg);
                self.state = match self.state {
                    MsgState::HeaderSizeWait => MsgState::HeaderErr,
                    _ => MsgState::ResultErr,
                };
                return Err(CondorError::ProtocolDecode(msg));
            }
        }

        match self.state {
            MsgState::HeaderSizeWait | MsgState::ResultExtra => self.read_header(data),
            MsgState::ResultWait => self.read_result(data),
            MsgState::ResultRecv | MsgState::HeaderErr | MsgState::ResultErr | MsgState::Invalid => {
                let msg = format!(
                    "Unexpected message from {} in state {}",
                    self.wname,
                    self.state.as_str()
                );
                self.set_error(MSG_RESULT_ERROR, &msg);
                Err(CondorError::ProtocolDecode(msg))
            }
        }
    }

    /// Re-arm the handler for a redirected reply. Fails once any bytes have
    /// reached the merger: this design cannot retract a partial merge.
    pub fn reset(&mut self) -> bool {
        if self.flushed {
            return false;
        }
        self.state = MsgState::HeaderSizeWait;
        self.buffer_len = RESPONSE_HEADER_ENVELOPE;
        self.response = WorkerResponse::default();
        *self.error.lock() = None;
        true
    }

    // ── Transitions ──────────────────────────────────────────────────────

    fn read_header(&mut self, data: &[u8]) -> CondorResult<Flush> {
        let header = match unwrap_header(data) {
            Ok(h) => h,
            Err(e) => {
                let msg = format!(
                    "From {}: error decoding response header in {}: {e}",
                    self.wname,
                    self.state.as_str()
                );
                self.set_error(MSG_RESULT_DECODE, &msg);
                self.state = MsgState::HeaderErr;
                return Err(CondorError::ProtocolDecode(msg));
            }
        };
        if self.wname == UNKNOWN_WORKER {
            self.wname = header.wname.clone();
        }
        self.buffer_len = header.size as usize;
        self.response.header = Some(header);
        self.state = MsgState::ResultWait;
        Ok(Flush::MoreExpected)
    }

    fn read_result(&mut self, data: &[u8]) -> CondorResult<Flush> {
        let header = self
            .response
            .header
            .as_ref()
            .expect("RESULT_WAIT always follows a decoded header");

        if md5_digest(data) != header.md5 {
            let msg = "Result message MD5 mismatch";
            self.set_error(MSG_RESULT_MD5, msg);
            self.state = MsgState::ResultErr;
            return Err(CondorError::ProtocolIntegrity(msg.to_string()));
        }

        let body = match decode_response_body(data) {
            Ok(b) => b,
            Err(e) => {
                let msg = format!("Error decoding result body: {e}");
                self.set_error(MSG_RESULT_DECODE, &msg);
                self.state = MsgState::ResultErr;
                return Err(CondorError::ProtocolDecode(msg));
            }
        };

        // A worker error rides the final frame in place of rows.
        if let Some(worker_err) = &body.error {
            let msg = format!("From {}: {}", header.wname, worker_err.msg);
            self.set_error(MSG_WORKER_ERROR, &msg);
            self.state = MsgState::ResultErr;
            return Err(if worker_err.code == ERR_TABLE_MISSING {
                CondorError::NotFound(msg)
            } else {
                CondorError::Dispatch(msg)
            });
        }

        let continues = body.continues;
        self.response.body = Some(body);
        if continues {
            self.buffer_len = RESPONSE_HEADER_ENVELOPE;
            self.state = MsgState::ResultExtra;
        } else {
            self.state = MsgState::ResultRecv;
        }

        self.merge()?;

        if continues {
            // Fresh container: the merged body must not be overwritten by
            // the next frame's decode.
            self.response = WorkerResponse::default();
            Ok(Flush::MoreExpected)
        } else {
            Ok(Flush::Finished)
        }
    }

    fn merge(&mut self) -> CondorResult<()> {
        if self.cancelled.load(Ordering::Acquire) {
            tracing::debug!(table = %self.table_name, "merge skipped, already cancelled");
            return Err(CondorError::Cancelled(self.query_id));
        }
        if self.merger.merge(&self.response) {
            self.flushed = true;
            Ok(())
        } else {
            let msg = self.merger.get_error();
            self.set_error(MSG_RESULT_ERROR, &msg);
            self.state = MsgState::ResultErr;
            Err(CondorError::Merge(msg))
        }
    }

    fn set_error(&self, code: i32, msg: &str) {
        self.msg_store
            .add_message(self.chunk_id, code, Severity::Error, msg);
        *self.error.lock() = Some(HandlerError {
            code,
            msg: msg.to_string(),
        });
    }
}

impl std::fmt::Debug for MergingHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergingHandler")
            .field("table", &self.table_name)
            .field("state", &self.state.as_str())
            .field("flushed", &self.flushed)
            .finish()
    }
}
