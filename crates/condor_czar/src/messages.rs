//! Per-query message log. Shard jobs and the receive state machine record
//! progress and failures here; `get_exec_desc` snapshots it.

use parking_lot::Mutex;

use condor_common::ChunkId;

// ── Message codes ────────────────────────────────────────────────────────

/// Response header or body could not be decoded.
pub const MSG_RESULT_DECODE: i32 = 1401;
/// Response body failed its MD5 check.
pub const MSG_RESULT_MD5: i32 = 1402;
/// General result-handling failure (merge refused, protocol misuse).
pub const MSG_RESULT_ERROR: i32 = 1403;
/// Error reported by the worker inside a response body.
pub const MSG_WORKER_ERROR: i32 = 1404;
/// Job finished and its last frame was merged.
pub const MSG_MERGED: i32 = 1200;
/// A table named by the query does not exist.
pub const MSG_TABLE_MISSING: i32 = 1146;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub chunk_id: ChunkId,
    pub code: i32,
    pub severity: Severity,
    pub msg: String,
}

/// Append-only message log, one per user query.
#[derive(Default)]
pub struct MessageStore {
    messages: Mutex<Vec<StoredMessage>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(
        &self,
        chunk_id: ChunkId,
        code: i32,
        severity: Severity,
        msg: impl Into<String>,
    ) {
        let msg = msg.into();
        match severity {
            Severity::Error => {
                tracing::error!(chunk_id = %chunk_id, code = code, "{msg}")
            }
            Severity::Info => tracing::debug!(chunk_id = %chunk_id, code = code, "{msg}"),
        }
        self.messages.lock().push(StoredMessage {
            chunk_id,
            code,
            severity,
            msg,
        });
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.messages.lock().clone()
    }

    /// First error message, if any.
    pub fn first_error(&self) -> Option<String> {
        self.messages
            .lock()
            .iter()
            .find(|m| m.severity == Severity::Error)
            .map(|m| m.msg.clone())
    }

    /// One line per message, for `get_exec_desc`.
    pub fn describe(&self) -> String {
        let messages = self.messages.lock();
        let mut out = String::new();
        for m in messages.iter() {
            let sev = match m.severity {
                Severity::Info => "INFO",
                Severity::Error => "ERROR",
            };
            out.push_str(&format!(
                "chunk={} code={} {}: {}\n",
                m.chunk_id, m.code, sev, m.msg
            ));
        }
        out
    }
}
