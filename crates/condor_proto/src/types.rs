//! Wire message types and constants for the worker → czar response stream
//! and the czar → worker task message.

/// Fixed size of the header envelope that starts every frame:
/// `[1-byte header-size N][N bytes encoded header][zero padding]`.
/// The receiver always reads exactly this many bytes before the body.
pub const RESPONSE_HEADER_ENVELOPE: usize = 128;

/// Maximum body size of one frame: 64 MiB.
pub const MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// Worker name placeholder until the first frame names the sender.
pub const UNKNOWN_WORKER: &str = "~";

// ── Worker-reported error codes (carried in a response body) ─────────────

/// A chunk table the scan needed does not exist on the worker.
pub const ERR_TABLE_MISSING: u32 = 100;
/// The scan itself failed after admission.
pub const ERR_SCAN_FAILED: u32 = 101;
/// The task was cancelled before its reply was sent.
pub const ERR_TASK_CANCELLED: u32 = 102;

/// Header of one response frame. Encoded into the fixed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Body length in bytes.
    pub size: u32,
    /// MD5 digest over the body bytes only.
    pub md5: [u8; 16],
    /// Worker name; meaningful in the first frame of a stream.
    pub wname: String,
    /// True when another frame follows this one.
    pub continues: bool,
}

/// One row of a result fragment. Cells are nullable text values, as the
/// merge table ingests string-encoded columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRow {
    pub cols: Vec<Option<String>>,
}

impl ResponseRow {
    pub fn of(cols: &[&str]) -> Self {
        Self {
            cols: cols.iter().map(|c| Some((*c).to_string())).collect(),
        }
    }
}

/// Error reported by a worker inside a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    pub code: u32,
    pub msg: String,
}

/// Decoded body of one response frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseBody {
    pub rows: Vec<ResponseRow>,
    /// Mirrors the header flag; the receive state machine consults the body.
    pub continues: bool,
    pub error: Option<ResponseError>,
}

/// One sub-query fragment of a task message. A query with a chain of
/// sub-query fragments emits one `Fragment` per link, preserving order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub result_table: String,
    pub query: String,
    pub subchunks: Vec<i32>,
}

/// Task message dispatched from the czar to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMsg {
    /// The user query this task belongs to.
    pub session: u64,
    /// Shard job id within the user query.
    pub job_id: u32,
    pub db: String,
    pub chunk_id: i32,
    pub fragments: Vec<Fragment>,
    /// Tables (within `db`) the scan will read; drives shard scheduling
    /// and memory admission on the worker.
    pub scan_tables: Vec<String>,
    /// Scan-rate class of the slowest table involved; lower = slower.
    pub scan_rating: i32,
}
