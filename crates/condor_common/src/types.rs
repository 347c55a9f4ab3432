//! Core identifiers and shared value types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one user query across the czar and the worker fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryId(pub u64);

/// Identifies one shard job within a user query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u32);

/// A horizontal partition of the logical catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub i32);

/// Identifies one czar in the query-metadata database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CzarId(pub u32);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QI={}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JI={}", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CzarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chunk id used for queries that do not touch a partitioned table.
pub const DUMMY_CHUNK: ChunkId = ChunkId(1234567890);

/// Final execution state of a user query, as observed from `join`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Success,
    Error,
    Cancelled,
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryState::Success => write!(f, "SUCCESS"),
            QueryState::Error => write!(f, "ERROR"),
            QueryState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Scan-rate class of a table. Lower = slower; slower tables are scheduled
/// first within a shard so the longest sequential pass starts earliest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScanRating(pub i32);

impl Default for ScanRating {
    fn default() -> Self {
        ScanRating(0)
    }
}

/// A table a scan will read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub db: String,
    pub table: String,
}

impl TableRef {
    pub fn new(db: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.db, self.table)
    }
}

/// What a task will read, and how slowly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanInfo {
    pub info_tables: Vec<TableRef>,
    pub rating: ScanRating,
}

/// One shard to be dispatched for a user query: the chunk id and the
/// sub-chunk ids used by spatial-join fragments. Immutable once attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpec {
    pub chunk_id: ChunkId,
    pub subchunks: Vec<i32>,
}

impl ChunkSpec {
    pub fn new(chunk_id: ChunkId) -> Self {
        Self {
            chunk_id,
            subchunks: Vec::new(),
        }
    }

    pub fn with_subchunks(chunk_id: ChunkId, subchunks: Vec<i32>) -> Self {
        Self {
            chunk_id,
            subchunks,
        }
    }
}

/// Addressable unit of worker-side work: one chunk of one database.
/// Rendered as `/chk/<db>/<chunkId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    pub db: String,
    pub chunk_id: ChunkId,
}

impl ResourcePath {
    pub fn new(db: impl Into<String>, chunk_id: ChunkId) -> Self {
        Self {
            db: db.into(),
            chunk_id,
        }
    }

    /// Parse a `/chk/<db>/<chunkId>` path.
    pub fn parse(path: &str) -> Option<ResourcePath> {
        let mut parts = path.strip_prefix("/chk/")?.splitn(2, '/');
        let db = parts.next()?;
        let chunk: i32 = parts.next()?.parse().ok()?;
        if db.is_empty() {
            return None;
        }
        Some(ResourcePath::new(db, ChunkId(chunk)))
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/chk/{}/{}", self.db, self.chunk_id)
    }
}
