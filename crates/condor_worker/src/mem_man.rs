//! Page-lock admission control for table scans.
//!
//! A task asks the memory manager to lock the tables it will read before it
//! may run. Implementations reference-count per-chunk table locks so that
//! consecutive tasks on the same shard reuse the pages already resident.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use condor_common::config::MemManConfig;
use condor_common::{ChunkId, TableRef};

/// Opaque token acknowledging that the pages needed for a scan are resident.
/// Must be released by the task when the scan is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u64);

impl Handle {
    /// Granted when there was nothing to lock: an empty table vector, or a
    /// table that does not exist (the scan runs and fails cleanly).
    pub const EMPTY: Handle = Handle(1);

    pub fn is_empty(&self) -> bool {
        *self == Handle::EMPTY
    }
}

/// How hard to lock a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// The scan cannot run until the pages are resident.
    Required,
    /// Lock if cheap; the scan tolerates cold pages.
    Flexible,
    /// No lock (indexes).
    NoLock,
}

/// One table the task wants locked.
#[derive(Debug, Clone)]
pub struct TableLock {
    pub table: TableRef,
    pub lock: LockType,
}

/// Why `prepare` refused a handle.
#[derive(Error, Debug)]
pub enum MemManError {
    #[error("out of memory: need {needed} bytes, {available} available")]
    OutOfMemory { needed: u64, available: u64 },

    #[error("table not found: {0}")]
    NotFound(String),

    #[error("file system error: {0}")]
    Io(String),
}

/// Admission-control contract consumed by the shard scan scheduler.
pub trait MemMan: Send + Sync {
    fn prepare(&self, tables: &[TableLock], chunk_id: ChunkId) -> Result<Handle, MemManError>;
    fn release(&self, handle: Handle);
    fn bytes_locked(&self) -> u64;
}

/// Memory manager that grants everything. Tests and configurations without
/// a page budget.
pub struct GrantAllMemMan {
    next: AtomicU64,
}

impl GrantAllMemMan {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(2),
        }
    }
}

impl Default for GrantAllMemMan {
    fn default() -> Self {
        Self::new()
    }
}

impl MemMan for GrantAllMemMan {
    fn prepare(&self, tables: &[TableLock], _chunk_id: ChunkId) -> Result<Handle, MemManError> {
        if tables.is_empty() {
            return Ok(Handle::EMPTY);
        }
        Ok(Handle(self.next.fetch_add(1, Ordering::Relaxed)))
    }

    fn release(&self, _handle: Handle) {}

    fn bytes_locked(&self) -> u64 {
        0
    }
}

#[derive(Debug)]
struct LockEntry {
    refs: u32,
    bytes: u64,
}

#[derive(Default)]
struct BudgetState {
    /// (db, table, chunk) → refcounted lock.
    locked: HashMap<(String, String, i32), LockEntry>,
    /// handle → keys it pinned.
    handles: HashMap<u64, Vec<(String, String, i32)>>,
    used: u64,
    next_handle: u64,
}

/// Byte-budget memory manager with refcounted per-chunk table locks.
pub struct BudgetMemMan {
    budget: AtomicU64,
    default_table_bytes: u64,
    /// (db, table, chunk) → size of that chunk table on disk.
    sizes: Mutex<HashMap<(String, String, i32), u64>>,
    state: Mutex<BudgetState>,
    /// When set, `prepare` reports a file-system failure. Fault injection.
    fail_io: Mutex<Option<String>>,
}

impl BudgetMemMan {
    pub fn new(config: &MemManConfig) -> Self {
        Self {
            budget: AtomicU64::new(config.budget_bytes),
            default_table_bytes: config.default_table_bytes,
            sizes: Mutex::new(HashMap::new()),
            state: Mutex::new(BudgetState {
                next_handle: 2,
                ..Default::default()
            }),
            fail_io: Mutex::new(None),
        }
    }

    /// Register a chunk table and its size. A table never registered does
    /// not exist as far as admission is concerned.
    pub fn register(&self, db: &str, table: &str, chunk_id: ChunkId, bytes: u64) {
        self.sizes
            .lock()
            .insert((db.to_string(), table.to_string(), chunk_id.0), bytes);
    }

    /// Raise or lower the budget at runtime. Starved shards become ready
    /// again on the next scheduler pass.
    pub fn set_budget(&self, bytes: u64) {
        self.budget.store(bytes, Ordering::Relaxed);
    }

    pub fn inject_io_failure(&self, msg: Option<String>) {
        *self.fail_io.lock() = msg;
    }
}

impl MemMan for BudgetMemMan {
    fn prepare(&self, tables: &[TableLock], chunk_id: ChunkId) -> Result<Handle, MemManError> {
        if let Some(msg) = self.fail_io.lock().clone() {
            return Err(MemManError::Io(msg));
        }
        if tables.is_empty() {
            return Ok(Handle::EMPTY);
        }

        let sizes = self.sizes.lock();
        let mut keys = Vec::with_capacity(tables.len());
        for tl in tables {
            if tl.lock == LockType::NoLock {
                continue;
            }
            let key = (tl.table.db.clone(), tl.table.table.clone(), chunk_id.0);
            match sizes.get(&key) {
                Some(&bytes) => keys.push((key, bytes)),
                None => {
                    if tl.lock == LockType::Required {
                        return Err(MemManError::NotFound(format!("{}", tl.table)));
                    }
                    // Flexible lock on an unknown table: assume the default
                    // footprint rather than refusing the scan.
                    keys.push((key, self.default_table_bytes));
                }
            }
        }
        drop(sizes);

        if keys.is_empty() {
            return Ok(Handle::EMPTY);
        }

        let mut state = self.state.lock();
        let new_bytes: u64 = keys
            .iter()
            .filter(|(key, _)| !state.locked.contains_key(key))
            .map(|(_, bytes)| *bytes)
            .sum();
        let budget = self.budget.load(Ordering::Relaxed);
        if state.used + new_bytes > budget {
            return Err(MemManError::OutOfMemory {
                needed: new_bytes,
                available: budget.saturating_sub(state.used),
            });
        }

        for (key, bytes) in &keys {
            match state.locked.get_mut(key) {
                Some(entry) => entry.refs += 1,
                None => {
                    state.locked.insert(
                        key.clone(),
                        LockEntry {
                            refs: 1,
                            bytes: *bytes,
                        },
                    );
                    state.used += bytes;
                }
            }
        }
        let handle = Handle(state.next_handle);
        state.next_handle += 1;
        let pinned: Vec<_> = keys.into_iter().map(|(k, _)| k).collect();
        state.handles.insert(handle.0, pinned);
        Ok(handle)
    }

    fn release(&self, handle: Handle) {
        if handle.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let Some(keys) = state.handles.remove(&handle.0) else {
            return;
        };
        for key in keys {
            if let Some(entry) = state.locked.get_mut(&key) {
                entry.refs -= 1;
                if entry.refs == 0 {
                    let bytes = entry.bytes;
                    state.locked.remove(&key);
                    state.used -= bytes;
                }
            }
        }
    }

    fn bytes_locked(&self) -> u64 {
        self.state.lock().used
    }
}
