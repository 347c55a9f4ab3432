//! Streaming ingestion of decoded result fragments into the merge table.
//!
//! The merge table is append-only: rows from every shard land in one
//! physical table, created on the first merge. The merger serializes
//! conflicting writes internally; one merger exists per user query.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use condor_common::{CondorError, CondorResult};
use condor_proto::ResponseRow;

use crate::recv::WorkerResponse;

/// `(secondsMod10000)(micros)`: pseudo-unique suffix for merge tables.
pub fn timestamp_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}{}", now.as_secs() % 10000, now.subsec_micros())
}

/// Configuration for one query's merger.
#[derive(Debug, Clone)]
pub struct MergerConfig {
    pub target_db: String,
    /// User-supplied merge table name; generated when absent.
    pub target_table: Option<String>,
    /// Post-merge statement (ORDER BY and aggregation fixups) applied by
    /// the caller at finalize time; recorded for query metadata.
    pub merge_stmt: Option<String>,
}

impl MergerConfig {
    pub fn new(target_db: impl Into<String>) -> Self {
        Self {
            target_db: target_db.into(),
            target_table: None,
            merge_stmt: None,
        }
    }
}

/// Connection to the database holding merge tables.
pub trait ResultDbConn: Send + Sync {
    /// `CREATE TABLE <table> ...` seeded with the first fragment's rows.
    fn create_table(&self, table: &str, rows: &[ResponseRow]) -> CondorResult<()>;
    /// `INSERT INTO <table> ...`; rows are appended, never updated.
    fn insert_rows(&self, table: &str, rows: &[ResponseRow]) -> CondorResult<()>;
    fn drop_table(&self, table: &str) -> CondorResult<()>;
    fn table_exists(&self, table: &str) -> bool;
}

/// In-memory result database.
#[derive(Default)]
pub struct MemResultDb {
    tables: Mutex<HashMap<String, Vec<ResponseRow>>>,
    fail_inserts: Mutex<Option<String>>,
}

impl MemResultDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with the given message.
    pub fn inject_failure(&self, msg: Option<String>) {
        *self.fail_inserts.lock() = msg;
    }

    pub fn rows(&self, table: &str) -> Option<Vec<ResponseRow>> {
        self.tables.lock().get(table).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.lock().keys().cloned().collect()
    }

    fn check_failure(&self) -> CondorResult<()> {
        if let Some(msg) = self.fail_inserts.lock().clone() {
            return Err(CondorError::Merge(msg));
        }
        Ok(())
    }
}

impl ResultDbConn for MemResultDb {
    fn create_table(&self, table: &str, rows: &[ResponseRow]) -> CondorResult<()> {
        self.check_failure()?;
        let mut tables = self.tables.lock();
        if tables.contains_key(table) {
            return Err(CondorError::Merge(format!("table {table} already exists")));
        }
        tables.insert(table.to_string(), rows.to_vec());
        Ok(())
    }

    fn insert_rows(&self, table: &str, rows: &[ResponseRow]) -> CondorResult<()> {
        self.check_failure()?;
        let mut tables = self.tables.lock();
        let existing = tables
            .get_mut(table)
            .ok_or_else(|| CondorError::Merge(format!("table {table} does not exist")))?;
        existing.extend_from_slice(rows);
        Ok(())
    }

    fn drop_table(&self, table: &str) -> CondorResult<()> {
        self.tables.lock().remove(table);
        Ok(())
    }

    fn table_exists(&self, table: &str) -> bool {
        self.tables.lock().contains_key(table)
    }
}

#[derive(Default)]
struct MergeState {
    created: bool,
    finished: bool,
    merge_count: u64,
    row_count: u64,
}

/// Ingests decoded worker responses into the merge table.
pub struct InfileMerger {
    table: String,
    conn: Arc<dyn ResultDbConn>,
    state: Mutex<MergeState>,
    error: Mutex<Option<String>>,
}

impl InfileMerger {
    pub fn new(config: &MergerConfig, conn: Arc<dyn ResultDbConn>) -> Self {
        let table = match &config.target_table {
            Some(t) => t.clone(),
            None => format!("{}.result_{}", config.target_db, timestamp_id()),
        };
        Self {
            table,
            conn,
            state: Mutex::new(MergeState::default()),
            error: Mutex::new(None),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Append one decoded response to the merge table. Thread-safe under
    /// concurrent shard responses; returns false and records the error on
    /// failure.
    pub fn merge(&self, response: &WorkerResponse) -> bool {
        let Some(body) = response.body.as_ref() else {
            self.set_error("merge called without a decoded body".to_string());
            return false;
        };
        let mut state = self.state.lock();
        if state.finished {
            self.set_error("merge after finalize".to_string());
            return false;
        }
        let result = if state.created {
            self.conn.insert_rows(&self.table, &body.rows)
        } else {
            self.conn.create_table(&self.table, &body.rows)
        };
        match result {
            Ok(()) => {
                state.created = true;
                state.merge_count += 1;
                state.row_count += body.rows.len() as u64;
                tracing::debug!(
                    table = %self.table,
                    rows = body.rows.len(),
                    total = state.row_count,
                    "fragment merged"
                );
                true
            }
            Err(e) => {
                self.set_error(e.to_string());
                false
            }
        }
    }

    /// All data is in; run the post-merge step and refuse further merges.
    pub fn finalize(&self) -> CondorResult<()> {
        let mut state = self.state.lock();
        state.finished = true;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Drop the merge table.
    pub fn discard(&self) -> CondorResult<()> {
        self.conn.drop_table(&self.table)
    }

    pub fn get_error(&self) -> String {
        self.error.lock().clone().unwrap_or_default()
    }

    pub fn row_count(&self) -> u64 {
        self.state.lock().row_count
    }

    fn set_error(&self, msg: String) {
        tracing::error!(table = %self.table, "merge failed: {msg}");
        *self.error.lock() = Some(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use condor_proto::ResponseBody;

    fn response(rows: Vec<ResponseRow>) -> WorkerResponse {
        WorkerResponse {
            header: None,
            body: Some(ResponseBody {
                rows,
                continues: false,
                error: None,
            }),
        }
    }

    #[test]
    fn test_table_name_generated_from_target_db() {
        let merger = InfileMerger::new(&MergerConfig::new("qres"), Arc::new(MemResultDb::new()));
        assert!(merger.table_name().starts_with("qres.result_"));
    }

    #[test]
    fn test_user_supplied_table_name_wins() {
        let mut config = MergerConfig::new("qres");
        config.target_table = Some("qres.mine".into());
        let merger = InfileMerger::new(&config, Arc::new(MemResultDb::new()));
        assert_eq!(merger.table_name(), "qres.mine");
    }

    #[test]
    fn test_first_merge_creates_then_appends() {
        let db = Arc::new(MemResultDb::new());
        let merger = InfileMerger::new(&MergerConfig::new("qres"), db.clone());
        assert!(merger.merge(&response(vec![ResponseRow::of(&["1"])])));
        assert!(merger.merge(&response(vec![
            ResponseRow::of(&["2"]),
            ResponseRow::of(&["3"])
        ])));
        assert_eq!(merger.row_count(), 3);
        let rows = db.rows(merger.table_name()).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn test_merge_failure_records_error() {
        let db = Arc::new(MemResultDb::new());
        db.inject_failure(Some("disk full".into()));
        let merger = InfileMerger::new(&MergerConfig::new("qres"), db.clone());
        assert!(!merger.merge(&response(vec![ResponseRow::of(&["1"])])));
        assert!(merger.get_error().contains("disk full"));
    }

    #[test]
    fn test_merge_after_finalize_refused() {
        let merger = InfileMerger::new(&MergerConfig::new("qres"), Arc::new(MemResultDb::new()));
        assert!(merger.merge(&response(vec![ResponseRow::of(&["1"])])));
        merger.finalize().unwrap();
        assert!(merger.is_finished());
        assert!(!merger.merge(&response(vec![ResponseRow::of(&["2"])])));
        assert!(merger.get_error().contains("finalize"));
    }

    #[test]
    fn test_discard_drops_table() {
        let db = Arc::new(MemResultDb::new());
        let merger = InfileMerger::new(&MergerConfig::new("qres"), db.clone());
        assert!(merger.merge(&response(vec![ResponseRow::of(&["1"])])));
        assert!(db.table_exists(merger.table_name()));
        merger.finalize().unwrap();
        merger.discard().unwrap();
        assert!(!db.table_exists(merger.table_name()));
        // Idempotent.
        merger.discard().unwrap();
    }

    #[test]
    fn test_merge_without_body_fails() {
        let merger = InfileMerger::new(&MergerConfig::new("qres"), Arc::new(MemResultDb::new()));
        let empty = WorkerResponse {
            header: None,
            body: None,
        };
        assert!(!merger.merge(&empty));
    }

    #[test]
    fn test_concurrent_merges_all_land() {
        let db = Arc::new(MemResultDb::new());
        let merger = Arc::new(InfileMerger::new(&MergerConfig::new("qres"), db.clone()));
        std::thread::scope(|s| {
            for i in 0..8 {
                let merger = Arc::clone(&merger);
                s.spawn(move || {
                    let row = ResponseRow::of(&[&i.to_string()]);
                    assert!(merger.merge(&response(vec![row])));
                });
            }
        });
        assert_eq!(merger.row_count(), 8);
        assert_eq!(db.rows(merger.table_name()).unwrap().len(), 8);
    }
}
