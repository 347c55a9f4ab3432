//! Query metadata (one row per submitted query, plus czar registration)
//! and catalog access (table existence, partitioning, chunk cache).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use condor_common::{ChunkId, CondorError, CondorResult, CzarId, QueryId};

/// Status of a registered query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Executing,
    Completed,
    Failed,
    Aborted,
}

/// What gets registered for one query.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub czar_id: CzarId,
    pub user: String,
    pub original: String,
    pub query_template: String,
    pub merge_stmt: Option<String>,
}

/// Query-metadata contract. Registration happens before dispatch so a
/// failed query still leaves an auditable row.
pub trait QueryMetadata: Send + Sync {
    fn register_czar(&self, name: &str) -> CzarId;
    fn register_query(&self, info: QueryInfo, tables: &[(String, String)]) -> QueryId;
    fn complete_query(&self, query_id: QueryId, status: QueryStatus);
    fn add_chunks(&self, query_id: QueryId, chunks: &[ChunkId]);
    fn query_status(&self, query_id: QueryId) -> Option<QueryStatus>;
}

#[derive(Debug, Clone)]
struct QueryRow {
    #[allow(dead_code)]
    info: QueryInfo,
    status: QueryStatus,
    chunks: Vec<ChunkId>,
}

/// In-memory metadata store.
#[derive(Default)]
pub struct MemQueryMetadata {
    czars: Mutex<HashMap<String, CzarId>>,
    next_czar: AtomicU32,
    queries: Mutex<HashMap<QueryId, QueryRow>>,
    next_query: AtomicU64,
}

impl MemQueryMetadata {
    pub fn new() -> Self {
        Self {
            next_czar: AtomicU32::new(1),
            next_query: AtomicU64::new(1),
            ..Default::default()
        }
    }
}

impl QueryMetadata for MemQueryMetadata {
    fn register_czar(&self, name: &str) -> CzarId {
        let mut czars = self.czars.lock();
        if let Some(&id) = czars.get(name) {
            return id;
        }
        let id = CzarId(self.next_czar.fetch_add(1, Ordering::Relaxed));
        czars.insert(name.to_string(), id);
        id
    }

    fn register_query(&self, info: QueryInfo, _tables: &[(String, String)]) -> QueryId {
        let id = QueryId(self.next_query.fetch_add(1, Ordering::Relaxed));
        self.queries.lock().insert(
            id,
            QueryRow {
                info,
                status: QueryStatus::Executing,
                chunks: Vec::new(),
            },
        );
        id
    }

    fn complete_query(&self, query_id: QueryId, status: QueryStatus) {
        if let Some(row) = self.queries.lock().get_mut(&query_id) {
            row.status = status;
        }
    }

    fn add_chunks(&self, query_id: QueryId, chunks: &[ChunkId]) {
        if let Some(row) = self.queries.lock().get_mut(&query_id) {
            row.chunks.extend_from_slice(chunks);
        }
    }

    fn query_status(&self, query_id: QueryId) -> Option<QueryStatus> {
        self.queries.lock().get(&query_id).map(|r| r.status)
    }
}

// ── Catalog access ───────────────────────────────────────────────────────

/// Catalog lookups the czar needs: which tables exist, which are
/// partitioned, and the cached chunk metadata.
pub trait Catalog: Send + Sync {
    fn db_exists(&self, db: &str) -> bool;
    /// A table whose database has been dropped does not exist.
    fn table_exists(&self, db: &str, table: &str) -> bool;
    fn is_partitioned(&self, db: &str, table: &str) -> bool;
    /// Scan-rate class of a table; lower = slower. 0 when unknown.
    fn scan_rating(&self, _db: &str, _table: &str) -> i32 {
        0
    }
    fn drop_table(&self, db: &str, table: &str) -> CondorResult<()>;
    fn drop_db(&self, db: &str) -> CondorResult<()>;
    /// Clear cached chunk metadata; `db = None` clears everything.
    fn flush_chunk_cache(&self, db: Option<&str>);
}

/// Chunk coverage lookup: which chunks exist for a database. Consulted at
/// submit time when the caller attached no chunks explicitly.
pub trait SecondaryIndex: Send + Sync {
    /// Chunks available for a database, in numeric order.
    fn chunk_coverage(&self, db: &str) -> Vec<ChunkId>;
}

/// In-memory secondary index.
#[derive(Default)]
pub struct MemSecondaryIndex {
    coverage: Mutex<HashMap<String, std::collections::BTreeSet<i32>>>,
}

impl MemSecondaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunk(&self, db: &str, chunk_id: ChunkId) {
        self.coverage
            .lock()
            .entry(db.to_string())
            .or_default()
            .insert(chunk_id.0);
    }
}

impl SecondaryIndex for MemSecondaryIndex {
    fn chunk_coverage(&self, db: &str) -> Vec<ChunkId> {
        self.coverage
            .lock()
            .get(db)
            .map(|set| set.iter().map(|&c| ChunkId(c)).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
struct TableMeta {
    partitioned: bool,
    scan_rating: i32,
}

#[derive(Default)]
struct CatalogState {
    dbs: HashMap<String, HashMap<String, TableMeta>>,
    chunk_cache: HashSet<(String, i32)>,
}

/// In-memory catalog.
#[derive(Default)]
pub struct MemCatalog {
    state: Mutex<CatalogState>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, db: &str, table: &str, partitioned: bool) {
        self.add_table_with_rating(db, table, partitioned, 0);
    }

    pub fn add_table_with_rating(&self, db: &str, table: &str, partitioned: bool, rating: i32) {
        self.state.lock().dbs.entry(db.to_string()).or_default().insert(
            table.to_string(),
            TableMeta {
                partitioned,
                scan_rating: rating,
            },
        );
    }

    pub fn cache_chunk(&self, db: &str, chunk_id: ChunkId) {
        self.state
            .lock()
            .chunk_cache
            .insert((db.to_string(), chunk_id.0));
    }

    pub fn cached_chunk_count(&self, db: &str) -> usize {
        self.state
            .lock()
            .chunk_cache
            .iter()
            .filter(|(d, _)| d == db)
            .count()
    }
}

impl Catalog for MemCatalog {
    fn db_exists(&self, db: &str) -> bool {
        self.state.lock().dbs.contains_key(db)
    }

    fn table_exists(&self, db: &str, table: &str) -> bool {
        self.state
            .lock()
            .dbs
            .get(db)
            .map(|t| t.contains_key(table))
            .unwrap_or(false)
    }

    fn is_partitioned(&self, db: &str, table: &str) -> bool {
        self.state
            .lock()
            .dbs
            .get(db)
            .and_then(|t| t.get(table))
            .map(|m| m.partitioned)
            .unwrap_or(false)
    }

    fn scan_rating(&self, db: &str, table: &str) -> i32 {
        self.state
            .lock()
            .dbs
            .get(db)
            .and_then(|t| t.get(table))
            .map(|m| m.scan_rating)
            .unwrap_or(0)
    }

    fn drop_table(&self, db: &str, table: &str) -> CondorResult<()> {
        let mut state = self.state.lock();
        let tables = state
            .dbs
            .get_mut(db)
            .ok_or_else(|| CondorError::NotFound(format!("database {db}")))?;
        if tables.remove(table).is_none() {
            return Err(CondorError::NotFound(format!("table {db}.{table}")));
        }
        Ok(())
    }

    fn drop_db(&self, db: &str) -> CondorResult<()> {
        let mut state = self.state.lock();
        if state.dbs.remove(db).is_none() {
            return Err(CondorError::NotFound(format!("database {db}")));
        }
        state.chunk_cache.retain(|(d, _)| d != db);
        Ok(())
    }

    fn flush_chunk_cache(&self, db: Option<&str>) {
        let mut state = self.state.lock();
        match db {
            Some(db) => state.chunk_cache.retain(|(d, _)| d != db),
            None => state.chunk_cache.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_czar_is_stable() {
        let meta = MemQueryMetadata::new();
        let a = meta.register_czar("czar0");
        let b = meta.register_czar("czar0");
        let c = meta.register_czar("czar1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_query_lifecycle_rows() {
        let meta = MemQueryMetadata::new();
        let czar = meta.register_czar("czar0");
        let id = meta.register_query(
            QueryInfo {
                czar_id: czar,
                user: "anonymous".into(),
                original: "SELECT 1".into(),
                query_template: "SELECT 1".into(),
                merge_stmt: None,
            },
            &[("LSST".into(), "Object".into())],
        );
        assert_eq!(meta.query_status(id), Some(QueryStatus::Executing));
        meta.add_chunks(id, &[ChunkId(1), ChunkId(2)]);
        meta.complete_query(id, QueryStatus::Completed);
        assert_eq!(meta.query_status(id), Some(QueryStatus::Completed));
    }

    #[test]
    fn test_catalog_existence_and_partitioning() {
        let cat = MemCatalog::new();
        cat.add_table("LSST", "Object", true);
        cat.add_table("LSST", "Filter", false);
        assert!(cat.table_exists("LSST", "Object"));
        assert!(cat.is_partitioned("LSST", "Object"));
        assert!(!cat.is_partitioned("LSST", "Filter"));
        assert!(!cat.table_exists("LSST", "Source"));
        assert!(!cat.table_exists("Other", "Object"));
    }

    #[test]
    fn test_drop_table() {
        let cat = MemCatalog::new();
        cat.add_table("LSST", "Object", true);
        cat.drop_table("LSST", "Object").unwrap();
        assert!(!cat.table_exists("LSST", "Object"));
        assert!(cat.drop_table("LSST", "Object").is_err());
    }

    #[test]
    fn test_table_does_not_exist_after_db_drop() {
        let cat = MemCatalog::new();
        cat.add_table("LSST", "Object", true);
        cat.drop_db("LSST").unwrap();
        assert!(!cat.db_exists("LSST"));
        assert!(!cat.table_exists("LSST", "Object"));
    }

    #[test]
    fn test_secondary_index_coverage_sorted() {
        let idx = MemSecondaryIndex::new();
        idx.add_chunk("LSST", ChunkId(30));
        idx.add_chunk("LSST", ChunkId(10));
        idx.add_chunk("LSST", ChunkId(20));
        idx.add_chunk("Other", ChunkId(1));
        assert_eq!(
            idx.chunk_coverage("LSST"),
            vec![ChunkId(10), ChunkId(20), ChunkId(30)]
        );
        assert!(idx.chunk_coverage("Missing").is_empty());
    }

    #[test]
    fn test_flush_chunk_cache_scoped_by_db() {
        let cat = MemCatalog::new();
        cat.cache_chunk("LSST", ChunkId(1));
        cat.cache_chunk("LSST", ChunkId(2));
        cat.cache_chunk("Other", ChunkId(1));
        cat.flush_chunk_cache(Some("LSST"));
        assert_eq!(cat.cached_chunk_count("LSST"), 0);
        assert_eq!(cat.cached_chunk_count("Other"), 1);
        cat.flush_chunk_cache(None);
        assert_eq!(cat.cached_chunk_count("Other"), 0);
    }
}
