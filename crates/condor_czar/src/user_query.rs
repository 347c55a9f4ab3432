//! Coordinator-side user-query lifecycle.
//!
//! A `UserQuery` is created by the factory, registered in the session
//! registry, and driven through submit → join → discard (or kill). The
//! object itself is handed out behind `Arc`; its delegates are thread-safe
//! as appropriate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use condor_common::{
    ChunkId, ChunkSpec, CondorError, CondorResult, CzarId, JobId, QueryId, QueryState,
    ResourcePath, DUMMY_CHUNK,
};

use crate::analysis::QuerySession;
use crate::executive::{Executive, JobDescription};
use crate::merge::{InfileMerger, MergerConfig, ResultDbConn};
use crate::messages::{MessageStore, Severity, MSG_TABLE_MISSING};
use crate::qmeta::{Catalog, QueryInfo, QueryMetadata, QueryStatus, SecondaryIndex};
use crate::recv::MergingHandler;
use crate::task_msg::{TaskMsgFactory, TmpTableName};

/// Operations available through a query handle.
pub trait UserQuery: Send + Sync {
    /// Non-empty only when an error has been detected.
    fn get_error(&self) -> String;
    /// Human-readable execution progress.
    fn get_exec_desc(&self) -> String;
    /// Attach a chunk for later dispatch. Only valid before submit.
    fn add_chunk(&self, spec: ChunkSpec) -> CondorResult<()>;
    /// Dispatch the query. Exactly one submit per query.
    fn submit(&self) -> CondorResult<()>;
    /// Block until execution is terminal.
    fn join(&self) -> QueryState;
    /// Cancel a query in progress. Idempotent.
    fn kill(&self);
    /// Release resources. Only valid after a terminal state; a repeat call
    /// is a no-op.
    fn discard(&self) -> CondorResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Planned,
    Running,
    Terminal(QueryState),
}

/// A SELECT over the partitioned catalog.
pub struct UserQuerySelect {
    session: Mutex<QuerySession>,
    msg_store: Arc<MessageStore>,
    executive: Arc<Executive>,
    merger_config: MergerConfig,
    merger: Mutex<Option<Arc<InfileMerger>>>,
    result_conn: Arc<dyn ResultDbConn>,
    qmeta: Arc<dyn QueryMetadata>,
    catalog: Arc<dyn Catalog>,
    secondary_index: Arc<dyn SecondaryIndex>,
    czar_id: CzarId,
    query_id: Mutex<Option<QueryId>>,
    phase: Mutex<Phase>,
    killed: AtomicBool,
    discarded: AtomicBool,
    error_extra: Mutex<String>,
}

impl UserQuerySelect {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: QuerySession,
        msg_store: Arc<MessageStore>,
        executive: Arc<Executive>,
        merger_config: MergerConfig,
        result_conn: Arc<dyn ResultDbConn>,
        qmeta: Arc<dyn QueryMetadata>,
        catalog: Arc<dyn Catalog>,
        secondary_index: Arc<dyn SecondaryIndex>,
        czar_id: CzarId,
    ) -> Self {
        Self {
            session: Mutex::new(session),
            msg_store,
            executive,
            merger_config,
            merger: Mutex::new(None),
            result_conn,
            qmeta,
            catalog,
            secondary_index,
            czar_id,
            query_id: Mutex::new(None),
            phase: Mutex::new(Phase::Planned),
            killed: AtomicBool::new(false),
            discarded: AtomicBool::new(false),
            error_extra: Mutex::new(String::new()),
        }
    }

    pub fn query_id(&self) -> Option<QueryId> {
        *self.query_id.lock()
    }

    /// The merge table this query writes, once submitted.
    pub fn result_table(&self) -> Option<String> {
        self.merger
            .lock()
            .as_ref()
            .map(|m| m.table_name().to_string())
    }

    fn set_error_extra(&self, msg: &str) {
        let mut extra = self.error_extra.lock();
        if extra.is_empty() {
            *extra = msg.to_string();
        }
    }
}

impl UserQuery for UserQuerySelect {
    fn get_error(&self) -> String {
        let session_err = self.session.lock().get_error();
        let extra = self.error_extra.lock().clone();
        let exec_err = self.executive.first_error().unwrap_or_default();
        let mut parts: Vec<String> = Vec::new();
        for p in [session_err, extra, exec_err] {
            if !p.is_empty() {
                parts.push(p);
            }
        }
        parts.join(" ")
    }

    fn get_exec_desc(&self) -> String {
        self.msg_store.describe()
    }

    fn add_chunk(&self, spec: ChunkSpec) -> CondorResult<()> {
        if *self.phase.lock() != Phase::Planned {
            return Err(CondorError::fatal(
                "E-UQ-001",
                "add_chunk after submit",
            ));
        }
        self.session.lock().add_chunk(spec);
        Ok(())
    }

    fn submit(&self) -> CondorResult<()> {
        let mut phase = self.phase.lock();
        if *phase != Phase::Planned {
            return Err(CondorError::fatal("E-UQ-002", "submit called twice"));
        }

        let mut session = self.session.lock();
        if !session.is_valid() {
            // Analysis already failed; the query is submittable so error
            // retrieval keeps working, but nothing is dispatched.
            tracing::debug!("submit on invalid session, dispatch skipped");
            *phase = Phase::Terminal(QueryState::Error);
            return Ok(());
        }

        // Register in metadata first so even a failed query leaves a row.
        let info = QueryInfo {
            czar_id: self.czar_id,
            user: "anonymous".to_string(),
            original: session.original().to_string(),
            query_template: session.query_template(),
            merge_stmt: self.merger_config.merge_stmt.clone(),
        };
        let query_id = self.qmeta.register_query(info, session.from_tables());
        *self.query_id.lock() = Some(query_id);
        self.executive.set_query_id(query_id);
        tracing::debug!(query_id = %query_id, "user query registered");

        // Every referenced table must still exist; this check must follow
        // registration.
        for (db, table) in session.from_tables() {
            if !self.catalog.table_exists(db, table) {
                self.qmeta.complete_query(query_id, QueryStatus::Failed);
                let msg = format!("Table '{db}.{table}' does not exist");
                self.msg_store
                    .add_message(ChunkId(-1), MSG_TABLE_MISSING, Severity::Error, &msg);
                self.set_error_extra(&msg);
                *phase = Phase::Terminal(QueryState::Error);
                return Err(CondorError::NotFound(msg));
            }
        }

        let merger = Arc::new(InfileMerger::new(
            &self.merger_config,
            Arc::clone(&self.result_conn),
        ));
        *self.merger.lock() = Some(Arc::clone(&merger));

        // Chunk coverage: an unconstrained chunked query with no chunks
        // attached runs over every chunk the index knows; a query over
        // unpartitioned tables runs on the dummy chunk.
        if session.chunk_specs().is_empty() {
            if session.has_chunks() {
                for chunk_id in self.secondary_index.chunk_coverage(session.dominant_db()) {
                    session.add_chunk(ChunkSpec::new(chunk_id));
                }
            } else {
                session.add_chunk(ChunkSpec::new(DUMMY_CHUNK));
            }
        }

        let factory = TaskMsgFactory::new(query_id);
        let ttn = TmpTableName::new(query_id);
        let mut chunks: Vec<ChunkId> = Vec::new();
        let mut sequence: u32 = 0;
        for spec in session.chunk_specs() {
            if self.executive.is_cancelled() {
                break;
            }
            chunks.push(spec.chunk_id);
            let result_table = ttn.make(spec.chunk_id.0);
            let payload = factory.serialize_msg(&session, spec, sequence, &result_table);
            let cancelled = Arc::new(AtomicBool::new(false));
            let handler = MergingHandler::new(
                Arc::clone(&merger),
                merger.table_name().to_string(),
                query_id,
                spec.chunk_id,
                Arc::clone(&cancelled),
                Arc::clone(&self.msg_store),
            );
            let desc = JobDescription {
                query_id,
                job_id: JobId(sequence),
                chunk_id: spec.chunk_id,
                resource: ResourcePath::new(session.dominant_db(), spec.chunk_id),
                payload,
            };
            self.executive.add(desc, handler, cancelled);
            sequence += 1;
        }
        tracing::debug!(query_id = %query_id, jobs = sequence, "user query submitted");
        self.qmeta.add_chunks(query_id, &chunks);
        *phase = Phase::Running;
        Ok(())
    }

    fn join(&self) -> QueryState {
        {
            let phase = self.phase.lock();
            match *phase {
                Phase::Terminal(state) => return state,
                Phase::Planned => return QueryState::Error,
                Phase::Running => {}
            }
        }

        let ok = self.executive.join();
        if let Some(merger) = self.merger.lock().as_ref() {
            // All data is in; run the final merge step.
            let _ = merger.finalize();
        }

        let state = if self.killed.load(Ordering::Acquire) {
            QueryState::Cancelled
        } else if ok {
            QueryState::Success
        } else {
            QueryState::Error
        };
        if state != QueryState::Cancelled {
            if let Some(query_id) = *self.query_id.lock() {
                let status = match state {
                    QueryState::Success => QueryStatus::Completed,
                    _ => QueryStatus::Failed,
                };
                self.qmeta.complete_query(query_id, status);
            }
        }
        tracing::debug!(state = %state, "user query joined");
        *self.phase.lock() = Phase::Terminal(state);
        state
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("user query kill");
        self.executive.squash();
        if let Some(query_id) = *self.query_id.lock() {
            self.qmeta.complete_query(query_id, QueryStatus::Aborted);
        }
    }

    fn discard(&self) -> CondorResult<()> {
        if self.discarded.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.killed.load(Ordering::Acquire) {
            // The client no longer cares about merger errors.
            return Ok(());
        }
        if *self.phase.lock() == Phase::Running && self.executive.num_inflight() > 0 {
            self.discarded.store(false, Ordering::Release);
            return Err(CondorError::fatal(
                "E-UQ-003",
                "executive unfinished, cannot discard",
            ));
        }
        if let Some(merger) = self.merger.lock().take() {
            let _ = merger.finalize();
            merger.discard()?;
        }
        tracing::debug!("user query discarded");
        Ok(())
    }
}

/// DROP TABLE / DROP DATABASE.
pub struct UserQueryDrop {
    catalog: Arc<dyn Catalog>,
    db: String,
    /// `None` drops the whole database.
    table: Option<String>,
    state: Mutex<Option<QueryState>>,
    error: Mutex<String>,
}

impl UserQueryDrop {
    pub fn new(catalog: Arc<dyn Catalog>, db: impl Into<String>, table: Option<String>) -> Self {
        Self {
            catalog,
            db: db.into(),
            table,
            state: Mutex::new(None),
            error: Mutex::new(String::new()),
        }
    }
}

impl UserQuery for UserQueryDrop {
    fn get_error(&self) -> String {
        self.error.lock().clone()
    }

    fn get_exec_desc(&self) -> String {
        match &self.table {
            Some(t) => format!("DROP TABLE {}.{}", self.db, t),
            None => format!("DROP DATABASE {}", self.db),
        }
    }

    fn add_chunk(&self, _spec: ChunkSpec) -> CondorResult<()> {
        Err(CondorError::Analysis("DROP takes no chunks".into()))
    }

    fn submit(&self) -> CondorResult<()> {
        let result = match &self.table {
            Some(table) => self.catalog.drop_table(&self.db, table),
            None => self.catalog.drop_db(&self.db),
        };
        match result {
            Ok(()) => {
                *self.state.lock() = Some(QueryState::Success);
                Ok(())
            }
            Err(e) => {
                *self.error.lock() = e.to_string();
                *self.state.lock() = Some(QueryState::Error);
                Err(e)
            }
        }
    }

    fn join(&self) -> QueryState {
        self.state.lock().unwrap_or(QueryState::Error)
    }

    fn kill(&self) {}

    fn discard(&self) -> CondorResult<()> {
        Ok(())
    }
}

/// FLUSH QSERV_CHUNKS_CACHE [FOR db].
pub struct UserQueryFlushChunksCache {
    catalog: Arc<dyn Catalog>,
    db: Option<String>,
    state: Mutex<Option<QueryState>>,
}

impl UserQueryFlushChunksCache {
    pub fn new(catalog: Arc<dyn Catalog>, db: Option<String>) -> Self {
        Self {
            catalog,
            db,
            state: Mutex::new(None),
        }
    }
}

impl UserQuery for UserQueryFlushChunksCache {
    fn get_error(&self) -> String {
        String::new()
    }

    fn get_exec_desc(&self) -> String {
        match &self.db {
            Some(db) => format!("FLUSH QSERV_CHUNKS_CACHE FOR {db}"),
            None => "FLUSH QSERV_CHUNKS_CACHE".to_string(),
        }
    }

    fn add_chunk(&self, _spec: ChunkSpec) -> CondorResult<()> {
        Err(CondorError::Analysis("FLUSH takes no chunks".into()))
    }

    fn submit(&self) -> CondorResult<()> {
        self.catalog.flush_chunk_cache(self.db.as_deref());
        *self.state.lock() = Some(QueryState::Success);
        Ok(())
    }

    fn join(&self) -> QueryState {
        self.state.lock().unwrap_or(QueryState::Error)
    }

    fn kill(&self) {}

    fn discard(&self) -> CondorResult<()> {
        Ok(())
    }
}

/// Anything the classifier did not recognize.
pub struct UserQueryInvalid {
    message: String,
}

impl UserQueryInvalid {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl UserQuery for UserQueryInvalid {
    fn get_error(&self) -> String {
        self.message.clone()
    }

    fn get_exec_desc(&self) -> String {
        "INVALID".to_string()
    }

    fn add_chunk(&self, _spec: ChunkSpec) -> CondorResult<()> {
        Err(CondorError::Analysis(self.message.clone()))
    }

    fn submit(&self) -> CondorResult<()> {
        Err(CondorError::Analysis(self.message.clone()))
    }

    fn join(&self) -> QueryState {
        QueryState::Error
    }

    fn kill(&self) {}

    fn discard(&self) -> CondorResult<()> {
        Ok(())
    }
}
