//! Handle-oriented session registry: external callers hold integer
//! handles, not object references. One concurrent map owns every live
//! user query.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use condor_common::{ChunkSpec, CondorError, CondorResult, QueryState};

use crate::factory::UserQueryFactory;
use crate::user_query::UserQuery;

/// Process-wide handle → user-query mapping plus the factory behind it.
pub struct SessionRegistry {
    factory: UserQueryFactory,
    sessions: DashMap<u64, Arc<dyn UserQuery>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new(factory: UserQueryFactory) -> Self {
        Self {
            factory,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Classify and construct a query; returns its session handle.
    pub fn new_user_query(&self, sql: &str, default_db: &str) -> u64 {
        let uq = self.factory.new_user_query(sql, default_db);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(id, uq);
        tracing::debug!(session = id, "user query session created");
        id
    }

    fn get(&self, session: u64) -> CondorResult<Arc<dyn UserQuery>> {
        self.sessions
            .get(&session)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CondorError::NotFound(format!("session {session}")))
    }

    pub fn add_chunk(&self, session: u64, spec: ChunkSpec) -> CondorResult<()> {
        self.get(session)?.add_chunk(spec)
    }

    pub fn submit(&self, session: u64) -> CondorResult<()> {
        self.get(session)?.submit()
    }

    pub fn join(&self, session: u64) -> CondorResult<QueryState> {
        Ok(self.get(session)?.join())
    }

    pub fn kill(&self, session: u64) -> CondorResult<()> {
        self.get(session)?.kill();
        Ok(())
    }

    /// Discard a session and drop its handle. Discarding an unknown (or
    /// already-discarded) session is a no-op.
    pub fn discard(&self, session: u64) -> CondorResult<()> {
        let Some((_, uq)) = self.sessions.remove(&session) else {
            return Ok(());
        };
        match uq.discard() {
            Ok(()) => Ok(()),
            Err(e) => {
                // Not discardable yet; keep the handle alive.
                self.sessions.insert(session, uq);
                Err(e)
            }
        }
    }

    pub fn get_error(&self, session: u64) -> CondorResult<String> {
        Ok(self.get(session)?.get_error())
    }

    pub fn get_exec_desc(&self, session: u64) -> CondorResult<String> {
        Ok(self.get(session)?.get_exec_desc())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
