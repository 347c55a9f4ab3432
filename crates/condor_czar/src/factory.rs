//! Classifies incoming SQL and constructs the matching user query.

use std::sync::Arc;

use condor_common::config::CzarConfig;
use condor_common::CzarId;

use crate::analysis::QuerySession;
use crate::executive::{Executive, WorkerDispatcher};
use crate::merge::{MergerConfig, ResultDbConn};
use crate::messages::MessageStore;
use crate::qmeta::{Catalog, QueryMetadata, SecondaryIndex};
use crate::query_class::{classify, QueryClass};
use crate::user_query::{
    UserQuery, UserQueryDrop, UserQueryFlushChunksCache, UserQueryInvalid, UserQuerySelect,
};

/// State shared between user queries: catalog access, query metadata, the
/// result-db connection and the dispatch transport. The czar registers
/// itself in the metadata at construction.
pub struct UserQueryFactory {
    config: CzarConfig,
    catalog: Arc<dyn Catalog>,
    qmeta: Arc<dyn QueryMetadata>,
    result_conn: Arc<dyn ResultDbConn>,
    secondary_index: Arc<dyn SecondaryIndex>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    czar_id: CzarId,
}

impl UserQueryFactory {
    pub fn new(
        config: CzarConfig,
        catalog: Arc<dyn Catalog>,
        qmeta: Arc<dyn QueryMetadata>,
        result_conn: Arc<dyn ResultDbConn>,
        secondary_index: Arc<dyn SecondaryIndex>,
        dispatcher: Arc<dyn WorkerDispatcher>,
    ) -> Self {
        let czar_id = qmeta.register_czar(&config.czar_name);
        tracing::debug!(czar = %config.czar_name, czar_id = %czar_id, "czar registered");
        Self {
            config,
            catalog,
            qmeta,
            result_conn,
            secondary_index,
            dispatcher,
            czar_id,
        }
    }

    pub fn czar_id(&self) -> CzarId {
        self.czar_id
    }

    /// Build a user query for one SQL statement. A SELECT with analysis
    /// errors still yields a query object so the error is retrievable
    /// through the handle API.
    pub fn new_user_query(&self, sql: &str, default_db: &str) -> Arc<dyn UserQuery> {
        match classify(sql) {
            QueryClass::Select => {
                let session = QuerySession::analyze(sql, default_db, &*self.catalog);
                if !session.is_valid() {
                    tracing::warn!(error = %session.get_error(), "invalid SELECT accepted for error retrieval");
                }
                let msg_store = Arc::new(MessageStore::new());
                let executive =
                    Executive::new(Arc::clone(&self.dispatcher), Arc::clone(&msg_store));
                let mut merger_config = MergerConfig::new(self.config.result_db.clone());
                merger_config.merge_stmt = session.merge_stmt().map(str::to_string);
                Arc::new(UserQuerySelect::new(
                    session,
                    msg_store,
                    executive,
                    merger_config,
                    Arc::clone(&self.result_conn),
                    Arc::clone(&self.qmeta),
                    Arc::clone(&self.catalog),
                    Arc::clone(&self.secondary_index),
                    self.czar_id,
                ))
            }
            QueryClass::DropTable { db, table } => {
                let db = db.unwrap_or_else(|| default_db.to_string());
                tracing::debug!(db = %db, table = %table, "drop table query");
                Arc::new(UserQueryDrop::new(Arc::clone(&self.catalog), db, Some(table)))
            }
            QueryClass::DropDb { db } => {
                tracing::debug!(db = %db, "drop database query");
                Arc::new(UserQueryDrop::new(Arc::clone(&self.catalog), db, None))
            }
            QueryClass::FlushChunksCache { db } => {
                Arc::new(UserQueryFlushChunksCache::new(Arc::clone(&self.catalog), db))
            }
            QueryClass::Invalid => Arc::new(UserQueryInvalid::new(format!(
                "Invalid or unsupported query: {sql}"
            ))),
        }
    }
}
