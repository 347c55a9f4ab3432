//! Task-message construction: per-chunk result-table naming and the
//! serialized message handed to the dispatcher.

use condor_common::{ChunkSpec, QueryId};
use condor_proto::{encode_task_msg, Fragment, TaskMsg};

use crate::analysis::QuerySession;

/// Names the per-chunk intermediate result tables for one query.
pub struct TmpTableName {
    prefix: String,
}

impl TmpTableName {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            prefix: format!("r_{}", query_id.0),
        }
    }

    pub fn make(&self, chunk_id: i32) -> String {
        format!("{}_{}", self.prefix, chunk_id)
    }
}

/// Builds serialized task messages from the session's chunk specs.
pub struct TaskMsgFactory {
    query_id: QueryId,
}

impl TaskMsgFactory {
    pub fn new(query_id: QueryId) -> Self {
        Self { query_id }
    }

    /// One message per chunk: the fragment chain is instantiated for the
    /// chunk, in chain order, all writing the chunk's result table.
    pub fn make_msg(
        &self,
        session: &QuerySession,
        spec: &ChunkSpec,
        job_id: u32,
        result_table: &str,
    ) -> TaskMsg {
        let fragments = session
            .chunk_queries(spec.chunk_id.0)
            .into_iter()
            .map(|query| Fragment {
                result_table: result_table.to_string(),
                query,
                subchunks: spec.subchunks.clone(),
            })
            .collect();
        TaskMsg {
            session: self.query_id.0,
            job_id,
            db: session.dominant_db().to_string(),
            chunk_id: spec.chunk_id.0,
            fragments,
            scan_tables: session.scan_tables(),
            scan_rating: session.scan_rating(),
        }
    }

    pub fn serialize_msg(
        &self,
        session: &QuerySession,
        spec: &ChunkSpec,
        job_id: u32,
        result_table: &str,
    ) -> Vec<u8> {
        encode_task_msg(&self.make_msg(session, spec, job_id, result_table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qmeta::MemCatalog;
    use condor_common::ChunkId;
    use condor_proto::decode_task_msg;

    fn session() -> QuerySession {
        let cat = MemCatalog::new();
        cat.add_table_with_rating("LSST", "Object", true, 2);
        QuerySession::analyze("SELECT chunkId FROM Object", "LSST", &cat)
    }

    #[test]
    fn test_tmp_table_name() {
        let ttn = TmpTableName::new(QueryId(42));
        assert_eq!(ttn.make(7), "r_42_7");
        assert_eq!(ttn.make(1234), "r_42_1234");
    }

    #[test]
    fn test_make_msg_carries_chunk_query_and_scan_info() {
        let qs = session();
        let factory = TaskMsgFactory::new(QueryId(42));
        let spec = ChunkSpec::with_subchunks(ChunkId(7), vec![1, 2]);
        let msg = factory.make_msg(&qs, &spec, 3, "r_42_7");
        assert_eq!(msg.session, 42);
        assert_eq!(msg.job_id, 3);
        assert_eq!(msg.db, "LSST");
        assert_eq!(msg.chunk_id, 7);
        assert_eq!(msg.fragments.len(), 1);
        assert_eq!(msg.fragments[0].query, "SELECT chunkId FROM LSST.Object_7");
        assert_eq!(msg.fragments[0].result_table, "r_42_7");
        assert_eq!(msg.fragments[0].subchunks, vec![1, 2]);
        assert_eq!(msg.scan_tables, vec!["Object".to_string()]);
        assert_eq!(msg.scan_rating, 2);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let qs = session();
        let factory = TaskMsgFactory::new(QueryId(9));
        let spec = ChunkSpec::new(ChunkId(1));
        let bytes = factory.serialize_msg(&qs, &spec, 0, "r_9_1");
        let decoded = decode_task_msg(&bytes).unwrap();
        assert_eq!(decoded, factory.make_msg(&qs, &spec, 0, "r_9_1"));
    }
}
