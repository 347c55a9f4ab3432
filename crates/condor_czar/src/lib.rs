pub mod analysis;
pub mod executive;
pub mod factory;
pub mod merge;
pub mod messages;
pub mod qmeta;
pub mod query_class;
pub mod recv;
pub mod registry;
pub mod task_msg;
pub mod user_query;

pub use analysis::QuerySession;
pub use executive::{Executive, JobDescription, JobStatus, WorkerDispatcher};
pub use factory::UserQueryFactory;
pub use merge::{InfileMerger, MemResultDb, MergerConfig, ResultDbConn};
pub use messages::{MessageStore, Severity};
pub use qmeta::{
    Catalog, MemCatalog, MemQueryMetadata, MemSecondaryIndex, QueryMetadata, QueryStatus,
    SecondaryIndex,
};
pub use query_class::{classify, QueryClass};
pub use recv::{Flush, MergingHandler, MsgState, WorkerResponse};
pub use registry::SessionRegistry;
pub use task_msg::{TaskMsgFactory, TmpTableName};
pub use user_query::{
    UserQuery, UserQueryDrop, UserQueryFlushChunksCache, UserQueryInvalid, UserQuerySelect,
};
