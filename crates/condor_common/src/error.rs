use thiserror::Error;

use crate::types::{ChunkId, QueryId};

/// Convenience alias for `Result<T, CondorError>`.
pub type CondorResult<T> = Result<T, CondorError>;

/// Error classification for retry/abort decisions.
///
/// - `UserError`   — bad SQL or bad handle; the query was never viable
/// - `Recoverable` — memory pressure or a missing chunk table; the worker
///                   retries or the czar re-dispatches
/// - `Cancelled`   — the user killed the query; idempotent
/// - `Fatal`       — protocol corruption, merge refusal, file-system or
///                   invariant violation; the query (or worker) is lost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Recoverable,
    Cancelled,
    Fatal,
}

/// Top-level error type shared across czar and worker.
#[derive(Error, Debug)]
pub enum CondorError {
    /// SQL rejected at analysis time. Carries the user-facing message.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// A worker could not be reached, or failed while executing a task.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Response header or body could not be decoded.
    #[error("Protocol decode error: {0}")]
    ProtocolDecode(String),

    /// Response body digest does not match the advertised MD5.
    #[error("Protocol integrity error: {0}")]
    ProtocolIntegrity(String),

    /// Memory manager could not lock the pages for a scan.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Table or chunk missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The result database refused a merge operation.
    #[error("Merge error: {0}")]
    Merge(String),

    /// The user killed the query.
    #[error("Query {0} cancelled")]
    Cancelled(QueryId),

    /// File-system or invariant violation. Always carries a stable code.
    #[error("Fatal [{code}]: {message}")]
    Fatal { code: &'static str, message: String },
}

impl CondorError {
    /// Classify this error for retry/abort decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CondorError::Analysis(_) => ErrorKind::UserError,
            CondorError::ResourceExhausted(_) => ErrorKind::Recoverable,
            CondorError::NotFound(_) => ErrorKind::Recoverable,
            CondorError::Cancelled(_) => ErrorKind::Cancelled,
            CondorError::Dispatch(_) => ErrorKind::Fatal,
            CondorError::ProtocolDecode(_) => ErrorKind::Fatal,
            CondorError::ProtocolIntegrity(_) => ErrorKind::Fatal,
            CondorError::Merge(_) => ErrorKind::Fatal,
            CondorError::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    /// True when the operation may be retried after back-off.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Recoverable)
    }

    /// True when the query itself was invalid input.
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// True when the error came from a user kill.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind(), ErrorKind::Cancelled)
    }

    /// True when the error terminates the query (or the worker).
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }

    /// Construct a `Fatal` error with a stable code.
    pub fn fatal(code: &'static str, message: impl Into<String>) -> Self {
        CondorError::Fatal {
            code,
            message: message.into(),
        }
    }

    /// Add context to an error, preserving its classification.
    pub fn with_context(self, ctx: impl Into<String>) -> Self {
        let ctx = ctx.into();
        match self {
            CondorError::Analysis(m) => CondorError::Analysis(format!("{ctx}: {m}")),
            CondorError::Dispatch(m) => CondorError::Dispatch(format!("{ctx}: {m}")),
            CondorError::ProtocolDecode(m) => CondorError::ProtocolDecode(format!("{ctx}: {m}")),
            CondorError::ProtocolIntegrity(m) => {
                CondorError::ProtocolIntegrity(format!("{ctx}: {m}"))
            }
            CondorError::ResourceExhausted(m) => {
                CondorError::ResourceExhausted(format!("{ctx}: {m}"))
            }
            CondorError::NotFound(m) => CondorError::NotFound(format!("{ctx}: {m}")),
            CondorError::Merge(m) => CondorError::Merge(format!("{ctx}: {m}")),
            CondorError::Cancelled(id) => CondorError::Cancelled(id),
            CondorError::Fatal { code, message } => CondorError::Fatal {
                code,
                message: format!("{ctx}: {message}"),
            },
        }
    }

    /// Emit a structured log entry for `Fatal` errors.
    /// Must be called before a fatal error propagates out of a worker.
    pub fn log_if_fatal(&self, query_id: QueryId, chunk_id: ChunkId) {
        if let CondorError::Fatal { code, message } = self {
            tracing::error!(
                code = code,
                query_id = %query_id,
                chunk_id = %chunk_id,
                "FATAL [{}]: {}",
                code,
                message
            );
        }
    }
}

/// Add context to a Result, preserving error classification.
/// Usage: `result.ctx("stage=merge, chunk=7")?`
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> Result<T, CondorError>;
    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, CondorError>;
}

impl<T, E: Into<CondorError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> Result<T, CondorError> {
        self.map_err(|e| e.into().with_context(context))
    }
    fn ctx_with(self, f: impl FnOnce() -> String) -> Result<T, CondorError> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_is_user_error() {
        let e = CondorError::Analysis("duplicate alias".into());
        assert_eq!(e.kind(), ErrorKind::UserError);
        assert!(e.is_user_error());
        assert!(!e.is_recoverable());
        assert!(!e.is_fatal());
    }

    #[test]
    fn test_resource_exhausted_is_recoverable() {
        let e = CondorError::ResourceExhausted("memman over budget".into());
        assert_eq!(e.kind(), ErrorKind::Recoverable);
        assert!(e.is_recoverable());
    }

    #[test]
    fn test_not_found_is_recoverable() {
        let e = CondorError::NotFound("table LSST.Object_77".into());
        assert_eq!(e.kind(), ErrorKind::Recoverable);
    }

    #[test]
    fn test_cancelled_classification() {
        let e = CondorError::Cancelled(QueryId(9));
        assert_eq!(e.kind(), ErrorKind::Cancelled);
        assert!(e.is_cancelled());
    }

    #[test]
    fn test_protocol_errors_are_fatal() {
        assert!(CondorError::ProtocolDecode("bad header".into()).is_fatal());
        assert!(CondorError::ProtocolIntegrity("md5 mismatch".into()).is_fatal());
        assert!(CondorError::Merge("insert refused".into()).is_fatal());
    }

    #[test]
    fn test_fatal_constructor() {
        let e = CondorError::fatal("E-SCAN-001", "lock table io error");
        match &e {
            CondorError::Fatal { code, message } => {
                assert_eq!(*code, "E-SCAN-001");
                assert_eq!(message, "lock table io error");
            }
            _ => panic!("expected Fatal"),
        }
        assert!(e.is_fatal());
    }

    #[test]
    fn test_with_context_preserves_classification() {
        let e = CondorError::ResourceExhausted("over budget".into());
        let e2 = e.with_context("chunk=7");
        assert_eq!(e2.kind(), ErrorKind::Recoverable);
        assert!(e2.to_string().contains("chunk=7"));
        assert!(e2.to_string().contains("over budget"));
    }

    #[test]
    fn test_with_context_on_cancelled_is_noop() {
        let e = CondorError::Cancelled(QueryId(3)).with_context("ignored");
        assert!(matches!(e, CondorError::Cancelled(QueryId(3))));
    }

    #[test]
    fn test_error_context_trait() {
        let r: Result<(), CondorError> = Err(CondorError::NotFound("t".into()));
        let err = r.ctx("stage=prepare").unwrap_err();
        assert!(err.to_string().contains("stage=prepare"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_error_context_ok_passthrough() {
        let r: Result<i32, CondorError> = Ok(5);
        assert_eq!(r.ctx("unused").unwrap(), 5);
    }
}
