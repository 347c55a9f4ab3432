pub mod config;
pub mod error;
pub mod types;

pub use error::{CondorError, CondorResult, ErrorContext, ErrorKind};
pub use types::*;
