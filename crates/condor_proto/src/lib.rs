pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    decode_response_body, decode_task_msg, encode_frame, encode_response_body,
    encode_response_stream, encode_task_msg, md5_digest, unwrap_header, wrap_header,
};
pub use error::WireError;
pub use types::*;
