//! RESP Protocol
//!
//! Value tree, incremental parser and a tokio codec for clients.

mod codec;
mod parser;
mod value;

pub use codec::RespCodec;
pub use parser::{ParseStatus, RespParser, MAX_ARRAY_LEN, MAX_BULK_LEN, MAX_LINE_LEN};
pub use value::{encode_bulk, encode_header, RespValue, NIL, OK};
