//! Roost - Single-Threaded RESP Server
//!
//! A Redis-protocol server built on one readiness reactor: GET/SET against
//! a pluggable key-value store, plus SUBSCRIBE/UNSUBSCRIBE/PUBLISH rooms.

pub mod command;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod storage;

pub use error::{CommandError, ProtocolError, ServerError, ServerResult, StoreError, TransportError};
pub use metrics::Metrics;
pub use protocol::{RespCodec, RespParser, RespValue};
pub use reactor::Reactor;
pub use server::{Config, Server};
pub use storage::{AofConfig, AofStore, AofSyncMode, KvStore, MemoryStore};
