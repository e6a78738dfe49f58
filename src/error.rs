//! Error Types
//!
//! One enum per failure class. Transport and protocol errors end a single
//! connection, command errors become error replies, reactor and store errors
//! abort startup.

use std::io;

use thiserror::Error;

/// Socket level failures (bind, listen, accept, read, write)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("connection is closing")]
    Closed,

    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

/// Malformed RESP input. The stream can no longer be trusted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected byte {found:#04x}, expected {expected}")]
    UnexpectedByte { found: u8, expected: &'static str },

    #[error("invalid length digit {0:#04x}")]
    InvalidLength(u8),

    #[error("length {0} exceeds limit")]
    LengthLimit(i64),
}

/// Failures surfaced to the client as a `-ERR ...` reply
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Protocol error: expected array of bulk strings")]
    NotBulkArray,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("Can't execute '{0}': only (UN)SUBSCRIBE / PUBLISH / COMMAND are allowed in this context")]
    SubscriberMode(String),

    #[error("failed to get key")]
    StoreRead,

    #[error("failed to set key")]
    StoreWrite,
}

impl CommandError {
    /// Error text with the generic `ERR` prefix clients expect
    pub fn message(&self) -> String {
        format!("ERR {}", self)
    }
}

/// Kernel notification failures. Fatal during startup.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("create poller failed: {0}")]
    Init(#[source] io::Error),

    #[error("register interest failed: {0}")]
    Register(#[source] io::Error),

    #[error("poll wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error("unknown timer {0}")]
    UnknownTimer(u64),
}

/// KV store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("open store at {path} failed: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("store read failed: {0}")]
    Read(String),

    #[error("store write failed: {0}")]
    Write(#[source] io::Error),

    #[error("corrupt log record at offset {0}")]
    Corrupt(u64),
}

/// Startup and event loop failures that stop the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ServerResult<T> = Result<T, ServerError>;
