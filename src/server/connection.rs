//! Client Connection
//!
//! Feeds socket input through the RESP parser, resolves each completed
//! request against the command table and writes replies back through the
//! connection's `IoHandler`.

use std::sync::LazyLock;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use hashbrown::HashMap;
use mio::Token;
use tracing::{debug, warn};

use super::io::{IoHandler, Lifecycle, ReadOutcome};
use super::rooms::RoomRegistry;
use crate::command::{CommandEntry, CommandTable};
use crate::error::{CommandError, TransportError};
use crate::metrics::Metrics;
use crate::protocol::{encode_bulk, ParseStatus, RespParser, RespValue, NIL, OK};
use crate::reactor::{Reactor, Ready};
use crate::storage::KvStore;

/// Bytes pulled from the socket per read call
const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Upper bound on rooms named by one (UN)SUBSCRIBE
const MAX_ROOMS_PER_CALL: usize = 4096;

/// Command implementation. Arguments exclude the command name and have
/// already passed the arity check.
pub type CommandHandler =
    fn(&mut RedisConnection, &mut Session<'_>, &[Bytes]) -> Result<(), CommandError>;

/// Server state a command may touch while its connection is dispatched
pub struct Session<'a> {
    pub reactor: &'a mut Reactor,
    pub store: &'a dyn KvStore,
    pub rooms: &'a mut RoomRegistry,
    /// Every other live connection; the dispatched one is not in here
    pub peers: &'a mut HashMap<Token, RedisConnection>,
    pub metrics: &'a Metrics,
    /// Peers closed as a side effect, to be released by the server
    pub closed: Vec<Token>,
}

/// One client connection
#[derive(Debug)]
pub struct RedisConnection {
    io: IoHandler,
    parser: RespParser,
    rooms: Vec<Bytes>,
    subscriber_mode: bool,
}

impl RedisConnection {
    pub fn new(io: IoHandler) -> Self {
        Self {
            io,
            parser: RespParser::new(),
            rooms: Vec::new(),
            subscriber_mode: false,
        }
    }

    pub fn token(&self) -> Token {
        self.io.token()
    }

    pub fn is_closed(&self) -> bool {
        self.io.is_closed()
    }

    /// Rooms this connection is subscribed to, in subscription order
    pub fn rooms(&self) -> &[Bytes] {
        &self.rooms
    }

    pub fn subscriber_mode(&self) -> bool {
        self.subscriber_mode
    }

    /// Handle one reactor event
    pub fn handle(&mut self, event: Ready, session: &mut Session<'_>) {
        if event == Ready::Readable {
            self.on_readable(session);
            return;
        }
        if let Err(error) = self.io.handle(session.reactor, event) {
            debug!(token = self.token().0, error = %error, "transport error, closing");
            self.io.close(session.reactor);
        }
    }

    /// Flush what is pending, then close
    pub fn begin_drain(&mut self, reactor: &mut Reactor) {
        if let Err(error) = self.io.begin_drain(reactor) {
            warn!(token = self.token().0, error = %error, "drain failed, closing");
            self.io.close(reactor);
        }
    }

    pub fn close(&mut self, reactor: &mut Reactor) {
        self.io.close(reactor);
    }

    /// Write raw bytes. Returns false if nothing was accepted; a hard
    /// transport error closes the connection.
    pub fn send(&mut self, reactor: &mut Reactor, data: &[u8]) -> bool {
        match self.io.write(reactor, data) {
            Ok(_) => true,
            Err(TransportError::Closed) => false,
            Err(error) => {
                debug!(token = self.token().0, error = %error, "write failed, closing");
                self.io.close(reactor);
                false
            }
        }
    }

    fn reply(&mut self, reactor: &mut Reactor, value: &RespValue) -> bool {
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        self.send(reactor, &buf)
    }

    fn reply_error(&mut self, session: &mut Session<'_>, error: CommandError) {
        session.metrics.record_error();
        debug!(token = self.token().0, error = %error, "command rejected");
        self.reply(session.reactor, &RespValue::error(error.message()));
    }

    fn on_readable(&mut self, session: &mut Session<'_>) {
        let mut chunk = [0u8; READ_CHUNK_BYTES];

        while self.io.can_read() {
            match self.io.read(&mut chunk) {
                Ok(ReadOutcome::Data(n)) => self.ingest(&chunk[..n], session),
                Ok(ReadOutcome::WouldBlock) => return,
                Ok(ReadOutcome::Eof) => {
                    debug!(token = self.token().0, "peer closed");
                    self.begin_drain(session.reactor);
                    return;
                }
                Err(error) => {
                    debug!(token = self.token().0, error = %error, "read failed, closing");
                    self.io.close(session.reactor);
                    return;
                }
            }
        }
    }

    /// Run every request completed by `data`, in order
    fn ingest(&mut self, mut data: &[u8], session: &mut Session<'_>) {
        while !data.is_empty() && self.io.lifecycle() == Lifecycle::Open {
            let consumed = self.parser.parse(data);
            data = &data[consumed..];

            match self.parser.status() {
                ParseStatus::Incomplete => {}
                ParseStatus::Done => {
                    if let Some(request) = self.parser.grab() {
                        self.execute(request, session);
                    }
                }
                ParseStatus::Invalid => {
                    self.protocol_error(session);
                    return;
                }
            }
        }
    }

    /// The stream can no longer be trusted: no reply, no further input.
    /// Replies to earlier requests still drain before the close.
    fn protocol_error(&mut self, session: &mut Session<'_>) {
        if let Some(error) = self.parser.error() {
            debug!(token = self.token().0, error = %error, "protocol error, closing");
        }
        session.metrics.record_error();
        self.parser.reset();
        self.begin_drain(session.reactor);
    }

    fn execute(&mut self, request: RespValue, session: &mut Session<'_>) {
        let start = Instant::now();

        let args = match into_args(request) {
            Ok(args) => args,
            Err(error) => {
                self.reply_error(session, error);
                return;
            }
        };
        let Some((name, args)) = args.split_first() else {
            self.send(session.reactor, OK);
            return;
        };

        let name = name.to_ascii_uppercase();
        let entry = match commands().resolve(&name, args.len(), self.subscriber_mode) {
            Ok(entry) => entry,
            Err(error) => {
                self.reply_error(session, error);
                return;
            }
        };

        if let Err(error) = (entry.handler)(self, session, args) {
            self.reply_error(session, error);
        }

        let elapsed = start.elapsed();
        session.metrics.record_operation(entry.name, elapsed);
        debug!(token = self.token().0, cmd = entry.name, latency = ?elapsed, "Command executed");
    }
}

/// A request must be an array of bulk strings
fn into_args(request: RespValue) -> Result<Vec<Bytes>, CommandError> {
    let RespValue::Array(items) = request else {
        return Err(CommandError::NotBulkArray);
    };
    items
        .into_iter()
        .map(|item| match item {
            RespValue::BulkString(arg) => Ok(arg),
            _ => Err(CommandError::NotBulkArray),
        })
        .collect()
}

fn entry(
    name: &'static str,
    min_args: usize,
    max_args: usize,
    allow_in_sub_mode: bool,
    handler: CommandHandler,
) -> CommandEntry<CommandHandler> {
    CommandEntry {
        name,
        min_args,
        max_args,
        handler,
        allow_in_sub_mode,
    }
}

static COMMANDS: LazyLock<CommandTable<CommandHandler>> = LazyLock::new(|| {
    CommandTable::new([
        entry("GET", 1, 1, false, get),
        entry("SET", 2, 4, false, set),
        entry("COMMAND", 0, 0, true, command),
        entry("SUBSCRIBE", 1, MAX_ROOMS_PER_CALL, true, subscribe),
        entry("UNSUBSCRIBE", 0, MAX_ROOMS_PER_CALL, true, unsubscribe),
        entry("PUBLISH", 2, 2, true, publish),
    ])
});

/// The process-wide command table
pub fn commands() -> &'static CommandTable<CommandHandler> {
    &COMMANDS
}

fn get(conn: &mut RedisConnection, session: &mut Session<'_>, args: &[Bytes]) -> Result<(), CommandError> {
    let value = session.store.get(&args[0]).map_err(|error| {
        warn!(error = %error, "store read failed");
        CommandError::StoreRead
    })?;

    match value {
        Some(value) => {
            let mut buf = BytesMut::new();
            encode_bulk(&mut buf, &value);
            conn.send(session.reactor, &buf);
        }
        None => {
            conn.send(session.reactor, NIL);
        }
    }
    Ok(())
}

/// Trailing options (EX, NX, ...) are accepted and ignored
fn set(conn: &mut RedisConnection, session: &mut Session<'_>, args: &[Bytes]) -> Result<(), CommandError> {
    session
        .store
        .put(args[0].clone(), args[1].clone(), false)
        .map_err(|error| {
            warn!(error = %error, "store write failed");
            CommandError::StoreWrite
        })?;
    conn.send(session.reactor, OK);
    Ok(())
}

fn command(conn: &mut RedisConnection, session: &mut Session<'_>, _args: &[Bytes]) -> Result<(), CommandError> {
    conn.send(session.reactor, OK);
    Ok(())
}

fn subscribe(conn: &mut RedisConnection, session: &mut Session<'_>, args: &[Bytes]) -> Result<(), CommandError> {
    conn.subscriber_mode = true;
    let token = conn.token();

    for room in args {
        if !conn.rooms.contains(room) {
            conn.rooms.push(room.clone());
            session.rooms.join(room.clone(), token);
        }
        let ack = RespValue::Array(vec![
            RespValue::bulk("subscribe"),
            RespValue::BulkString(room.clone()),
            RespValue::Integer(conn.rooms.len() as i64),
        ]);
        conn.reply(session.reactor, &ack);
    }
    Ok(())
}

/// No arguments means every joined room
fn unsubscribe(conn: &mut RedisConnection, session: &mut Session<'_>, args: &[Bytes]) -> Result<(), CommandError> {
    let token = conn.token();
    let targets = if args.is_empty() {
        conn.rooms.clone()
    } else {
        args.to_vec()
    };

    if targets.is_empty() {
        let ack = RespValue::Array(vec![
            RespValue::bulk("unsubscribe"),
            RespValue::Nil,
            RespValue::Integer(0),
        ]);
        conn.reply(session.reactor, &ack);
    }

    for room in targets {
        if let Some(pos) = conn.rooms.iter().position(|joined| *joined == room) {
            conn.rooms.remove(pos);
            session.rooms.leave(&room, token);
        }
        let ack = RespValue::Array(vec![
            RespValue::bulk("unsubscribe"),
            RespValue::BulkString(room),
            RespValue::Integer(conn.rooms.len() as i64),
        ]);
        conn.reply(session.reactor, &ack);
    }

    if conn.rooms.is_empty() {
        conn.subscriber_mode = false;
    }
    Ok(())
}

/// Replies with the number of subscribers the message was written to
fn publish(conn: &mut RedisConnection, session: &mut Session<'_>, args: &[Bytes]) -> Result<(), CommandError> {
    let (room, payload) = (&args[0], &args[1]);
    let message = RespValue::Array(vec![
        RespValue::bulk("message"),
        RespValue::BulkString(room.clone()),
        RespValue::BulkString(payload.clone()),
    ])
    .to_bytes();

    let token = conn.token();
    let targets = session.rooms.subscribers(room).to_vec();
    let mut delivered = 0u64;

    for target in targets {
        let sent = if target == token {
            conn.send(session.reactor, &message)
        } else if let Some(peer) = session.peers.get_mut(&target) {
            let sent = peer.send(session.reactor, &message);
            if peer.is_closed() {
                session.closed.push(target);
            }
            sent
        } else {
            false
        };
        if sent {
            delivered += 1;
        }
    }

    session.metrics.record_delivered(delivered);
    conn.reply(session.reactor, &RespValue::Integer(delivered as i64));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_args() {
        let request = RespValue::command(["SET", "k", "v"]);
        assert_eq!(
            into_args(request).unwrap(),
            vec![Bytes::from("SET"), Bytes::from("k"), Bytes::from("v")]
        );

        let nested = RespValue::Array(vec![RespValue::bulk("GET"), RespValue::Integer(1)]);
        assert_eq!(into_args(nested), Err(CommandError::NotBulkArray));
        assert_eq!(
            into_args(RespValue::simple("PING")),
            Err(CommandError::NotBulkArray)
        );
        assert!(into_args(RespValue::Array(Vec::new())).unwrap().is_empty());
    }

    #[test]
    fn test_command_table() {
        let table = commands();
        assert_eq!(table.len(), 6);

        let set = table.get(b"SET").unwrap();
        assert_eq!((set.min_args, set.max_args), (2, 4));
        assert!(!set.allow_in_sub_mode);

        assert!(table.resolve(b"PUBLISH", 2, true).is_ok());
        assert!(table.resolve(b"UNSUBSCRIBE", 0, true).is_ok());
        assert_eq!(
            table.resolve(b"GET", 1, true).unwrap_err(),
            CommandError::SubscriberMode("GET".into())
        );
        assert_eq!(
            table.resolve(b"SUBSCRIBE", 0, false).unwrap_err(),
            CommandError::WrongArity("SUBSCRIBE".into())
        );
        assert!(table.get(b"get").is_none());
    }
}
