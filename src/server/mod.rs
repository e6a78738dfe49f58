//! Server Module
//!
//! Single-threaded RESP server. One reactor drives the listener, every
//! client connection and the housekeeping timers; the loop runs until the
//! shared running flag is cleared, then drains open connections.

mod config;
mod connection;
mod io;
mod rooms;

pub use config::Config;
pub use connection::{commands, CommandHandler, RedisConnection, Session};
pub use io::{IoHandler, Lifecycle, ReadOutcome, WRITE_HIGH_WATERMARK, WRITE_LOW_WATERMARK};
pub use rooms::RoomRegistry;

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::error::{ServerResult, TransportError};
use crate::metrics::Metrics;
use crate::reactor::{Direction, Reactor, Ready, TimerId};
use crate::storage::KvStore;

const LISTENER: Token = Token(0);
const HOUSEKEEPING: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

/// What a reactor token addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Listener,
    Housekeeping,
    Connection(Token),
}

impl Endpoint {
    fn of(token: Token) -> Self {
        match token {
            LISTENER => Endpoint::Listener,
            HOUSEKEEPING => Endpoint::Housekeeping,
            token => Endpoint::Connection(token),
        }
    }
}

/// Roost server
pub struct Server {
    config: Config,
    reactor: Reactor,
    listener: TcpListener,
    local_addr: SocketAddr,
    state: ServerState,
}

/// Everything the dispatch path mutates, kept apart from the reactor so
/// both can be borrowed during a poll
struct ServerState {
    connections: HashMap<Token, RedisConnection>,
    rooms: RoomRegistry,
    store: Box<dyn KvStore + Send>,
    metrics: Arc<Metrics>,
    next_token: usize,
    stats_timer: Option<TimerId>,
    flush_timer: Option<TimerId>,
    drain_timer: Option<TimerId>,
    drain_expired: bool,
}

impl Server {
    /// Bind the listener and arm the housekeeping timers
    ///
    /// # Errors
    ///
    /// `TransportError::Bind` if the address cannot be resolved or bound,
    /// a reactor error if the poller cannot be created.
    pub fn bind(config: Config, store: Box<dyn KvStore + Send>) -> ServerResult<Self> {
        let addr = resolve(&config.bind, config.port)?;
        let std_listener = listen(addr, config.backlog)?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        let mut reactor = Reactor::new(config.max_events, config.poll_interval)?;
        let mut listener = TcpListener::from_std(std_listener);
        reactor.toggle(&mut listener, LISTENER, Direction::Readable, true)?;

        let stats_timer = config
            .stats_interval
            .map(|interval| reactor.set_timeout(interval, HOUSEKEEPING, true));
        let flush_timer = config
            .flush_interval
            .map(|interval| reactor.set_timeout(interval, HOUSEKEEPING, true));

        Ok(Self {
            config,
            reactor,
            listener,
            local_addr,
            state: ServerState {
                connections: HashMap::new(),
                rooms: RoomRegistry::new(),
                store,
                metrics: Arc::new(Metrics::new()),
                next_token: FIRST_CONNECTION,
                stats_timer,
                flush_timer,
                drain_timer: None,
                drain_expired: false,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get metrics reference
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.state.metrics
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.state.rooms.len()
    }

    /// Serve until `running` is cleared, then drain and stop
    pub fn run(mut self, running: &AtomicBool) -> ServerResult<()> {
        info!("Roost server listening on {}", self.local_addr);

        while running.load(Ordering::Acquire) {
            self.poll_once()?;
        }
        self.shutdown()
    }

    /// One reactor wait plus dispatch. Returns the number of events handled.
    pub fn poll_once(&mut self) -> ServerResult<usize> {
        let Self {
            reactor,
            listener,
            state,
            ..
        } = self;
        let count =
            reactor.poll(|reactor, token, event| state.dispatch(reactor, listener, token, event))?;
        Ok(count)
    }

    /// Stop accepting, let every connection flush its pending output, and
    /// force-close whatever is left once the drain timeout expires.
    pub fn shutdown(mut self) -> ServerResult<()> {
        info!(
            connections = self.state.connections.len(),
            "Shutting down"
        );
        self.reactor.forget(&mut self.listener, LISTENER)?;
        self.state.begin_drain(&mut self.reactor);

        if !self.state.connections.is_empty() {
            let timer = self
                .reactor
                .set_timeout(self.config.drain_timeout, HOUSEKEEPING, false);
            self.state.drain_timer = Some(timer);

            while !self.state.connections.is_empty() && !self.state.drain_expired {
                self.poll_once()?;
            }

            if let Some(timer) = self.state.drain_timer.take() {
                let _ = self.reactor.clear_timeout(timer);
            }
            if !self.state.connections.is_empty() {
                warn!(
                    remaining = self.state.connections.len(),
                    "Drain timed out, closing connections"
                );
                self.state.close_all(&mut self.reactor);
            }
        }

        if let Err(error) = self.state.store.flush() {
            warn!(error = %error, "Store flush failed");
        }
        info!("Server stopped | {}", self.state.metrics.summary());
        Ok(())
    }
}

impl ServerState {
    fn dispatch(&mut self, reactor: &mut Reactor, listener: &mut TcpListener, token: Token, event: Ready) {
        match Endpoint::of(token) {
            Endpoint::Listener => self.accept(reactor, listener),
            Endpoint::Housekeeping => {
                if let Ready::Timeout(id) = event {
                    self.on_timer(id);
                }
            }
            Endpoint::Connection(token) => self.dispatch_connection(reactor, token, event),
        }
    }

    fn accept(&mut self, reactor: &mut Reactor, listener: &mut TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => self.register(reactor, stream, peer),
                Err(error) if error.kind() == ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    let error = TransportError::Accept(error);
                    error!("Accept error: {}", error);
                    return;
                }
            }
        }
    }

    fn register(&mut self, reactor: &mut Reactor, stream: TcpStream, peer: SocketAddr) {
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%peer, error = %error, "set TCP_NODELAY failed");
        }

        let token = Token(self.next_token);
        self.next_token += 1;

        match IoHandler::new(reactor, stream, token) {
            Ok(io) => {
                self.connections.insert(token, RedisConnection::new(io));
                self.metrics.record_accept();
                info!(token = token.0, "New connection from {}", peer);
            }
            Err(error) => warn!(%peer, error = %error, "Register connection failed"),
        }
    }

    /// The connection leaves the map while it runs, so a handler that
    /// closes it mid-batch leaves nothing behind for later events.
    fn dispatch_connection(&mut self, reactor: &mut Reactor, token: Token, event: Ready) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };

        let closed = {
            let mut session = Session {
                reactor: &mut *reactor,
                store: self.store.as_ref(),
                rooms: &mut self.rooms,
                peers: &mut self.connections,
                metrics: self.metrics.as_ref(),
                closed: Vec::new(),
            };
            conn.handle(event, &mut session);
            session.closed
        };

        if conn.is_closed() {
            self.release(reactor, conn);
        } else {
            self.connections.insert(token, conn);
        }

        for token in closed {
            if let Some(peer) = self.connections.remove(&token) {
                self.release(reactor, peer);
            }
        }
    }

    fn release(&mut self, reactor: &mut Reactor, mut conn: RedisConnection) {
        conn.close(reactor);
        let token = conn.token();
        for room in conn.rooms() {
            self.rooms.leave(room, token);
        }
        self.metrics.record_close();
        info!(token = token.0, "Connection closed");
    }

    fn on_timer(&mut self, id: TimerId) {
        if self.stats_timer == Some(id) {
            info!(
                connections = self.connections.len(),
                rooms = self.rooms.len(),
                "{}",
                self.metrics.summary()
            );
        } else if self.flush_timer == Some(id) {
            if let Err(error) = self.store.flush() {
                warn!(error = %error, "Periodic store flush failed");
            }
        } else if self.drain_timer == Some(id) {
            self.drain_timer = None;
            self.drain_expired = true;
        }
    }

    fn begin_drain(&mut self, reactor: &mut Reactor) {
        for conn in self.connections.values_mut() {
            conn.begin_drain(reactor);
        }

        let closed: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_closed())
            .map(|(&token, _)| token)
            .collect();
        for token in closed {
            if let Some(conn) = self.connections.remove(&token) {
                self.release(reactor, conn);
            }
        }
    }

    fn close_all(&mut self, reactor: &mut Reactor) {
        let connections = std::mem::take(&mut self.connections);
        for (_, conn) in connections {
            self.release(reactor, conn);
        }
    }
}

fn resolve(bind: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let addr = format!("{}:{}", bind, port);
    let mut addrs = (bind, port).to_socket_addrs().map_err(|source| TransportError::Bind {
        addr: addr.clone(),
        source,
    })?;
    addrs.next().ok_or_else(|| TransportError::Bind {
        addr,
        source: ErrorKind::AddrNotAvailable.into(),
    })
}

/// Non-blocking listening socket with address reuse and a custom backlog
fn listen(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener, TransportError> {
    let bind_error = |source| TransportError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    socket.listen(backlog).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdStream;
    use std::time::{Duration, Instant};

    fn server() -> Server {
        let config = Config::default()
            .with_port(0)
            .with_poll_interval(Duration::from_millis(10))
            .with_stats_interval(None)
            .with_drain_timeout(Duration::from_millis(500));
        Server::bind(config, Box::new(MemoryStore::new())).unwrap()
    }

    fn poll_until<F: FnMut(&Server) -> bool>(server: &mut Server, mut done: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(server) {
            assert!(Instant::now() < deadline, "timed out");
            server.poll_once().unwrap();
        }
    }

    fn connect(server: &mut Server) -> StdStream {
        let expected = server.connection_count() + 1;
        let client = StdStream::connect(server.local_addr()).unwrap();
        client.set_nonblocking(true).unwrap();
        poll_until(server, |server| server.connection_count() == expected);
        client
    }

    /// Read until `len` bytes arrived or the peer closed
    fn receive(server: &mut Server, client: &mut StdStream, len: usize) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut received = Vec::new();
        let mut chunk = [0u8; 1024];
        while received.len() < len {
            assert!(Instant::now() < deadline, "timed out waiting for reply");
            server.poll_once().unwrap();
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(error) if error.kind() == ErrorKind::WouldBlock => {}
                Err(error) => panic!("read failed: {error}"),
            }
        }
        received
    }

    fn exchange(server: &mut Server, client: &mut StdStream, request: &[u8], expected: &[u8]) {
        client.write_all(request).unwrap();
        let received = receive(server, client, expected.len());
        assert_eq!(
            String::from_utf8_lossy(&received),
            String::from_utf8_lossy(expected)
        );
    }

    fn wait_for_eof(server: &mut Server, client: &mut StdStream) -> Vec<u8> {
        receive(server, client, usize::MAX)
    }

    #[test]
    fn test_endpoint_routing() {
        assert_eq!(Endpoint::of(Token(0)), Endpoint::Listener);
        assert_eq!(Endpoint::of(Token(1)), Endpoint::Housekeeping);
        assert_eq!(Endpoint::of(Token(2)), Endpoint::Connection(Token(2)));
    }

    #[test]
    fn test_set_get() {
        let mut server = server();
        let mut client = connect(&mut server);

        exchange(&mut server, &mut client, b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n", b"+OK\r\n");
        exchange(&mut server, &mut client, b"*2\r\n$3\r\nget\r\n$1\r\nk\r\n", b"$1\r\nv\r\n");
        exchange(&mut server, &mut client, b"*2\r\n$3\r\nGET\r\n$4\r\nnope\r\n", b"$-1\r\n");
        assert_eq!(server.metrics().total_ops(), 3);
    }

    #[test]
    fn test_pipelined_requests() {
        let mut server = server();
        let mut client = connect(&mut server);

        exchange(
            &mut server,
            &mut client,
            b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n1\r\n*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\n2\r\n*2\r\n$3\r\nGET\r\n$1\r\na\r\n",
            b"+OK\r\n+OK\r\n$1\r\n2\r\n",
        );
    }

    #[test]
    fn test_command_errors() {
        let mut server = server();
        let mut client = connect(&mut server);

        exchange(&mut server, &mut client, b"*1\r\n$7\r\nCOMMAND\r\n", b"+OK\r\n");
        exchange(&mut server, &mut client, b"*0\r\n", b"+OK\r\n");
        exchange(
            &mut server,
            &mut client,
            b"*1\r\n$3\r\nGET\r\n",
            b"-ERR wrong number of arguments for 'GET' command\r\n",
        );
        exchange(
            &mut server,
            &mut client,
            b"*1\r\n$3\r\nFOO\r\n",
            b"-ERR unknown command 'FOO'\r\n",
        );
        exchange(
            &mut server,
            &mut client,
            b"PING\r\n",
            b"-ERR unknown command 'PING'\r\n",
        );
        exchange(
            &mut server,
            &mut client,
            b"*2\r\n$3\r\nGET\r\n:1\r\n",
            b"-ERR Protocol error: expected array of bulk strings\r\n",
        );
        exchange(
            &mut server,
            &mut client,
            b"*1\r\n$10\r\nA\r\n:666\r\nB\r\n",
            b"-ERR unknown command 'A  :666  B'\r\n",
        );
        exchange(&mut server, &mut client, b"*1\r\n$7\r\nCOMMAND\r\n", b"+OK\r\n");
        assert_eq!(server.metrics().command_errors(), 5);
    }

    #[test]
    fn test_pubsub() {
        let mut server = server();
        let mut alice = connect(&mut server);
        let mut bob = connect(&mut server);
        let mut carol = connect(&mut server);

        let subscribe = b"*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nroom\r\n";
        let ack = b"*3\r\n$9\r\nsubscribe\r\n$4\r\nroom\r\n:1\r\n";
        exchange(&mut server, &mut alice, subscribe, ack);
        exchange(&mut server, &mut bob, subscribe, ack);
        assert_eq!(server.room_count(), 1);

        let message = b"*3\r\n$7\r\nmessage\r\n$4\r\nroom\r\n$2\r\nhi\r\n";
        exchange(&mut server, &mut carol, b"*3\r\n$7\r\nPUBLISH\r\n$4\r\nroom\r\n$2\r\nhi\r\n", b":2\r\n");
        assert_eq!(receive(&mut server, &mut alice, message.len()), message);
        assert_eq!(receive(&mut server, &mut bob, message.len()), message);

        exchange(
            &mut server,
            &mut alice,
            b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n",
            b"-ERR Can't execute 'GET': only (UN)SUBSCRIBE / PUBLISH / COMMAND are allowed in this context\r\n",
        );
        exchange(
            &mut server,
            &mut alice,
            b"*1\r\n$11\r\nUNSUBSCRIBE\r\n",
            b"*3\r\n$11\r\nunsubscribe\r\n$4\r\nroom\r\n:0\r\n",
        );
        exchange(&mut server, &mut alice, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n", b"$-1\r\n");

        exchange(&mut server, &mut carol, b"*3\r\n$7\r\nPUBLISH\r\n$4\r\nroom\r\n$2\r\nhi\r\n", b":1\r\n");
        exchange(&mut server, &mut carol, b"*3\r\n$7\r\nPUBLISH\r\n$5\r\nempty\r\n$1\r\nx\r\n", b":0\r\n");
        assert_eq!(server.metrics().messages_delivered(), 3);
    }

    #[test]
    fn test_fan_out_order_survives_leaves() {
        let mut server = server();
        let mut clients: Vec<StdStream> = (0..4).map(|_| connect(&mut server)).collect();
        let mut publisher = connect(&mut server);

        let subscribe = b"*2\r\n$9\r\nSUBSCRIBE\r\n$1\r\nr\r\n";
        let ack = b"*3\r\n$9\r\nsubscribe\r\n$1\r\nr\r\n:1\r\n";
        for client in clients.iter_mut() {
            exchange(&mut server, client, subscribe, ack);
        }
        assert_eq!(
            server.state.rooms.subscribers(b"r"),
            &[Token(2), Token(3), Token(4), Token(5)]
        );

        // First subscriber unsubscribes, a middle one disconnects
        exchange(
            &mut server,
            &mut clients[0],
            b"*2\r\n$11\r\nUNSUBSCRIBE\r\n$1\r\nr\r\n",
            b"*3\r\n$11\r\nunsubscribe\r\n$1\r\nr\r\n:0\r\n",
        );
        drop(clients.remove(2));
        poll_until(&mut server, |server| server.connection_count() == 4);
        assert_eq!(server.state.rooms.subscribers(b"r"), &[Token(3), Token(5)]);

        let message = b"*3\r\n$7\r\nmessage\r\n$1\r\nr\r\n$1\r\nx\r\n";
        exchange(&mut server, &mut publisher, b"*3\r\n$7\r\nPUBLISH\r\n$1\r\nr\r\n$1\r\nx\r\n", b":2\r\n");
        assert_eq!(receive(&mut server, &mut clients[1], message.len()), message);
        assert_eq!(receive(&mut server, &mut clients[2], message.len()), message);
    }

    #[test]
    fn test_unsubscribe_without_rooms() {
        let mut server = server();
        let mut client = connect(&mut server);

        exchange(
            &mut server,
            &mut client,
            b"*1\r\n$11\r\nUNSUBSCRIBE\r\n",
            b"*3\r\n$11\r\nunsubscribe\r\n$-1\r\n:0\r\n",
        );
    }

    #[test]
    fn test_closed_subscriber_leaves_rooms() {
        let mut server = server();
        let mut subscriber = connect(&mut server);
        let mut publisher = connect(&mut server);

        exchange(
            &mut server,
            &mut subscriber,
            b"*3\r\n$9\r\nSUBSCRIBE\r\n$1\r\na\r\n$1\r\nb\r\n",
            b"*3\r\n$9\r\nsubscribe\r\n$1\r\na\r\n:1\r\n*3\r\n$9\r\nsubscribe\r\n$1\r\nb\r\n:2\r\n",
        );
        assert_eq!(server.room_count(), 2);

        drop(subscriber);
        poll_until(&mut server, |server| server.connection_count() == 1);
        assert_eq!(server.room_count(), 0);
        exchange(&mut server, &mut publisher, b"*3\r\n$7\r\nPUBLISH\r\n$1\r\na\r\n$1\r\nx\r\n", b":0\r\n");
    }

    #[test]
    fn test_protocol_error_closes_connection() {
        let mut server = server();
        let mut client = connect(&mut server);

        client
            .write_all(b"*1\r\n$0\r\n\r\n*1\r\n$x\r\n")
            .unwrap();
        let received = wait_for_eof(&mut server, &mut client);
        assert_eq!(received, b"-ERR unknown command ''\r\n");
        poll_until(&mut server, |server| server.connection_count() == 0);
        assert_eq!(server.metrics().connections_closed(), 1);
    }

    #[test]
    fn test_shutdown_closes_connections() {
        let mut server = server();
        let mut client = connect(&mut server);
        let addr = server.local_addr();

        server.shutdown().unwrap();

        client.set_nonblocking(false).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert!(StdStream::connect(addr).is_err());
    }
}
