//! Connection I/O
//!
//! Non-blocking socket wrapper with an output buffer. Writes go straight
//! to the socket while it accepts them; the remainder is buffered and
//! flushed on the next `Writable` event. A large backlog pauses reads
//! until the peer catches up.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::Token;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::reactor::{Direction, Reactor, Ready};

/// Pending output at which reads are paused
pub const WRITE_HIGH_WATERMARK: usize = 256 * 1024;

/// Pending output at which paused reads resume
pub const WRITE_LOW_WATERMARK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Open,
    /// No more reads or application writes; closes once output is flushed
    Draining,
    Closed,
}

/// Result of a single non-blocking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

/// Socket plus output buffer for one connection
#[derive(Debug)]
pub struct IoHandler {
    stream: TcpStream,
    token: Token,
    output: BytesMut,
    /// Last known write budget; cleared on `WouldBlock`, set by `Writable`
    writable: bool,
    read_paused: bool,
    lifecycle: Lifecycle,
}

impl IoHandler {
    /// Register both directions. The first `Writable` event only tells us
    /// the socket has room; interest is dropped again once it is seen.
    pub fn new(reactor: &mut Reactor, mut stream: TcpStream, token: Token) -> Result<Self, TransportError> {
        reactor.toggle(&mut stream, token, Direction::Readable, true)?;
        reactor.toggle(&mut stream, token, Direction::Writable, true)?;
        Ok(Self {
            stream,
            token,
            output: BytesMut::new(),
            writable: false,
            read_paused: false,
            lifecycle: Lifecycle::Open,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle == Lifecycle::Closed
    }

    /// Bytes buffered and not yet accepted by the socket
    pub fn pending(&self) -> usize {
        self.output.len()
    }

    /// Whether the owner should keep pulling input
    pub fn can_read(&self) -> bool {
        self.lifecycle == Lifecycle::Open && !self.read_paused
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Read whatever the socket has, up to `buf.len()` bytes
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, TransportError> {
        loop {
            match self.stream.read(buf) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock)
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(TransportError::Read(error)),
            }
        }
    }

    /// Send `data`, buffering whatever the socket does not take now.
    ///
    /// Returns `data.len()`: accepted bytes are never rejected later.
    ///
    /// # Errors
    ///
    /// `TransportError::Closed` once the connection is draining or closed,
    /// `TransportError::Write` on a hard socket error.
    pub fn write(&mut self, reactor: &mut Reactor, data: &[u8]) -> Result<usize, TransportError> {
        if self.lifecycle != Lifecycle::Open {
            return Err(TransportError::Closed);
        }

        let mut written = 0;
        if self.writable && self.output.is_empty() {
            written = write_to(&mut self.stream, data, &mut self.writable)?;
        }

        if written < data.len() {
            self.output.extend_from_slice(&data[written..]);
            reactor.toggle(&mut self.stream, self.token, Direction::Writable, true)?;
            self.update_backpressure(reactor)?;
        }
        Ok(data.len())
    }

    /// React to a transport event. `Readable` is left to the owner.
    pub fn handle(&mut self, reactor: &mut Reactor, event: Ready) -> Result<(), TransportError> {
        match event {
            Ready::Writable => {
                self.writable = true;
                self.flush(reactor)
            }
            Ready::ReadEof | Ready::WriteEof => self.begin_drain(reactor),
            Ready::Readable | Ready::Timeout(_) => Ok(()),
        }
    }

    /// Stop reading and accepting writes; close once the output is flushed
    pub fn begin_drain(&mut self, reactor: &mut Reactor) -> Result<(), TransportError> {
        if self.lifecycle != Lifecycle::Open {
            return Ok(());
        }
        self.lifecycle = Lifecycle::Draining;
        reactor.toggle(&mut self.stream, self.token, Direction::Readable, false)?;

        if self.output.is_empty() {
            self.close(reactor);
        } else {
            debug!(token = self.token.0, pending = self.output.len(), "draining");
        }
        Ok(())
    }

    /// Release kernel interest and shut the socket down. Idempotent.
    pub fn close(&mut self, reactor: &mut Reactor) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        self.lifecycle = Lifecycle::Closed;
        self.output.clear();

        if let Err(error) = reactor.forget(&mut self.stream, self.token) {
            warn!(token = self.token.0, error = %error, "deregister failed");
        }
        if let Err(error) = self.stream.shutdown(Shutdown::Both) {
            // Expected once the peer has already reset the connection
            if error.kind() != ErrorKind::NotConnected {
                debug!(token = self.token.0, error = %error, "shutdown failed");
            }
        }
    }

    fn flush(&mut self, reactor: &mut Reactor) -> Result<(), TransportError> {
        if !self.output.is_empty() {
            let written = write_to(&mut self.stream, &self.output, &mut self.writable)?;
            self.output.advance(written);
        }

        if self.output.is_empty() {
            reactor.toggle(&mut self.stream, self.token, Direction::Writable, false)?;
            if self.lifecycle == Lifecycle::Draining {
                self.close(reactor);
                return Ok(());
            }
        }
        self.update_backpressure(reactor)
    }

    fn update_backpressure(&mut self, reactor: &mut Reactor) -> Result<(), TransportError> {
        if self.lifecycle != Lifecycle::Open {
            return Ok(());
        }

        if !self.read_paused && self.output.len() >= WRITE_HIGH_WATERMARK {
            self.read_paused = true;
            reactor.toggle(&mut self.stream, self.token, Direction::Readable, false)?;
            debug!(token = self.token.0, pending = self.output.len(), "reads paused");
        } else if self.read_paused && self.output.len() <= WRITE_LOW_WATERMARK {
            self.read_paused = false;
            reactor.toggle(&mut self.stream, self.token, Direction::Readable, true)?;
            debug!(token = self.token.0, pending = self.output.len(), "reads resumed");
        }
        Ok(())
    }
}

/// Write until done or `WouldBlock`, returning the bytes taken
fn write_to(stream: &mut TcpStream, data: &[u8], writable: &mut bool) -> Result<usize, TransportError> {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => return Err(TransportError::Write(ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(error) if error.kind() == ErrorKind::WouldBlock => {
                *writable = false;
                break;
            }
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => return Err(TransportError::Write(error)),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use std::io::Read as _;
    use std::thread;
    use std::time::{Duration, Instant};

    const CONN: Token = Token(7);

    fn pair(reactor: &mut Reactor) -> (IoHandler, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let stream = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(error) if error.kind() == ErrorKind::WouldBlock && Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(error) => panic!("accept failed: {error}"),
            }
        };
        (IoHandler::new(reactor, stream, CONN).unwrap(), client)
    }

    fn drive<F: FnMut(&IoHandler) -> bool>(reactor: &mut Reactor, io: &mut IoHandler, mut done: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(io) {
            assert!(Instant::now() < deadline, "timed out");
            reactor
                .poll(|reactor, _, event| {
                    if event == Ready::Readable {
                        let mut buf = [0u8; 64];
                        if let Ok(ReadOutcome::Eof) = io.read(&mut buf) {
                            io.begin_drain(reactor).unwrap();
                        }
                    }
                    io.handle(reactor, event).unwrap();
                })
                .unwrap();
        }
    }

    fn reactor() -> Reactor {
        Reactor::new(16, Duration::from_millis(20)).unwrap()
    }

    #[test]
    fn test_early_write_is_buffered_then_flushed() {
        let mut reactor = reactor();
        let (mut io, mut client) = pair(&mut reactor);

        assert_eq!(io.write(&mut reactor, b"hello").unwrap(), 5);
        assert_eq!(io.pending(), 5);

        drive(&mut reactor, &mut io, |io| io.pending() == 0);
        assert!(!reactor.is_registered(CONN, Direction::Writable));

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // Budget is known now, so this goes straight out
        io.write(&mut reactor, b"world").unwrap();
        assert_eq!(io.pending(), 0);
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_peer_close_closes_handler() {
        let mut reactor = reactor();
        let (mut io, client) = pair(&mut reactor);
        drop(client);

        drive(&mut reactor, &mut io, |io| io.is_closed());
        assert!(!reactor.is_registered(CONN, Direction::Readable));
        assert!(!reactor.is_registered(CONN, Direction::Writable));
    }

    #[test]
    fn test_peer_reset_closes_handler() {
        let mut reactor = reactor();
        let (mut io, client) = pair(&mut reactor);
        // Zero linger turns the close into a RST
        socket2::SockRef::from(&client)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(client);

        drive(&mut reactor, &mut io, |io| io.is_closed());
        assert!(!reactor.is_registered(CONN, Direction::Readable));
        io.close(&mut reactor);
        assert!(io.is_closed());
    }

    #[test]
    fn test_write_after_close_is_rejected() {
        let mut reactor = reactor();
        let (mut io, mut client) = pair(&mut reactor);

        io.close(&mut reactor);
        io.close(&mut reactor);
        assert!(matches!(io.write(&mut reactor, b"x"), Err(TransportError::Closed)));

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_drain_flushes_before_close() {
        let mut reactor = reactor();
        let (mut io, mut client) = pair(&mut reactor);

        io.write(&mut reactor, b"bye").unwrap();
        io.begin_drain(&mut reactor).unwrap();
        assert_eq!(io.lifecycle(), Lifecycle::Draining);
        assert!(matches!(io.write(&mut reactor, b"more"), Err(TransportError::Closed)));

        drive(&mut reactor, &mut io, |io| io.is_closed());
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"bye");
    }

    #[test]
    fn test_backlog_pauses_reads() {
        let mut reactor = reactor();
        let (mut io, mut client) = pair(&mut reactor);

        let payload = vec![b'x'; WRITE_HIGH_WATERMARK + 1];
        io.write(&mut reactor, &payload).unwrap();
        assert!(!io.can_read());
        assert!(!reactor.is_registered(CONN, Direction::Readable));

        let expected = payload.len();
        let reader = thread::spawn(move || {
            let mut buf = vec![0u8; expected];
            client.read_exact(&mut buf).unwrap();
            client
        });

        drive(&mut reactor, &mut io, |io| io.pending() == 0);
        assert!(io.can_read());
        assert!(reactor.is_registered(CONN, Direction::Readable));
        reader.join().unwrap();
    }
}
