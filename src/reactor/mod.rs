//! Readiness Reactor
//!
//! Single-threaded event multiplexer driven by `mio::Poll`. Interest is
//! tracked per token and per direction; timers share the dispatch path
//! with socket events.
//!
//! Handlers are addressed by `Token`, never by reference. The owner of a
//! handler looks the token up on every dispatch, so a handler that closed
//! itself earlier in the same batch is simply not found.

mod timer;

pub use timer::TimerId;

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use tracing::trace;

use crate::error::ReactorError;
use timer::TimerQueue;

/// Upper bound on a single wait so the loop can re-check external state
pub const DEFAULT_WAIT: Duration = Duration::from_secs(1);

/// Events drained from the kernel per wait
pub const DEFAULT_MAX_EVENTS: usize = 128;

/// Interest direction for `Reactor::toggle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Readable,
    Writable,
}

/// Event delivered to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    /// Bytes or pending connections are available
    Readable,
    /// The peer will send nothing more. Follows `Readable`.
    ReadEof,
    /// The socket accepts writes again
    Writable,
    /// Nothing more can be written. Follows `Writable`.
    WriteEof,
    /// A timer registered for this token expired
    Timeout(TimerId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Registration {
    readable: bool,
    writable: bool,
}

impl Registration {
    fn interest(self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn with(mut self, direction: Direction, enabled: bool) -> Self {
        match direction {
            Direction::Readable => self.readable = enabled,
            Direction::Writable => self.writable = enabled,
        }
        self
    }
}

/// Readiness event loop
pub struct Reactor {
    poll: Poll,
    events: Events,
    ready: Vec<(Token, Ready)>,
    fired: Vec<(TimerId, Token)>,
    registrations: HashMap<Token, Registration>,
    timers: TimerQueue,
    wait: Duration,
}

impl Reactor {
    /// Acquire the kernel poller
    ///
    /// # Errors
    ///
    /// Returns `ReactorError::Init` if the notification context cannot be created.
    pub fn new(max_events: usize, wait: Duration) -> Result<Self, ReactorError> {
        let poll = Poll::new().map_err(ReactorError::Init)?;
        let capacity = max_events.max(1);
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            ready: Vec::with_capacity(capacity * 2),
            fired: Vec::new(),
            registrations: HashMap::new(),
            timers: TimerQueue::new(),
            wait,
        })
    }

    /// Reactor with the default wait interval and event buffer
    pub fn with_defaults() -> Result<Self, ReactorError> {
        Self::new(DEFAULT_MAX_EVENTS, DEFAULT_WAIT)
    }

    /// Enable or disable delivery of `direction` events for `token`.
    ///
    /// Disabling the last direction deregisters the source from the kernel
    /// without closing it.
    ///
    /// # Errors
    ///
    /// Returns `ReactorError::Register` if the kernel rejects the change.
    pub fn toggle<S>(
        &mut self,
        source: &mut S,
        token: Token,
        direction: Direction,
        enabled: bool,
    ) -> Result<(), ReactorError>
    where
        S: Source + ?Sized,
    {
        let current = self.registrations.get(&token).copied().unwrap_or_default();
        let next = current.with(direction, enabled);
        if next == current {
            return Ok(());
        }

        let registry = self.poll.registry();
        match (current.interest(), next.interest()) {
            (None, Some(interest)) => registry.register(source, token, interest),
            (Some(_), Some(interest)) => registry.reregister(source, token, interest),
            (Some(_), None) => registry.deregister(source),
            (None, None) => Ok(()),
        }
        .map_err(ReactorError::Register)?;

        if next.interest().is_some() {
            self.registrations.insert(token, next);
        } else {
            self.registrations.remove(&token);
        }
        trace!(token = token.0, ?direction, enabled, "interest toggled");
        Ok(())
    }

    /// Drop every interest held for `token`
    pub fn forget<S>(&mut self, source: &mut S, token: Token) -> Result<(), ReactorError>
    where
        S: Source + ?Sized,
    {
        match self.registrations.remove(&token) {
            Some(registration) if registration.interest().is_some() => self
                .poll
                .registry()
                .deregister(source)
                .map_err(ReactorError::Register),
            _ => Ok(()),
        }
    }

    /// Whether `direction` events are currently delivered for `token`
    pub fn is_registered(&self, token: Token, direction: Direction) -> bool {
        self.registrations
            .get(&token)
            .map(|registration| match direction {
                Direction::Readable => registration.readable,
                Direction::Writable => registration.writable,
            })
            .unwrap_or(false)
    }

    /// Schedule a `Ready::Timeout` for `token` after `delay`
    pub fn set_timeout(&mut self, delay: Duration, token: Token, recurring: bool) -> TimerId {
        let id = self.timers.insert(Instant::now(), delay, token, recurring);
        trace!(timer = %id, token = token.0, ?delay, recurring, "timer armed");
        id
    }

    /// Cancel a pending timer
    ///
    /// # Errors
    ///
    /// Returns `ReactorError::UnknownTimer` if the timer already fired or never existed.
    pub fn clear_timeout(&mut self, id: TimerId) -> Result<(), ReactorError> {
        if self.timers.remove(id) {
            Ok(())
        } else {
            Err(ReactorError::UnknownTimer(id.0))
        }
    }

    /// Number of live timers
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Wait for readiness, then dispatch every event in arrival order.
    ///
    /// The wait is bounded by the configured interval and by the nearest
    /// timer deadline. Returns the number of events dispatched.
    ///
    /// # Errors
    ///
    /// Returns `ReactorError::Wait` if the kernel wait fails.
    pub fn poll<F>(&mut self, mut dispatch: F) -> Result<usize, ReactorError>
    where
        F: FnMut(&mut Reactor, Token, Ready),
    {
        let timeout = match self.timers.next_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(self.wait),
            None => self.wait,
        };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            // A signal landed during the wait; treat it as an empty cycle
            Err(error) if error.kind() == ErrorKind::Interrupted => self.events.clear(),
            Err(error) => return Err(ReactorError::Wait(error)),
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();

        for event in &self.events {
            let token = event.token();
            let Some(registration) = self.registrations.get(&token).copied() else {
                continue;
            };
            let read_closed = event.is_read_closed() || event.is_error();
            let write_closed = event.is_write_closed() || event.is_error();

            if registration.readable && (event.is_readable() || read_closed) {
                ready.push((token, Ready::Readable));
                if read_closed {
                    ready.push((token, Ready::ReadEof));
                }
            }
            if registration.writable && (event.is_writable() || write_closed) {
                ready.push((token, Ready::Writable));
                if write_closed {
                    ready.push((token, Ready::WriteEof));
                }
            }
        }

        let mut fired = std::mem::take(&mut self.fired);
        fired.clear();
        self.timers.expire(Instant::now(), &mut fired);
        ready.extend(fired.iter().map(|&(id, token)| (token, Ready::Timeout(id))));
        self.fired = fired;

        let mut count = 0;
        for &(token, event) in &ready {
            if let Ready::Timeout(id) = event {
                // Cancelled by an earlier handler in this batch
                if !self.timers.claim(id) {
                    continue;
                }
            }
            dispatch(self, token, event);
            count += 1;
        }

        self.ready = ready;
        Ok(count)
    }
}
