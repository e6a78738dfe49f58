//! Server Configuration

use std::time::Duration;

use crate::reactor::{DEFAULT_MAX_EVENTS, DEFAULT_WAIT};

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address
    pub bind: String,

    /// Port number (0 = ephemeral)
    pub port: u16,

    /// Listen backlog
    pub backlog: i32,

    /// Events drained per reactor wait
    pub max_events: usize,

    /// Upper bound on a single reactor wait
    pub poll_interval: Duration,

    /// Period of the statistics log line (None = disabled)
    pub stats_interval: Option<Duration>,

    /// Period of the store flush timer (None = disabled)
    pub flush_interval: Option<Duration>,

    /// How long shutdown waits for pending output
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 6379,
            backlog: 128,
            max_events: DEFAULT_MAX_EVENTS,
            poll_interval: DEFAULT_WAIT,
            stats_interval: Some(Duration::from_secs(60)),
            flush_interval: None,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Create a new config with custom port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Create a new config with custom bind address
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stats_interval(mut self, interval: Option<Duration>) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Set the periodic store flush, used by the `everysec` AOF mode
    pub fn with_flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}
