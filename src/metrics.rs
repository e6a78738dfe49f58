//! Basic Metrics
//!
//! Command counters, connection counters and latency tracking. Logged by
//! the server's statistics timer.

use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector
#[derive(Debug)]
pub struct Metrics {
    /// Total commands executed
    total_ops: AtomicU64,

    /// Commands per name
    ops_by_command: RwLock<HashMap<String, u64>>,

    /// Commands answered with an error reply
    command_errors: AtomicU64,

    /// Connection lifecycle
    connections_accepted: AtomicU64,
    connections_closed: AtomicU64,

    /// Published messages written to subscribers
    messages_delivered: AtomicU64,

    /// Latency tracking (simplified)
    latency_sum_us: AtomicU64,
    latency_count: AtomicU64,
    latency_min_us: AtomicU64,
    latency_max_us: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            total_ops: AtomicU64::new(0),
            ops_by_command: RwLock::new(HashMap::new()),
            command_errors: AtomicU64::new(0),
            connections_accepted: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            latency_min_us: AtomicU64::new(u64::MAX),
            latency_max_us: AtomicU64::new(0),
        }
    }

    /// Record an executed command
    pub fn record_operation(&self, command: &str, latency: Duration) {
        self.total_ops.fetch_add(1, Ordering::Relaxed);

        {
            let mut ops = self.ops_by_command.write();
            match ops.get_mut(command) {
                Some(count) => *count += 1,
                None => {
                    ops.insert(command.to_string(), 1);
                }
            }
        }

        let latency_us = latency.as_micros() as u64;
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_min_us.fetch_min(latency_us, Ordering::Relaxed);
        self.latency_max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.command_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, recipients: u64) {
        self.messages_delivered.fetch_add(recipients, Ordering::Relaxed);
    }

    /// Get total operations count
    pub fn total_ops(&self) -> u64 {
        self.total_ops.load(Ordering::Relaxed)
    }

    /// Get operations by command
    pub fn ops_by_command(&self) -> HashMap<String, u64> {
        self.ops_by_command.read().clone()
    }

    pub fn command_errors(&self) -> u64 {
        self.command_errors.load(Ordering::Relaxed)
    }

    pub fn connections_accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn connections_closed(&self) -> u64 {
        self.connections_closed.load(Ordering::Relaxed)
    }

    pub fn messages_delivered(&self) -> u64 {
        self.messages_delivered.load(Ordering::Relaxed)
    }

    /// Get average latency in microseconds
    pub fn avg_latency_us(&self) -> f64 {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let sum = self.latency_sum_us.load(Ordering::Relaxed);
        sum as f64 / count as f64
    }

    /// Get min latency in microseconds
    pub fn min_latency_us(&self) -> u64 {
        let min = self.latency_min_us.load(Ordering::Relaxed);
        if min == u64::MAX {
            0
        } else {
            min
        }
    }

    /// Get max latency in microseconds
    pub fn max_latency_us(&self) -> u64 {
        self.latency_max_us.load(Ordering::Relaxed)
    }

    /// Get a summary of metrics
    pub fn summary(&self) -> String {
        format!(
            "Operations: {} (errors {}) | Connections: +{} -{} | Delivered: {} | Latency (µs): avg={:.1}, min={}, max={}",
            self.total_ops(),
            self.command_errors(),
            self.connections_accepted(),
            self.connections_closed(),
            self.messages_delivered(),
            self.avg_latency_us(),
            self.min_latency_us(),
            self.max_latency_us()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = Metrics::new();

        metrics.record_operation("GET", Duration::from_micros(100));
        metrics.record_operation("GET", Duration::from_micros(200));
        metrics.record_operation("SET", Duration::from_micros(150));

        assert_eq!(metrics.total_ops(), 3);
        assert_eq!(metrics.min_latency_us(), 100);
        assert_eq!(metrics.max_latency_us(), 200);
        assert!((metrics.avg_latency_us() - 150.0).abs() < 0.1);

        let by_cmd = metrics.ops_by_command();
        assert_eq!(by_cmd.get("GET"), Some(&2));
        assert_eq!(by_cmd.get("SET"), Some(&1));
    }

    #[test]
    fn test_connection_counters() {
        let metrics = Metrics::new();
        metrics.record_accept();
        metrics.record_accept();
        metrics.record_close();
        metrics.record_delivered(3);
        metrics.record_error();

        assert_eq!(metrics.connections_accepted(), 2);
        assert_eq!(metrics.connections_closed(), 1);
        assert_eq!(metrics.messages_delivered(), 3);
        assert_eq!(metrics.command_errors(), 1);
        assert_eq!(metrics.min_latency_us(), 0);
        assert!(metrics.summary().contains("Connections: +2 -1"));
    }
}
