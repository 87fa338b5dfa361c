// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters shared by every worker loop.
#[repr(C, align(64))]
pub struct WorkerMetrics {
    pub active_conns: AtomicUsize,
    pub accepted_conns: AtomicUsize,
    pub messages: AtomicUsize,
    pub bytes_received: AtomicUsize,
    pub bytes_sent: AtomicUsize,
}

/// Point-in-time copy of [`WorkerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active_conns: usize,
    pub accepted_conns: usize,
    pub messages: usize,
    pub bytes_received: usize,
    pub bytes_sent: usize,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            active_conns: AtomicUsize::new(0),
            accepted_conns: AtomicUsize::new(0),
            messages: AtomicUsize::new(0),
            bytes_received: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
        self.accepted_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_conns: self.active_conns.load(Ordering::Relaxed),
            accepted_conns: self.accepted_conns.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counters() {
        let metrics = WorkerMetrics::new();
        metrics.inc_conn();
        metrics.inc_conn();
        metrics.dec_conn();
        metrics.add_sent(10);
        metrics.add_received(4);
        metrics.inc_message();

        let snap = metrics.snapshot();
        assert_eq!(snap.active_conns, 1);
        assert_eq!(snap.accepted_conns, 2);
        assert_eq!(snap.messages, 1);
        assert_eq!(snap.bytes_sent, 10);
        assert_eq!(snap.bytes_received, 4);
        assert_eq!(std::mem::align_of::<WorkerMetrics>(), 64);
    }
}
