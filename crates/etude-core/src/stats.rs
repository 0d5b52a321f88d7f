// src/stats.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide counters shared by the reactor and the pool workers.
///
/// `active_connections` doubles as the admission counter: accepts are
/// refused once it reaches the configured connection limit.
#[repr(C, align(64))]
pub struct ServerStats {
    active_connections: AtomicUsize,
    total_requests: AtomicUsize,
    bytes_sent: AtomicUsize,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicUsize::new(0),
            total_requests: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn inc_conn(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn conn_count(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn inc_req(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self) -> usize {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_connections_and_traffic() {
        let stats = ServerStats::new();
        stats.inc_conn();
        stats.inc_conn();
        stats.dec_conn();
        stats.inc_req();
        stats.add_bytes(1500);
        assert_eq!(stats.conn_count(), 1);
        assert_eq!(stats.requests(), 1);
        assert_eq!(stats.bytes(), 1500);
    }
}
