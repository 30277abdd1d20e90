use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Snapshot of proxy-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStats {
    /// Total number of accepted connections
    pub total_connections: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Requests refused with 403 because the quota was exceeded
    pub rejected_requests: u64,
    /// Connections closed because no target could be derived
    pub parse_failures: u64,
    /// Connections closed because the upstream was unreachable
    pub connect_failures: u64,
    /// Plain requests forwarded
    pub forwarded_requests: u64,
    /// CONNECT tunnels opened
    pub tunnels_opened: u64,
    /// Bytes relayed client -> upstream
    pub bytes_up: u64,
    /// Bytes relayed upstream -> client
    pub bytes_down: u64,
    /// Timestamp when the proxy started (Unix timestamp)
    pub start_time: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_requests: AtomicU64,
    parse_failures: AtomicU64,
    connect_failures: AtomicU64,
    forwarded_requests: AtomicU64,
    tunnels_opened: AtomicU64,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Global statistics manager
#[derive(Debug, Clone)]
pub struct StatsManager {
    counters: Arc<Counters>,
    start_time: u64,
}

impl StatsManager {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Increment active connections (called when connection starts)
    pub fn connection_started(&self) {
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections (called when connection ends)
    pub fn connection_ended(&self) {
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Start tracking a connection; the returned guard ends it on drop
    pub fn track_connection(&self) -> ConnectionGuard {
        self.connection_started();
        ConnectionGuard::new(self.clone())
    }

    pub fn record_rejected(&self) {
        self.counters.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_failure(&self) {
        self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.counters.forwarded_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tunnel_opened(&self) {
        self.counters.tunnels_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes sent upstream
    pub fn add_bytes_up(&self, bytes: u64) {
        self.counters.bytes_up.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add bytes sent to clients
    pub fn add_bytes_down(&self, bytes: u64) {
        self.counters.bytes_down.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn get_stats(&self) -> ProxyStats {
        let c = &self.counters;
        ProxyStats {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Relaxed),
            rejected_requests: c.rejected_requests.load(Ordering::Relaxed),
            parse_failures: c.parse_failures.load(Ordering::Relaxed),
            connect_failures: c.connect_failures.load(Ordering::Relaxed),
            forwarded_requests: c.forwarded_requests.load(Ordering::Relaxed),
            tunnels_opened: c.tunnels_opened.load(Ordering::Relaxed),
            bytes_up: c.bytes_up.load(Ordering::Relaxed),
            bytes_down: c.bytes_down.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

impl Default for StatsManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard to automatically decrement active connections count
pub struct ConnectionGuard {
    stats: StatsManager,
}

impl ConnectionGuard {
    pub fn new(stats: StatsManager) -> Self {
        Self { stats }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connection_ended();
    }
}
