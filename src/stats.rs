use std::sync::atomic::{AtomicU64, Ordering};

/// TargetStats aggregates every session ever created against one target.
/// It is only mutated under the table lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetStats {
    pub active_connections: u32,
    pub total_connections: u64,
    pub connection_failures: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// TargetStats implementation block
impl TargetStats {
    pub(crate) fn record_open(&mut self) {
        self.active_connections += 1;
        self.total_connections += 1;
    }

    pub(crate) fn record_close(&mut self, bytes_sent: u64, bytes_received: u64) {
        self.active_connections = self.active_connections.saturating_sub(1);
        self.bytes_sent += bytes_sent;
        self.bytes_received += bytes_received;
    }

    pub(crate) fn record_failure(&mut self) {
        self.connection_failures += 1;
    }
}

/// ServerStats counts what the server state machine decided about inbound
/// clients. Updated from connection tasks without taking the table lock
#[derive(Debug, Default)]
pub struct ServerStats {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    auth_failures: AtomicU64,
}

/// ServerStatsSnapshot is a point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub auth_failures: u64,
}

/// ServerStats implementation block
impl ServerStats {
    pub fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
        }
    }
}
