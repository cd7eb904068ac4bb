//! Observability and Metrics
//!
//! Per-node counters for the multiplexer, the routing engine and the join
//! handshake. Every counter is an atomic so the reactor task can update them
//! while handles read snapshots from other tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector shared between a node's reactor and its handle
#[derive(Debug)]
pub struct Metrics {
    /// Inbound connections accepted
    pub connections_accepted: AtomicU64,
    /// Outbound connections dialed successfully
    pub connections_dialed: AtomicU64,
    /// Currently open connections
    pub connections_active: AtomicU64,
    /// Frames decoded from peers
    pub frames_received: AtomicU64,
    /// Frames queued for peers
    pub frames_sent: AtomicU64,
    /// Connections closed because of undecodable frames
    pub framing_errors: AtomicU64,
    /// Failed outbound dials
    pub connect_errors: AtomicU64,
    /// Packets dropped because the next hop id had no known address
    pub unknown_peer_drops: AtomicU64,
    /// Packets dropped for any other reason
    pub packets_dropped: AtomicU64,
    /// `new_user` copies forwarded to neighbors
    pub broadcasts_forwarded: AtomicU64,
    /// Chat messages handed to the application
    pub messages_delivered: AtomicU64,
    /// `find_insert_place` / `connect` rounds run by the join handshake
    pub join_attempts: AtomicU64,
    /// Rounds lost to a concurrent joiner
    pub join_retries: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_dialed: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            connect_errors: AtomicU64::new(0),
            unknown_peer_drops: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            broadcasts_forwarded: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            join_attempts: AtomicU64::new(0),
            join_retries: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_dialed(&self) {
        self.connections_dialed.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn framing_error(&self) {
        self.framing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_error(&self) {
        self.connect_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_peer(&self) {
        self.unknown_peer_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_forwarded(&self) {
        self.broadcasts_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn join_attempt(&self) {
        self.join_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn join_retry(&self) {
        self.join_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_dialed: self.connections_dialed.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            connect_errors: self.connect_errors.load(Ordering::Relaxed),
            unknown_peer_drops: self.unknown_peer_drops.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            broadcasts_forwarded: self.broadcasts_forwarded.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            join_attempts: self.join_attempts.load(Ordering::Relaxed),
            join_retries: self.join_retries.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_accepted = snapshot.connections_accepted,
            connections_dialed = snapshot.connections_dialed,
            connections_active = snapshot.connections_active,
            frames_received = snapshot.frames_received,
            frames_sent = snapshot.frames_sent,
            framing_errors = snapshot.framing_errors,
            connect_errors = snapshot.connect_errors,
            unknown_peer_drops = snapshot.unknown_peer_drops,
            packets_dropped = snapshot.packets_dropped,
            broadcasts_forwarded = snapshot.broadcasts_forwarded,
            messages_delivered = snapshot.messages_delivered,
            join_attempts = snapshot.join_attempts,
            join_retries = snapshot.join_retries,
            uptime_seconds = snapshot.uptime_seconds,
            "Overlay metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_dialed: u64,
    pub connections_active: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub framing_errors: u64,
    pub connect_errors: u64,
    pub unknown_peer_drops: u64,
    pub packets_dropped: u64,
    pub broadcasts_forwarded: u64,
    pub messages_delivered: u64,
    pub join_attempts: u64,
    pub join_retries: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
