//! Bridge-wide counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct BridgeMetrics {
    // Inbound
    pub messages_received: AtomicU64,
    /// Messages held back by the debounce buffer
    pub messages_buffered: AtomicU64,
    pub clears: AtomicU64,
    /// Per-user sessions created
    pub sessions: AtomicU64,

    // Backend
    pub backend_requests: AtomicU64,
    pub backend_errors: AtomicU64,
    pub requests_cancelled: AtomicU64,

    // Outbound
    pub replies_sent: AtomicU64,
    /// Messages sent for chunked replies (counted in addition to replies_sent)
    pub chunks_sent: AtomicU64,
    pub transport_errors: AtomicU64,

    pub reconnect_attempts: AtomicU64,

    start_time: Option<Instant>,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_buffered(&self) {
        self.messages_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backend_request(&self) {
        self.backend_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_sent(&self, messages: usize) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
        if messages > 1 {
            self.chunks_sent
                .fetch_add(messages as u64, Ordering::Relaxed);
        }
    }

    pub fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_reconnect_attempts(&self, total: u64) {
        self.reconnect_attempts.store(total, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            inbound: InboundMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                buffered: self.messages_buffered.load(Ordering::Relaxed),
                clears: self.clears.load(Ordering::Relaxed),
                sessions: self.sessions.load(Ordering::Relaxed),
            },
            backend: BackendMetrics {
                requests: self.backend_requests.load(Ordering::Relaxed),
                errors: self.backend_errors.load(Ordering::Relaxed),
                cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            },
            outbound: OutboundMetrics {
                replies: self.replies_sent.load(Ordering::Relaxed),
                chunks: self.chunks_sent.load(Ordering::Relaxed),
                transport_errors: self.transport_errors.load(Ordering::Relaxed),
            },
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub inbound: InboundMetrics,
    pub backend: BackendMetrics,
    pub outbound: OutboundMetrics,
    pub reconnect_attempts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMetrics {
    pub received: u64,
    pub buffered: u64,
    pub clears: u64,
    pub sessions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMetrics {
    pub requests: u64,
    pub errors: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMetrics {
    pub replies: u64,
    pub chunks: u64,
    pub transport_errors: u64,
}
