//! Relay metrics for observability

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay-wide counters
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Participant metrics
    /// Currently connected participants
    pub active_participants: AtomicU64,
    /// Total participants since start
    pub total_participants: AtomicU64,

    // Message metrics
    /// `message` events received from participants
    pub messages_received: AtomicU64,
    /// Individual deliveries to other participants
    pub messages_forwarded: AtomicU64,
    /// Bodies dropped because they were already broadcast
    pub duplicates_dropped: AtomicU64,
    /// Messages dropped while waiting for rates to be redeclared
    pub messages_suspended: AtomicU64,

    // Error metrics
    /// Resets caused by disagreeing baud rates
    pub rate_mismatches: AtomicU64,
    /// Frames that did not parse as a client event
    pub malformed_frames: AtomicU64,

    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn participant_connected(&self) {
        self.active_participants.fetch_add(1, Ordering::Relaxed);
        self.total_participants.fetch_add(1, Ordering::Relaxed);
    }

    pub fn participant_disconnected(&self) {
        self.active_participants.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages_forwarded(&self, count: u64) {
        self.messages_forwarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn duplicate_dropped(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_suspended(&self) {
        self.messages_suspended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_mismatch(&self) {
        self.rate_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            participants: ParticipantMetrics {
                active: self.active_participants.load(Ordering::Relaxed),
                total: self.total_participants.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
                forwarded: self.messages_forwarded.load(Ordering::Relaxed),
                duplicates: self.duplicates_dropped.load(Ordering::Relaxed),
                suspended: self.messages_suspended.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                rate_mismatches: self.rate_mismatches.load(Ordering::Relaxed),
                malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub participants: ParticipantMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub forwarded: u64,
    pub duplicates: u64,
    pub suspended: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub rate_mismatches: u64,
    pub malformed_frames: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_tracking() {
        let metrics = RelayMetrics::new();

        metrics.participant_connected();
        metrics.participant_connected();
        assert_eq!(metrics.active_participants.load(Ordering::Relaxed), 2);

        metrics.participant_disconnected();
        assert_eq!(metrics.active_participants.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_participants.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_snapshot() {
        let metrics = RelayMetrics::new();
        metrics.participant_connected();
        metrics.message_received();
        metrics.messages_forwarded(3);
        metrics.duplicate_dropped();
        metrics.rate_mismatch();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.participants.active, 1);
        assert_eq!(snapshot.messages.received, 1);
        assert_eq!(snapshot.messages.forwarded, 3);
        assert_eq!(snapshot.messages.duplicates, 1);
        assert_eq!(snapshot.errors.rate_mismatches, 1);
    }
}
