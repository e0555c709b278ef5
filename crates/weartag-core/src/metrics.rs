//! Session counters.
//!
//! Every drop the engine performs on purpose (undecodable frames, late
//! responses, notifications nobody listens to, overflowing subscriber
//! queues) is counted here so it can be observed without log scraping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Latency summary for completed commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Number of samples.
    pub count: u64,
    /// Fastest sample.
    pub min_ms: Option<u64>,
    /// Slowest sample.
    pub max_ms: Option<u64>,
    /// Mean of all samples.
    pub avg_ms: Option<f64>,
}

/// Lock-free latency accumulator.
#[derive(Debug)]
struct LatencyTracker {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }
}

impl LatencyTracker {
    fn record(&self, duration: Duration) {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn summary(&self) -> LatencySummary {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return LatencySummary::default();
        }
        let total = self.total_ms.load(Ordering::Relaxed);
        LatencySummary {
            count,
            min_ms: Some(self.min_ms.load(Ordering::Relaxed)),
            max_ms: Some(self.max_ms.load(Ordering::Relaxed)),
            avg_ms: Some(total as f64 / count as f64),
        }
    }
}

/// Counters for one tag, shared by every session it goes through.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    sessions_established: AtomicU64,
    frames_received: AtomicU64,
    decode_errors: AtomicU64,
    late_responses: AtomicU64,
    commands_sent: AtomicU64,
    commands_completed: AtomicU64,
    commands_timed_out: AtomicU64,
    commands_invalidated: AtomicU64,
    notifications_delivered: AtomicU64,
    notifications_unrouted: AtomicU64,
    notifications_overflowed: AtomicU64,
    latency: LatencyTracker,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub(crate) fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl SessionMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_session, sessions_established);
    counter!(record_frame, frames_received);
    counter!(record_decode_error, decode_errors);
    counter!(record_late_response, late_responses);
    counter!(record_command_sent, commands_sent);
    counter!(record_timeout, commands_timed_out);
    counter!(record_unrouted, notifications_unrouted);

    pub(crate) fn record_invalidated(&self, count: usize) {
        self.commands_invalidated
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self, count: usize) {
        self.notifications_delivered
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_overflow(&self, count: usize) {
        self.notifications_overflowed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self, latency: Duration) {
        self.commands_completed.fetch_add(1, Ordering::Relaxed);
        self.latency.record(latency);
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            sessions_established: load(&self.sessions_established),
            frames_received: load(&self.frames_received),
            decode_errors: load(&self.decode_errors),
            late_responses: load(&self.late_responses),
            commands_sent: load(&self.commands_sent),
            commands_completed: load(&self.commands_completed),
            commands_timed_out: load(&self.commands_timed_out),
            commands_invalidated: load(&self.commands_invalidated),
            notifications_delivered: load(&self.notifications_delivered),
            notifications_unrouted: load(&self.notifications_unrouted),
            notifications_overflowed: load(&self.notifications_overflowed),
            command_latency: self.latency.summary(),
        }
    }
}

/// Serializable copy of [`SessionMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sessions_established: u64,
    pub frames_received: u64,
    /// Frames dropped because they failed to decode.
    pub decode_errors: u64,
    /// Responses whose command had already timed out or been cancelled.
    pub late_responses: u64,
    pub commands_sent: u64,
    pub commands_completed: u64,
    pub commands_timed_out: u64,
    pub commands_invalidated: u64,
    /// Notification copies handed to subscribers.
    pub notifications_delivered: u64,
    /// Notifications with no active subscriber.
    pub notifications_unrouted: u64,
    /// Notifications dropped on a full subscriber queue.
    pub notifications_overflowed: u64,
    pub command_latency: LatencySummary,
}
