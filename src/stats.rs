//! # Call Statistics
//!
//! Per-call counters shared between the session, the capture callback and the
//! playback task. Each call gets a fresh `CallStats`; the session logs a summary
//! when the call returns to idle.
//!
//! ## Arc + atomics
//! The capture callback runs on the audio device thread, playback runs in its
//! own task, and the session reads everything at teardown. Plain atomic
//! counters let all three touch the numbers without a lock.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one call.
#[derive(Debug, Default)]
pub struct CallStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    inbound_events: AtomicU64,
    protocol_errors: AtomicU64,
    chunks_played: AtomicU64,
    decode_failures: AtomicU64,
}

/// Point-in-time copy of [`CallStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CallStatsSnapshot {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub inbound_events: u64,
    pub protocol_errors: u64,
    pub chunks_played: u64,
    pub decode_failures: u64,
}

impl CallStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// A capture frame was handed to the channel writer.
    pub fn record_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// A capture frame completed while the channel was not ready (or full) and was dropped.
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inbound_event(&self) {
        self.inbound_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_played(&self) {
        self.chunks_played.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CallStatsSnapshot {
        CallStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            inbound_events: self.inbound_events.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            chunks_played: self.chunks_played.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

impl CallStatsSnapshot {
    /// Fraction of completed capture frames that never reached the channel (0.0 to 1.0).
    pub fn drop_rate(&self) -> f64 {
        let total = self.frames_sent + self.frames_dropped;
        if total > 0 {
            self.frames_dropped as f64 / total as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_drop_rate() {
        let stats = CallStats::new();
        assert_eq!(stats.snapshot().drop_rate(), 0.0);

        for _ in 0..3 {
            stats.record_frame_sent();
        }
        stats.record_frame_dropped();
        stats.record_decode_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_sent, 3);
        assert_eq!(snapshot.frames_dropped, 1);
        assert_eq!(snapshot.decode_failures, 1);
        assert_eq!(snapshot.drop_rate(), 0.25);
    }
}
