//! Health monitoring and metrics for recorded tracks

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Health metrics for one track
///
/// Written only by the track's receive task, read by the session's health
/// logger. All fields use atomic operations for thread-safe access.
pub struct TrackHealth {
    /// Packets handed over by the transport
    pub packets_received: AtomicU64,

    /// Packets given up on by the jitter buffer
    pub packets_lost: AtomicU64,

    /// Packets that arrived after their sequence number was already released
    pub packets_late: AtomicU64,

    /// Partial frames discarded because their last fragment never arrived
    pub frames_dropped: AtomicU64,

    /// Fragments the payload format could not parse
    pub malformed_fragments: AtomicU64,

    /// Frames handed to the sink
    pub frames_written: AtomicU64,

    /// Total bytes handed to the sink
    pub bytes_written: AtomicU64,

    /// Number of keyframes handed to the sink
    pub keyframes_written: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last received packet
    pub last_packet_time: AtomicU64,
}

fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

impl TrackHealth {
    /// Create a new health metrics instance
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            packets_late: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            malformed_fragments: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            keyframes_written: AtomicU64::new(0),
            last_packet_time: AtomicU64::new(now_micros()),
        }
    }

    /// Record a packet received from the transport
    pub fn record_packet(&self) {
        self.last_packet_time.store(now_micros(), Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a frame written to the sink
    pub fn record_frame(&self, size: usize, is_keyframe: bool) {
        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes_written.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Publish the running totals kept by the jitter buffer and depacketizer
    pub fn update_losses(&self, lost: u64, late: u64, dropped: u64, malformed: u64) {
        self.packets_lost.store(lost, Ordering::Relaxed);
        self.packets_late.store(late, Ordering::Relaxed);
        self.frames_dropped.store(dropped, Ordering::Relaxed);
        self.malformed_fragments.store(malformed, Ordering::Relaxed);
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost.load(Ordering::Relaxed)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Calculate the packet loss rate as a percentage
    pub fn packet_loss_rate(&self) -> f64 {
        let lost = self.packets_lost();
        let total = self.packets_received() + lost;
        if total == 0 {
            0.0
        } else {
            (lost as f64 / total as f64) * 100.0
        }
    }

    /// Check if the track has not received a packet for `threshold`
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let last_packet = self.last_packet_time.load(Ordering::Relaxed);
        let elapsed_micros = now_micros().saturating_sub(last_packet);
        elapsed_micros > threshold.as_micros() as u64
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            packets_received: self.packets_received(),
            packets_lost: self.packets_lost(),
            packets_late: self.packets_late.load(Ordering::Relaxed),
            frames_written: self.frames_written(),
            frames_dropped: self.frames_dropped(),
            malformed_fragments: self.malformed_fragments.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            keyframes_written: self.keyframes_written.load(Ordering::Relaxed),
            packet_loss_rate: self.packet_loss_rate(),
        }
    }
}

impl Default for TrackHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, Default)]
pub struct HealthSummary {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub packets_late: u64,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub malformed_fragments: u64,
    pub bytes_written: u64,
    pub keyframes_written: u64,
    pub packet_loss_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} packets ({} lost, {:.2}%, {} late), {} frames ({} dropped, {} keyframes), {} malformed fragments, {} bytes",
            self.packets_received,
            self.packets_lost,
            self.packet_loss_rate,
            self.packets_late,
            self.frames_written,
            self.frames_dropped,
            self.keyframes_written,
            self.malformed_fragments,
            self.bytes_written
        )
    }
}
