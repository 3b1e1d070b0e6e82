//! Statistics and metrics for RTMP connections
//!
//! The connection worker and the frame senders bump shared atomic counters;
//! [`ConnectionStats::snapshot`] reads them from any thread without going
//! through the worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::media::MediaKind;

/// Live counters for one connection
#[derive(Debug)]
pub struct ConnectionStats {
    started_at: Instant,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    audio_frames_sent: AtomicU64,
    video_frames_sent: AtomicU64,
    audio_frames_received: AtomicU64,
    video_frames_received: AtomicU64,
    keyframes_received: AtomicU64,
    dropped_frames: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            audio_frames_sent: AtomicU64::new(0),
            video_frames_sent: AtomicU64::new(0),
            audio_frames_received: AtomicU64::new(0),
            video_frames_received: AtomicU64::new(0),
            keyframes_received: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
        }
    }

    pub fn record_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_frame_sent(&self, kind: MediaKind) {
        match kind {
            MediaKind::Audio => &self.audio_frames_sent,
            MediaKind::Video => &self.video_frames_sent,
        }
        .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_received(&self, kind: MediaKind, keyframe: bool) {
        match kind {
            MediaKind::Audio => &self.audio_frames_received,
            MediaKind::Video => &self.video_frames_received,
        }
        .fetch_add(1, Ordering::Relaxed);
        if keyframe {
            self.keyframes_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A frame the client had to discard (stream not publishing, worker gone)
    pub fn record_dropped_frame(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes received so far, as counted for acknowledgements
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> SessionStats {
        let mut stats = SessionStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            duration: self.started_at.elapsed(),
            audio_frames_sent: self.audio_frames_sent.load(Ordering::Relaxed),
            video_frames_sent: self.video_frames_sent.load(Ordering::Relaxed),
            audio_frames_received: self.audio_frames_received.load(Ordering::Relaxed),
            video_frames_received: self.video_frames_received.load(Ordering::Relaxed),
            keyframes_received: self.keyframes_received.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            bitrate: 0,
        };
        stats.calculate_bitrate();
        stats
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection statistics at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Total bytes received
    pub bytes_received: u64,
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Connection duration
    pub duration: Duration,
    pub audio_frames_sent: u64,
    pub video_frames_sent: u64,
    pub audio_frames_received: u64,
    pub video_frames_received: u64,
    /// Number of keyframes received
    pub keyframes_received: u64,
    /// Dropped frames count
    pub dropped_frames: u64,
    /// Outbound bitrate estimate (bits/sec)
    pub bitrate: u64,
}

impl SessionStats {
    /// Calculate bitrate from bytes sent and duration
    pub fn calculate_bitrate(&mut self) {
        let secs = self.duration.as_secs();
        if secs > 0 {
            self.bitrate = (self.bytes_sent * 8) / secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ConnectionStats::new();
        stats.record_bytes_received(100);
        stats.record_bytes_received(50);
        stats.record_bytes_sent(10);
        stats.record_frame_sent(MediaKind::Audio);
        stats.record_frame_sent(MediaKind::Video);
        stats.record_frame_sent(MediaKind::Video);
        stats.record_frame_received(MediaKind::Video, true);
        stats.record_frame_received(MediaKind::Audio, false);
        stats.record_dropped_frame();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_received, 150);
        assert_eq!(snap.bytes_sent, 10);
        assert_eq!(snap.audio_frames_sent, 1);
        assert_eq!(snap.video_frames_sent, 2);
        assert_eq!(snap.video_frames_received, 1);
        assert_eq!(snap.audio_frames_received, 1);
        assert_eq!(snap.keyframes_received, 1);
        assert_eq!(snap.dropped_frames, 1);
        assert_eq!(stats.bytes_received(), 150);
    }

    #[test]
    fn test_bitrate() {
        let mut snap = SessionStats {
            bytes_sent: 1_000,
            duration: Duration::from_secs(2),
            ..Default::default()
        };
        snap.calculate_bitrate();
        assert_eq!(snap.bitrate, 4_000);

        let mut empty = SessionStats::default();
        empty.calculate_bitrate();
        assert_eq!(empty.bitrate, 0);
    }
}
