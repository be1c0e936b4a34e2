//! Core types for the pipeline system

use bytes::Bytes;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Video access units
    Video,
    /// Audio packets
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Video => write!(f, "Video"),
            MediaKind::Audio => write!(f, "Audio"),
        }
    }
}

/// One RTP packet as delivered by the transport
///
/// Immutable once received. `sequence_number` wraps modulo 2^16 and
/// `timestamp` modulo 2^32; the timestamp is expressed in ticks of the
/// track clock and is shared by every packet of the same frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub sequence_number: u16,
    pub timestamp: u32,
    /// Set on the last packet of a frame
    pub marker: bool,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(
        sequence_number: u16,
        timestamp: u32,
        marker: bool,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            sequence_number,
            timestamp,
            marker,
            payload: payload.into(),
        }
    }
}

/// A complete application-layer frame ready for the sink
#[derive(Clone, PartialEq, Eq)]
pub struct MediaFrame {
    /// Kind of the track that produced the frame
    pub kind: MediaKind,

    /// Capture timestamp in track clock ticks
    pub timestamp: u32,

    /// Frame bytes (Annex B for video, raw payload for audio)
    pub data: Bytes,

    /// Whether the frame holds an IDR picture (video only)
    pub is_keyframe: bool,
}

impl MediaFrame {
    /// Create a new video frame
    pub fn video(data: Bytes, timestamp: u32, is_keyframe: bool) -> Self {
        Self {
            kind: MediaKind::Video,
            timestamp,
            data,
            is_keyframe,
        }
    }

    /// Create a new audio frame
    pub fn audio(data: Bytes, timestamp: u32) -> Self {
        Self {
            kind: MediaKind::Audio,
            timestamp,
            data,
            is_keyframe: false,
        }
    }

    /// Get the size of the frame data in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for MediaFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaFrame")
            .field("kind", &self.kind)
            .field("timestamp", &self.timestamp)
            .field("is_keyframe", &self.is_keyframe)
            .field("size", &self.size())
            .finish()
    }
}
