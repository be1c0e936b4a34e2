//! Receiver side of a recording
//!
//! ```text
//! Transport → TrackReceiver → JitterBuffer → Depacketizer → SharedSink
//! ```
//!
//! Audio tracks skip the jitter buffer and depacketizer.

pub mod jitter_buffer;
pub mod recording;
pub mod track;

pub use recording::{RecordingReport, RecordingSession, SessionError};
pub use track::TransportError;
