//! Media pipeline for recorded tracks
//!
//! Each track of a recording runs as its own stage:
//! - Control: the track state machine and its receive loop
//! - Data: packets arrive over a bounded channel, frames leave through the sink
//! - Health: per-track counters, logged periodically by the recording

pub mod health;
pub mod receiver;
pub mod stage;
pub mod state;
pub mod types;

pub use stage::PipelineStage;
