//! Track session and its receive loop
//!
//! A `TrackSession` owns everything one media track needs between the
//! transport and the sink. Video packets pass through a jitter buffer and an
//! H.264 depacketizer; audio packets are forwarded to the sink as they
//! arrive, one frame per packet.
//!
//! `TrackReceiver` drives a session from its own task: transport items come
//! in over an owned channel, and every exit path closes the session once.

use crate::config::TrackConfig;
use crate::decoder::{Depacketizer, H264Payload, contains_nal_type};
use crate::pipeline::PipelineStage;
use crate::pipeline::health::TrackHealth;
use crate::pipeline::receiver::jitter_buffer::JitterBuffer;
use crate::pipeline::state::TrackState;
use crate::pipeline::types::{MediaFrame, MediaKind, RtpPacket};
use crate::utils::sos::SignalOfStop;
use crate::workers::save_stream::{SinkError, SinkHandle};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// NAL unit type of an IDR slice
const NAL_IDR: u8 = 5;

/// Hard failure reported by the transport, as opposed to end-of-stream
/// (which is the channel closing)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("read failed: {0}")]
    Read(String),
}

/// What the transport delivers into a track's channel
pub type TransportItem = Result<RtpPacket, TransportError>;

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("{0} track is closed")]
    Closed(MediaKind),
    #[error("{kind} track sink failed: {source}")]
    Sink {
        kind: MediaKind,
        #[source]
        source: SinkError,
    },
    #[error("{kind} track transport failed: {source}")]
    Transport {
        kind: MediaKind,
        #[source]
        source: TransportError,
    },
}

enum TrackPath {
    Video {
        jitter: JitterBuffer,
        depacketizer: Depacketizer<H264Payload>,
    },
    /// no reordering or reassembly for audio
    Audio,
}

pub struct TrackSession {
    kind: MediaKind,
    clock_rate: u32,
    state: TrackState,
    path: TrackPath,
    sink: SinkHandle,
    health: Arc<TrackHealth>,
}

impl TrackSession {
    pub fn new(kind: MediaKind, clock_rate: u32, config: &TrackConfig, sink: SinkHandle) -> Self {
        let path = match kind {
            MediaKind::Video => {
                let jitter = JitterBuffer::new(config.buffer_capacity, clock_rate, config.max_wait);
                debug!(
                    "{} track: {} buffer slots, max wait {:?}",
                    kind,
                    jitter.capacity(),
                    jitter.max_wait_time()
                );
                TrackPath::Video {
                    jitter,
                    depacketizer: Depacketizer::new(H264Payload::new()),
                }
            }
            MediaKind::Audio => TrackPath::Audio,
        };

        Self {
            kind,
            clock_rate,
            state: TrackState::Idle,
            path,
            sink,
            health: Arc::new(TrackHealth::new()),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn health(&self) -> Arc<TrackHealth> {
        Arc::clone(&self.health)
    }

    /// Buffer, reorder and reassemble one packet, forwarding every frame it
    /// completes to the sink in the order produced.
    pub fn push_packet(&mut self, packet: RtpPacket) -> Result<(), TrackError> {
        if self.state.is_closed() {
            return Err(TrackError::Closed(self.kind));
        }

        if !self.state.is_receiving() {
            info!(
                "{} track: first packet (seq: {}, clock: {} Hz)",
                self.kind, packet.sequence_number, self.clock_rate
            );
            self.transition(TrackState::Receiving {
                started_at: Instant::now(),
            });
        }

        self.health.record_packet();

        match &mut self.path {
            TrackPath::Video {
                jitter,
                depacketizer,
            } => {
                jitter.add(packet);

                let mut result = Ok(());
                for ordered in jitter.get_ordered() {
                    if let Some((data, timestamp)) = depacketizer.add_fragment(&ordered) {
                        let is_keyframe = contains_nal_type(&data, NAL_IDR);
                        let frame = MediaFrame::video(data, timestamp, is_keyframe);
                        result = write_frame(&self.sink, &self.health, &frame);
                        if result.is_err() {
                            break;
                        }
                    }
                }

                self.health.update_losses(
                    jitter.packets_lost(),
                    jitter.packets_late(),
                    depacketizer.partial_frames_dropped(),
                    depacketizer.malformed_fragments(),
                );

                result.map_err(|source| TrackError::Sink {
                    kind: self.kind,
                    source,
                })
            }
            TrackPath::Audio => {
                let frame = MediaFrame::audio(packet.payload, packet.timestamp);
                write_frame(&self.sink, &self.health, &frame).map_err(|source| {
                    TrackError::Sink {
                        kind: self.kind,
                        source,
                    }
                })
            }
        }
    }

    /// Change the loss tolerance window of the jitter buffer
    pub fn set_max_wait_time(&mut self, max_wait: Duration) {
        if let TrackPath::Video { jitter, .. } = &mut self.path {
            debug!("{} track: max wait set to {:?}", self.kind, max_wait);
            jitter.set_max_wait_time(max_wait);
        }
    }

    /// Discard any frame in progress and release the sink.
    /// Only the first call has an effect.
    pub fn close(&mut self) -> Result<(), TrackError> {
        if self.state.is_closed() {
            return Ok(());
        }
        let received_for = self.state.receiving_duration().unwrap_or_default();
        self.transition(TrackState::Closed);

        if let TrackPath::Video {
            jitter,
            depacketizer,
        } = &mut self.path
        {
            depacketizer.reset();
            debug!(
                "{} track: {} frames assembled from {} packets ({} duplicate, {} overwritten, {} unreleased)",
                self.kind,
                depacketizer.frames_emitted(),
                jitter.packets_received(),
                jitter.packets_duplicate(),
                jitter.packets_overwritten(),
                jitter.buffered()
            );
            self.health.update_losses(
                jitter.packets_lost(),
                jitter.packets_late(),
                depacketizer.partial_frames_dropped(),
                depacketizer.malformed_fragments(),
            );
            jitter.reset();
        }

        info!(
            "{} track: closed after {:?} ({})",
            self.kind,
            received_for,
            self.health.summary()
        );

        self.sink.release().map_err(|source| TrackError::Sink {
            kind: self.kind,
            source,
        })
    }

    fn transition(&mut self, next: TrackState) {
        if self.state.can_transition_to(&next) {
            self.state = next;
        } else {
            warn!("{} track: invalid transition {} -> {}", self.kind, self.state, next);
        }
    }
}

fn write_frame(
    sink: &SinkHandle,
    health: &TrackHealth,
    frame: &MediaFrame,
) -> Result<(), SinkError> {
    sink.write(frame)?;
    health.record_frame(frame.size(), frame.is_keyframe);
    Ok(())
}

/// Receive loop of one track
pub struct TrackReceiver {
    session: TrackSession,
    input: Option<mpsc::Receiver<TransportItem>>,
    max_wait: watch::Receiver<Duration>,
    sos: SignalOfStop,
}

impl TrackReceiver {
    pub fn new(
        session: TrackSession,
        input: mpsc::Receiver<TransportItem>,
        max_wait: watch::Receiver<Duration>,
        sos: SignalOfStop,
    ) -> Self {
        Self {
            session,
            input: Some(input),
            max_wait,
            sos,
        }
    }

    async fn receive(
        &mut self,
        mut input: mpsc::Receiver<TransportItem>,
    ) -> Result<(), TrackError> {
        let kind = self.session.kind();
        let session = &mut self.session;
        let max_wait = &mut self.max_wait;
        let sos = &self.sos;

        loop {
            tokio::select! {
                biased;
                _ = sos.wait_cancellation() => {
                    info!("TrackReceiver[{}]: shutdown requested", kind);
                    return Ok(());
                }
                Ok(()) = max_wait.changed() => {
                    let value = *max_wait.borrow_and_update();
                    session.set_max_wait_time(value);
                }
                item = input.recv() => match item {
                    Some(Ok(packet)) => session.push_packet(packet)?,
                    Some(Err(source)) => return Err(TrackError::Transport { kind, source }),
                    None => {
                        info!("TrackReceiver[{}]: end of stream", kind);
                        return Ok(());
                    }
                },
            }
        }
    }
}

#[async_trait]
impl PipelineStage for TrackReceiver {
    async fn run(&mut self) -> Result<()> {
        let input = self
            .input
            .take()
            .ok_or_else(|| anyhow!("No input channel"))?;

        info!("TrackReceiver[{}]: started", self.session.kind());

        let outcome = self.receive(input).await;
        // closed on every path, errors included
        let closed = self.shutdown().await;

        outcome?;
        closed
    }

    fn name(&self) -> &'static str {
        "TrackReceiver"
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.session.close()?;
        Ok(())
    }
}
