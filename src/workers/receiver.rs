//! One published stream, recorded to one file

use crate::config::RecorderConfig;
use crate::pipeline::receiver::{RecordingReport, RecordingSession, SessionError, TransportError};
use crate::pipeline::types::RtpPacket;
use crate::utils::net::webrtc::{PeerError, WRTCPeer, media_kind, parse_offer};
use crate::workers::WorkerClose;
use crate::workers::save_stream::{FileSink, SharedSink, SinkError, recording_file_name};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use webrtc::api::API;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_remote::TrackRemote;

/// Time granted to the tracks to drain once the peer is gone
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("negotiation failed: {0}")]
    Peer(#[from] PeerError),
    #[error("cannot create recording: {0}")]
    Sink(#[from] SinkError),
    #[error("cannot create recording: {0}")]
    Session(#[from] SessionError),
}

pub struct StreamReceiver {
    id: u64,
    peer: WRTCPeer,
    recording: Arc<RecordingSession>,
    path: PathBuf,
}

impl StreamReceiver {
    /// Negotiate a publisher's offer and start recording whatever tracks it
    /// sends. Returns the receiver and the answer SDP.
    pub async fn publish(
        id: u64,
        api: &API,
        config: &RecorderConfig,
        offer_sdp: String,
    ) -> Result<(StreamReceiver, String), PublishError> {
        let offer = parse_offer(offer_sdp)?;

        let path = config
            .output_dir
            .join(recording_file_name(id, config.format, Utc::now()));
        let sink = FileSink::create(&path, config.format)?;
        let recording = Arc::new(
            RecordingSession::new(id, config.track.clone(), SharedSink::new(sink))?
                .with_health_interval(config.health_log_interval),
        );

        let peer = match WRTCPeer::new(api, &config.ice_servers).await {
            Ok(peer) => peer,
            Err(e) => {
                discard(&recording, &path).await;
                return Err(e.into());
            }
        };

        let receiver = StreamReceiver {
            id,
            peer,
            recording,
            path,
        };
        receiver.receive_tracks();

        match receiver.peer.accept_offer(offer).await {
            Ok(answer) => {
                info!(
                    "StreamReceiver {}: peer {} recording to {}",
                    id,
                    receiver.peer.id(),
                    receiver.path.display()
                );
                Ok((receiver, answer))
            }
            Err(e) => {
                receiver.peer.disconnect().await;
                discard(&receiver.recording, &receiver.path).await;
                Err(e.into())
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait_disconnected(&self) {
        self.peer.wait_disconnected().await
    }

    /// Disconnect the publisher and close its recording
    pub async fn stop(&self) -> RecordingReport {
        self.peer.disconnect().await;
        self.recording.finish(STOP_GRACE).await
    }

    /// Bind every remote track to a track of the recording
    fn receive_tracks(&self) {
        let recording = Arc::clone(&self.recording);
        let online = self.peer.online_flag();
        let id = self.id;

        self.peer.get_connection().on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let recording = Arc::clone(&recording);
                let online = Arc::clone(&online);

                Box::pin(async move {
                    let Some(kind) = media_kind(track.kind()) else {
                        warn!("StreamReceiver {}: ignoring track of kind {}", id, track.kind());
                        return;
                    };
                    let codec = track.codec();
                    debug!(
                        "StreamReceiver {}: remote {} track {} (ssrc {})",
                        id, codec.capability.mime_type, track.id(), track.ssrc()
                    );

                    let tx = match recording.open_track(kind, codec.capability.clock_rate) {
                        Ok(tx) => tx,
                        Err(e) => {
                            warn!("StreamReceiver {}: {}", id, e);
                            return;
                        }
                    };

                    tokio::spawn(async move {
                        loop {
                            let item = match track.read_rtp().await {
                                Ok((packet, _)) => Ok(RtpPacket::from(packet)),
                                Err(e) if !online.load(Ordering::Relaxed) => {
                                    debug!("StreamReceiver {}: {} track ended ({})", id, kind, e);
                                    break;
                                }
                                Err(e) => Err(TransportError::Read(e.to_string())),
                            };

                            let failed = item.is_err();
                            if tx.send(item).await.is_err() || failed {
                                break;
                            }
                        }
                    });
                })
            },
        ));
    }
}

#[async_trait]
impl WorkerClose for StreamReceiver {
    async fn close(&self) {
        let report = self.stop().await;
        info!("StreamReceiver {}: {} closed", self.id, self.path.display());
        for track in &report.tracks {
            match &track.error {
                Some(e) => warn!("StreamReceiver {}: {} track failed: {}", self.id, track.kind, e),
                None => info!("StreamReceiver {}: {} track {}", self.id, track.kind, track.summary),
            }
        }
    }
}

/// Drop a recording that never received anything
async fn discard(recording: &RecordingSession, path: &Path) {
    recording.close().await;
    if let Err(e) = std::fs::remove_file(path) {
        debug!("StreamReceiver: cannot remove {}: {}", path.display(), e);
    }
}
