use crate::utils::net::webrtc::common::create_peer_connection;
use crate::utils::sos::SignalOfStop;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;
use webrtc::api::API;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

static WRTC_PEER_UUID: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc: {0}")]
    WebRTC(#[from] webrtc::Error),
    #[error("no local description after negotiation")]
    NoLocalDescription,
}

/// Parse the SDP of a remote offer
pub fn parse_offer(sdp: String) -> Result<RTCSessionDescription, PeerError> {
    Ok(RTCSessionDescription::offer(sdp)?)
}

/// Whether the connection can no longer carry media.
/// `Disconnected` is transient and may return to `Connected`.
fn ends_connection(state: RTCPeerConnectionState) -> bool {
    matches!(state, RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed)
}

/// One remote publisher
pub struct WRTCPeer {
    connection: Arc<RTCPeerConnection>,
    online: Arc<AtomicBool>,
    id: u32,
    /// fires once the connection is gone
    sos: SignalOfStop,
}

impl WRTCPeer {
    pub async fn new(api: &API, ice_servers: &[String]) -> Result<WRTCPeer, PeerError> {
        let connection = create_peer_connection(api, ice_servers).await?;
        let id = WRTC_PEER_UUID.fetch_add(1, Ordering::Relaxed);
        let online = Arc::new(AtomicBool::new(true));
        let sos = SignalOfStop::new();

        let online_clone = Arc::clone(&online);
        let sos_clone = sos.clone();
        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                info!("Peer {}: connection state changed to {}", id, state);
                if ends_connection(state) {
                    online_clone.store(false, Ordering::Relaxed);
                    sos_clone.cancel();
                } else if state == RTCPeerConnectionState::Disconnected {
                    // ICE may still recover
                    warn!("Peer {}: connectivity lost, waiting for recovery", id);
                }
                Box::pin(async {})
            },
        ));

        debug!("Peer {}: created", id);

        Ok(WRTCPeer {
            connection,
            online,
            id,
            sos,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn get_connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.connection)
    }

    /// Shared flag cleared when the connection goes away
    pub fn online_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.online)
    }

    /// Resolves once the connection failed or was closed.
    pub async fn wait_disconnected(&self) {
        self.sos.wait_cancellation().await
    }

    /// Apply a remote offer and return the answer SDP, candidates included.
    pub async fn accept_offer(&self, offer: RTCSessionDescription) -> Result<String, PeerError> {
        self.connection.set_remote_description(offer).await?;

        let answer = self.connection.create_answer(None).await?;

        // Block until ICE gathering is complete, disabling trickle ICE:
        // the publish request carries a single exchange
        let mut gather_complete = self.connection.gathering_complete_promise().await;
        self.connection.set_local_description(answer).await?;
        let _ = gather_complete.recv().await;

        let local = self
            .connection
            .local_description()
            .await
            .ok_or(PeerError::NoLocalDescription)?;

        Ok(local.sdp)
    }

    pub async fn disconnect(&self) {
        if self.online.swap(false, Ordering::Relaxed) {
            info!("Peer {}: disconnecting", self.id);
        }
        self.sos.cancel();
        if let Err(e) = self.connection.close().await {
            warn!("Peer {}: close failed: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offer_rejects_garbage() {
        assert!(parse_offer("not an sdp".to_string()).is_err());
    }

    #[test]
    fn test_only_failed_or_closed_end_connection() {
        assert!(ends_connection(RTCPeerConnectionState::Failed));
        assert!(ends_connection(RTCPeerConnectionState::Closed));

        assert!(!ends_connection(RTCPeerConnectionState::Disconnected));
        assert!(!ends_connection(RTCPeerConnectionState::New));
        assert!(!ends_connection(RTCPeerConnectionState::Connecting));
        assert!(!ends_connection(RTCPeerConnectionState::Connected));
    }
}
