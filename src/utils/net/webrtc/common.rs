use crate::assets::{
    AUDIO_CLOCK_RATE, H264_PAYLOAD_TYPE, OPUS_CHANNELS, OPUS_PAYLOAD_TYPE, VIDEO_CLOCK_RATE,
};
use crate::pipeline::types::{MediaKind, RtpPacket};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

/// Media engine accepting exactly the codecs the recorder can store:
/// H.264 (packetization-mode=1) and Opus.
pub(crate) fn create_webrtc_api() -> Result<Arc<API>, webrtc::Error> {
    let mut media_engine = MediaEngine::default();

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: VIDEO_CLOCK_RATE,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: H264_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: OPUS_CHANNELS,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: OPUS_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    Ok(Arc::new(api))
}

/// Receive-only peer connection with one audio and one video transceiver
pub(crate) async fn create_peer_connection(
    api: &API,
    ice_servers: &[String],
) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let config = RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };

    let peer_connection = api.new_peer_connection(config).await?;

    for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
        peer_connection
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
    }

    Ok(Arc::new(peer_connection))
}

pub(crate) fn media_kind(codec_type: RTPCodecType) -> Option<MediaKind> {
    match codec_type {
        RTPCodecType::Video => Some(MediaKind::Video),
        RTPCodecType::Audio => Some(MediaKind::Audio),
        _ => None,
    }
}

impl From<Packet> for RtpPacket {
    fn from(packet: Packet) -> Self {
        RtpPacket {
            sequence_number: packet.header.sequence_number,
            timestamp: packet.header.timestamp,
            marker: packet.header.marker,
            payload: packet.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use webrtc::rtp::header::Header;

    #[test]
    fn test_packet_conversion() {
        let packet = Packet {
            header: Header {
                sequence_number: 65535,
                timestamp: 90_000,
                marker: true,
                payload_type: H264_PAYLOAD_TYPE,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x65, 1, 2]),
        };

        let converted = RtpPacket::from(packet);
        assert_eq!(converted.sequence_number, 65535);
        assert_eq!(converted.timestamp, 90_000);
        assert!(converted.marker);
        assert_eq!(&converted.payload[..], &[0x65, 1, 2]);
    }

    #[test]
    fn test_media_kind() {
        assert_eq!(media_kind(RTPCodecType::Video), Some(MediaKind::Video));
        assert_eq!(media_kind(RTPCodecType::Audio), Some(MediaKind::Audio));
        assert_eq!(media_kind(RTPCodecType::Unspecified), None);
    }

    #[test]
    fn test_api_builds() {
        assert!(create_webrtc_api().is_ok());
    }
}
