mod common;
mod peer;

pub(crate) use common::{create_webrtc_api, media_kind};
pub use peer::{PeerError, WRTCPeer, parse_offer};
