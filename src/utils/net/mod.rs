pub mod server;
pub mod webrtc;
