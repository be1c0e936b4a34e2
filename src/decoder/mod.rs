//! Depacketization module
//!
//! Restores frame boundaries and byte order from ordered RTP packets.
//! Nothing here decodes compressed media.

mod depacketizer;

pub use depacketizer::{
    DepacketizeError, Depacketizer, H264Payload, PayloadFormat, contains_nal_type,
};
