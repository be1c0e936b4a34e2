use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use thiserror::Error;

use crate::assets::START_CODE;
use crate::pipeline::types::RtpPacket;

/// Why a payload could not be unwrapped
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DepacketizeError {
    #[error("empty payload")]
    EmptyPayload,
    #[error("truncated {0} payload")]
    Truncated(&'static str),
    #[error("FU-A fragment without a start fragment")]
    MissingFragmentStart,
    #[error("unsupported NAL unit type {0}")]
    UnsupportedNalType(u8),
}

/// Format-specific step that turns one packet payload back into
/// container-ready bytes.
pub trait PayloadFormat: Send {
    /// Append the bytes carried by `payload` to `out`.
    /// Nothing is appended when an error is returned.
    fn unwrap_into(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<(), DepacketizeError>;

    /// Forget any state carried between payloads.
    fn reset(&mut self);
}

/// Reassembles H.264 NAL units from RTP payloads (RFC 6184)
/// into Annex B byte streams.
#[derive(Default)]
pub struct H264Payload {
    /// FU-A fragments collected so far, NAL header first
    fua: BytesMut,
    in_fua_fragment: bool,
}

impl H264Payload {
    pub fn new() -> Self {
        Self::default()
    }

    fn unwrap_fua(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<(), DepacketizeError> {
        if payload.len() < 2 {
            return Err(DepacketizeError::Truncated("FU-A"));
        }
        let fu_indicator = payload[0];
        let fu_header = payload[1];
        let start = (fu_header & 0x80) != 0;
        let end = (fu_header & 0x40) != 0;

        if start {
            if self.in_fua_fragment {
                // Previous fragment was incomplete (lost end packet)
                warn!("FU-A: new start while previous fragment incomplete, discarding it");
                self.fua.clear();
            }
            self.in_fua_fragment = true;
            // NRI from indicator, type from FU header
            self.fua.put_u8((fu_indicator & 0xE0) | (fu_header & 0x1F));
        } else if !self.in_fua_fragment {
            return Err(DepacketizeError::MissingFragmentStart);
        }

        self.fua.put_slice(&payload[2..]);

        if end {
            self.in_fua_fragment = false;
            out.put_slice(&START_CODE);
            out.put_slice(&self.fua.split());
        }

        Ok(())
    }
}

impl PayloadFormat for H264Payload {
    fn unwrap_into(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<(), DepacketizeError> {
        let Some(&header) = payload.first() else {
            return Err(DepacketizeError::EmptyPayload);
        };

        match header & 0x1F {
            // Single NAL unit (types 1-23)
            1..=23 => {
                out.put_slice(&START_CODE);
                out.put_slice(payload);
                Ok(())
            }
            // STAP-A (type 24)
            24 => {
                let nalus = split_stap_a(&payload[1..])?;
                for nalu in nalus {
                    out.put_slice(&START_CODE);
                    out.put_slice(nalu);
                }
                Ok(())
            }
            // FU-A (type 28)
            28 => self.unwrap_fua(payload, out),
            nal_type => Err(DepacketizeError::UnsupportedNalType(nal_type)),
        }
    }

    fn reset(&mut self) {
        self.fua.clear();
        self.in_fua_fragment = false;
    }
}

/// Split the body of a STAP-A packet into its NAL units.
/// Fails without yielding anything if a length field overruns the payload.
fn split_stap_a(mut body: &[u8]) -> Result<Vec<&[u8]>, DepacketizeError> {
    let mut nalus = Vec::new();
    while !body.is_empty() {
        if body.len() < 2 {
            return Err(DepacketizeError::Truncated("STAP-A"));
        }
        let nalu_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let rest = &body[2..];
        if nalu_len == 0 || nalu_len > rest.len() {
            return Err(DepacketizeError::Truncated("STAP-A"));
        }
        let (nalu, next) = rest.split_at(nalu_len);
        nalus.push(nalu);
        body = next;
    }
    if nalus.is_empty() {
        return Err(DepacketizeError::Truncated("STAP-A"));
    }
    Ok(nalus)
}

/// Accumulates the fragments of one frame.
///
/// All bytes in the accumulator share one timestamp. A packet carrying a
/// different timestamp starts a new frame and discards whatever was
/// collected, so a frame that lost its final fragment is dropped instead of
/// being emitted truncated. The marker bit closes the frame.
pub struct Depacketizer<F: PayloadFormat> {
    format: F,
    frame: BytesMut,
    frame_timestamp: Option<u32>,
    frames_emitted: u64,
    partial_frames_dropped: u64,
    malformed_fragments: u64,
}

impl<F: PayloadFormat> Depacketizer<F> {
    pub fn new(format: F) -> Self {
        Self {
            format,
            frame: BytesMut::new(),
            frame_timestamp: None,
            frames_emitted: 0,
            partial_frames_dropped: 0,
            malformed_fragments: 0,
        }
    }

    /// Feed one packet in sequence order.
    /// Returns the frame bytes and their timestamp once the marker is seen.
    pub fn add_fragment(&mut self, packet: &RtpPacket) -> Option<(Bytes, u32)> {
        if self.frame_timestamp != Some(packet.timestamp) {
            if !self.frame.is_empty() {
                self.partial_frames_dropped += 1;
                debug!(
                    "Depacketizer: dropping partial frame {:?} ({} bytes)",
                    self.frame_timestamp,
                    self.frame.len()
                );
            }
            self.frame.clear();
            self.format.reset();
            self.frame_timestamp = Some(packet.timestamp);
        }

        if let Err(e) = self.format.unwrap_into(&packet.payload, &mut self.frame) {
            self.malformed_fragments += 1;
            warn!(
                "Depacketizer: skipping fragment seq {}: {}",
                packet.sequence_number, e
            );
        }

        if !packet.marker {
            return None;
        }

        self.format.reset();

        if self.frame.is_empty() {
            return None;
        }

        self.frames_emitted += 1;
        Some((self.frame.split().freeze(), packet.timestamp))
    }

    /// Discard the frame in progress.
    pub fn reset(&mut self) {
        if !self.frame.is_empty() {
            self.partial_frames_dropped += 1;
        }
        self.frame.clear();
        self.format.reset();
        self.frame_timestamp = None;
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn partial_frames_dropped(&self) -> u64 {
        self.partial_frames_dropped
    }

    pub fn malformed_fragments(&self) -> u64 {
        self.malformed_fragments
    }
}

/// Scan Annex B data for a NAL unit with the given type.
pub fn contains_nal_type(data: &[u8], target_type: u8) -> bool {
    let mut i = 0;
    while i + 4 < data.len() {
        if data[i..i + 4] == START_CODE {
            if (data[i + 4] & 0x1F) == target_type {
                return true;
            }
            i += 4;
        } else {
            i += 1;
        }
    }
    false
}
