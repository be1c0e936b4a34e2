//! Recording output
//!
//! Every track of a recording writes into one sink. `SharedSink` serializes
//! those writes behind a single mutex and closes the underlying sink exactly
//! once, when the last `SinkHandle` is released.

use crate::assets::{AUDIO_CLOCK_RATE, OPUS_CHANNELS, OPUS_PAYLOAD_TYPE};
use crate::config::ContainerFormat;
use crate::pipeline::types::{MediaFrame, MediaKind};
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use webrtc::media::io::Writer;
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;

/// Granule positions 0 and 1 are reserved by the Ogg writer
const OGG_FIRST_POSITION: u32 = 2;

const FRAME_LOG_MAGIC: &[u8; 4] = b"RTCF";
const FRAME_LOG_VERSION: u8 = 1;
const FLAG_KEYFRAME: u8 = 0x01;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("audio write failed: {0}")]
    Media(#[from] webrtc::media::Error),
    #[error("sink already closed")]
    Closed,
    #[error("sink lock poisoned")]
    Poisoned,
}

/// Persists finished frames
pub trait FrameSink: Send {
    /// Store one frame. Calls arrive in the order frames were produced.
    fn write_frame(&mut self, frame: &MediaFrame) -> Result<(), SinkError>;

    /// Flush and release the underlying resource.
    fn close(&mut self) -> Result<(), SinkError>;
}

/// File-backed sink
///
/// In Annex B mode video goes to the file itself and Opus audio to an Ogg
/// file with the same stem, opened on the first audio frame. The frame log
/// keeps both kinds in one file and is meant for debugging.
pub struct FileSink {
    path: PathBuf,
    format: ContainerFormat,
    writer: Option<BufWriter<File>>,
    audio: Option<OggAudio>,
    frames_written: u64,
    frames_skipped: u64,
}

impl FileSink {
    pub fn create(path: impl AsRef<Path>, format: ContainerFormat) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| SinkError::Open {
            path: path.clone(),
            source,
        })?;
        let mut writer = BufWriter::new(file);

        if format == ContainerFormat::FrameLog {
            writer.write_all(FRAME_LOG_MAGIC)?;
            writer.write_all(&[FRAME_LOG_VERSION])?;
        }

        info!("FileSink: recording to {}", path.display());

        Ok(FileSink {
            path,
            format,
            writer: Some(writer),
            audio: None,
            frames_written: 0,
            frames_skipped: 0,
        })
    }
}

impl FrameSink for FileSink {
    fn write_frame(&mut self, frame: &MediaFrame) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;

        match self.format {
            ContainerFormat::AnnexB if frame.kind == MediaKind::Video => {
                // access units already carry their start codes
                writer.write_all(&frame.data)?;
            }
            ContainerFormat::AnnexB => {
                let audio = match self.audio.take() {
                    Some(audio) => audio,
                    None => OggAudio::create(self.path.with_extension("ogg"))?,
                };
                if !self.audio.insert(audio).write(frame)? {
                    self.frames_skipped += 1;
                    return Ok(());
                }
            }
            ContainerFormat::FrameLog => {
                writer.write_all(&encode_record(frame))?;
            }
        }

        self.frames_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            let audio = self.audio.take().map(OggAudio::close).transpose();
            writer.flush()?;
            if let Some(path) = audio? {
                info!("FileSink: closed {}", path.display());
            }
            info!(
                "FileSink: closed {} ({} frames written, {} skipped)",
                self.path.display(),
                self.frames_written,
                self.frames_skipped
            );
        }
        Ok(())
    }
}

/// Opus audio stored as Ogg pages
struct OggAudio {
    path: PathBuf,
    writer: OggWriter<BufWriter<File>>,
    last_timestamp: Option<u32>,
    /// Timeline handed to the writer, which requires it to only move forward
    position: u32,
    sequence_number: u16,
}

impl OggAudio {
    fn create(path: PathBuf) -> Result<Self, SinkError> {
        let file = File::create(&path).map_err(|source| SinkError::Open {
            path: path.clone(),
            source,
        })?;
        let writer = OggWriter::new(BufWriter::new(file), AUDIO_CLOCK_RATE, OPUS_CHANNELS as u8)?;

        info!("FileSink: recording audio to {}", path.display());

        Ok(OggAudio {
            path,
            writer,
            last_timestamp: None,
            position: OGG_FIRST_POSITION,
            sequence_number: 0,
        })
    }

    /// Append one Opus packet. Returns false when the frame does not move
    /// the audio forward (duplicate, reordered or past the 32-bit timeline).
    fn write(&mut self, frame: &MediaFrame) -> Result<bool, SinkError> {
        let advance = match self.last_timestamp {
            None => 0,
            Some(last) => {
                let advance = frame.timestamp.wrapping_sub(last);
                if advance == 0 || advance >= 1 << 31 {
                    return Ok(false);
                }
                advance
            }
        };
        let Some(position) = self.position.checked_add(advance) else {
            return Ok(false);
        };

        let packet = Packet {
            header: Header {
                version: 2,
                payload_type: OPUS_PAYLOAD_TYPE,
                sequence_number: self.sequence_number,
                timestamp: position,
                ..Default::default()
            },
            payload: frame.data.clone(),
        };
        self.writer.write_rtp(&packet)?;

        self.last_timestamp = Some(frame.timestamp);
        self.position = position;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        Ok(true)
    }

    fn close(mut self) -> Result<PathBuf, SinkError> {
        self.writer.close()?;
        Ok(self.path)
    }
}

/// `record-<id>-<yyyymmdd-HHMMSS>.<ext>`, stamped in UTC
pub fn recording_file_name(id: u64, format: ContainerFormat, started: DateTime<Utc>) -> String {
    format!(
        "record-{}-{}.{}",
        id,
        started.format("%Y%m%d-%H%M%S"),
        format.extension()
    )
}

/// `kind:u8 | flags:u8 | timestamp:u32be | len:u32be | data`
fn encode_record(frame: &MediaFrame) -> BytesMut {
    let mut record = BytesMut::with_capacity(10 + frame.size());
    record.put_u8(match frame.kind {
        MediaKind::Audio => 0,
        MediaKind::Video => 1,
    });
    record.put_u8(if frame.is_keyframe { FLAG_KEYFRAME } else { 0 });
    record.put_u32(frame.timestamp);
    record.put_u32(frame.size() as u32);
    record.put_slice(&frame.data);
    record
}

struct SinkSlot {
    sink: Box<dyn FrameSink>,
    attached: usize,
    closed: bool,
}

/// A sink shared by all tracks of one recording
#[derive(Clone)]
pub struct SharedSink {
    slot: Arc<Mutex<SinkSlot>>,
}

impl SharedSink {
    pub fn new(sink: impl FrameSink + 'static) -> Self {
        SharedSink {
            slot: Arc::new(Mutex::new(SinkSlot {
                sink: Box::new(sink),
                attached: 0,
                closed: false,
            })),
        }
    }

    /// Acquire a handle. The sink stays open while any handle is attached.
    pub fn attach(&self) -> Result<SinkHandle, SinkError> {
        let mut slot = self.slot.lock().map_err(|_| SinkError::Poisoned)?;
        if slot.closed {
            return Err(SinkError::Closed);
        }
        slot.attached += 1;

        Ok(SinkHandle {
            slot: Arc::clone(&self.slot),
            released: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().map(|slot| slot.closed).unwrap_or(true)
    }
}

/// Scoped access to a `SharedSink`; released on `release()` or drop.
pub struct SinkHandle {
    slot: Arc<Mutex<SinkSlot>>,
    released: bool,
}

impl SinkHandle {
    pub fn write(&self, frame: &MediaFrame) -> Result<(), SinkError> {
        if self.released {
            return Err(SinkError::Closed);
        }
        let mut slot = self.slot.lock().map_err(|_| SinkError::Poisoned)?;
        if slot.closed {
            return Err(SinkError::Closed);
        }
        slot.sink.write_frame(frame)
    }

    /// Detach from the sink, closing it if this was the last handle.
    /// Calling it again is a no-op.
    pub fn release(&mut self) -> Result<(), SinkError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut slot = self.slot.lock().map_err(|_| SinkError::Poisoned)?;
        slot.attached = slot.attached.saturating_sub(1);
        if slot.attached == 0 && !slot.closed {
            slot.closed = true;
            debug!("SharedSink: last handle released, closing");
            slot.sink.close()?;
        }
        Ok(())
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("SinkHandle: closing sink failed: {}", e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemorySink;
    use super::*;
    use bytes::Bytes;

    fn temp_path(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("rtc-recorder-{}-{}-{}", std::process::id(), nanos, name))
    }

    #[test]
    fn test_shared_sink_closes_once() {
        let memory = MemorySink::default();
        let shared = SharedSink::new(memory.clone());

        let mut video = shared.attach().unwrap();
        let audio = shared.attach().unwrap();

        video
            .write(&MediaFrame::video(Bytes::from_static(&[0, 0, 0, 1, 0x65]), 1, true))
            .unwrap();

        video.release().unwrap();
        video.release().unwrap();
        assert_eq!(memory.closes(), 0);
        assert!(video.write(&MediaFrame::audio(Bytes::from_static(&[1]), 1)).is_err());

        drop(audio);
        assert_eq!(memory.closes(), 1);
        assert!(shared.is_closed());
        assert!(matches!(shared.attach(), Err(SinkError::Closed)));
        assert_eq!(memory.frames().len(), 1);
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    #[test]
    fn test_annexb_file_holds_video_stream() {
        let path = temp_path("annexb.h264");
        let mut sink = FileSink::create(&path, ContainerFormat::AnnexB).unwrap();

        sink.write_frame(&MediaFrame::video(Bytes::from_static(&[0, 0, 0, 1, 0x65, 7]), 0, true))
            .unwrap();
        sink.write_frame(&MediaFrame::video(Bytes::from_static(&[0, 0, 0, 1, 0x41]), 3000, false))
            .unwrap();
        sink.close().unwrap();
        sink.close().unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, vec![0, 0, 0, 1, 0x65, 7, 0, 0, 0, 1, 0x41]);
        assert!(!path.with_extension("ogg").exists());
        assert!(matches!(
            sink.write_frame(&MediaFrame::audio(Bytes::from_static(&[1]), 0)),
            Err(SinkError::Closed)
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_annexb_audio_goes_to_ogg() {
        let path = temp_path("av.h264");
        let ogg = path.with_extension("ogg");
        let mut sink = FileSink::create(&path, ContainerFormat::AnnexB).unwrap();

        sink.write_frame(&MediaFrame::video(Bytes::from_static(&[0, 0, 0, 1, 0x65]), 0, true))
            .unwrap();
        sink.write_frame(&MediaFrame::audio(Bytes::from_static(&[0xF8, 0xA1, 0xA2]), 960))
            .unwrap();
        sink.write_frame(&MediaFrame::audio(Bytes::from_static(&[0xF8, 0xB1, 0xB2]), 1920))
            .unwrap();
        // reordered and duplicate packets would move the Ogg timeline backwards
        sink.write_frame(&MediaFrame::audio(Bytes::from_static(&[0xF8, 0xC1, 0xC2]), 0))
            .unwrap();
        sink.write_frame(&MediaFrame::audio(Bytes::from_static(&[0xF8, 0xD1, 0xD2]), 1920))
            .unwrap();
        sink.close().unwrap();
        sink.close().unwrap();

        assert_eq!(sink.frames_written, 3);
        assert_eq!(sink.frames_skipped, 2);
        assert_eq!(std::fs::read(&path).unwrap(), vec![0, 0, 0, 1, 0x65]);

        let audio = std::fs::read(&ogg).unwrap();
        assert!(audio.starts_with(b"OggS"));
        assert!(contains(&audio, b"OpusHead"));
        assert!(contains(&audio, &[0xF8, 0xA1, 0xA2]));
        assert!(contains(&audio, &[0xF8, 0xB1, 0xB2]));
        assert!(!contains(&audio, &[0xF8, 0xC1, 0xC2]));
        assert!(!contains(&audio, &[0xF8, 0xD1, 0xD2]));
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(&ogg);
    }

    #[test]
    fn test_frame_log_layout() {
        let path = temp_path("log.frames");
        let mut sink = FileSink::create(&path, ContainerFormat::FrameLog).unwrap();

        sink.write_frame(&MediaFrame::video(Bytes::from_static(&[0xAB]), 0x01020304, true))
            .unwrap();
        sink.write_frame(&MediaFrame::audio(Bytes::from_static(&[0xCD, 0xEF]), 960))
            .unwrap();
        sink.close().unwrap();

        let written = std::fs::read(&path).unwrap();
        let mut expected = b"RTCF".to_vec();
        expected.push(1);
        expected.extend([1, 1, 1, 2, 3, 4, 0, 0, 0, 1, 0xAB]);
        expected.extend([0, 0, 0, 0, 3, 0xC0, 0, 0, 0, 2, 0xCD, 0xEF]);
        assert_eq!(written, expected);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_recording_file_name() {
        let started = DateTime::parse_from_rfc3339("2026-03-04T05:06:07Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            recording_file_name(12, ContainerFormat::AnnexB, started),
            "record-12-20260304-050607.h264"
        );
        assert_eq!(
            recording_file_name(3, ContainerFormat::FrameLog, started),
            "record-3-20260304-050607.frames"
        );
    }

    #[test]
    fn test_open_failure_is_reported() {
        let path = temp_path("missing-dir").join("record.h264");
        assert!(matches!(
            FileSink::create(&path, ContainerFormat::AnnexB),
            Err(SinkError::Open { .. })
        ));
    }
}
