// connections
pub const HTTP_SERVICE_PORT: u16 = 8080;
pub const MAX_SESSIONS: usize = 16;

// track clocks, as negotiated for the registered codecs
pub const VIDEO_CLOCK_RATE: u32 = 90_000;
pub const AUDIO_CLOCK_RATE: u32 = 48_000;
pub const H264_PAYLOAD_TYPE: u8 = 102;
pub const OPUS_PAYLOAD_TYPE: u8 = 111;
pub const OPUS_CHANNELS: u16 = 2;

// jitter buffer
pub const BUFFER_CAPACITY: usize = 512;
pub const MAX_WAIT_MS: u64 = 500;

// per-track channel between transport and receive loop
pub const TRACK_CHANNEL_SIZE: usize = 256;

pub const HEALTH_LOG_INTERVAL_SECS: u64 = 30;
pub const STALL_THRESHOLD_SECS: u64 = 5;

pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

// signaling reply codes
pub const REPLY_OK: u32 = 10000;
pub const REPLY_BAD_REQUEST: u32 = 10001;
pub const REPLY_NEGOTIATION_FAILED: u32 = 10002;
pub const REPLY_SESSIONS_EXHAUSTED: u32 = 10003;
