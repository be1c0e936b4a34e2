use crate::assets::{
    BUFFER_CAPACITY, HEALTH_LOG_INTERVAL_SECS, HTTP_SERVICE_PORT, MAX_SESSIONS, MAX_WAIT_MS,
};
use anyhow::{Context, anyhow};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// How finished frames are laid out on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    /// H.264 Annex B elementary stream, with Opus audio in a sibling `.ogg`
    AnnexB,
    /// Tagged record stream carrying audio and video, for debugging
    FrameLog,
}

impl ContainerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::AnnexB => "h264",
            ContainerFormat::FrameLog => "frames",
        }
    }
}

impl FromStr for ContainerFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "annexb" | "h264" => Ok(ContainerFormat::AnnexB),
            "framelog" | "frames" => Ok(ContainerFormat::FrameLog),
            other => Err(anyhow!("unknown container format '{}'", other)),
        }
    }
}

/// Settings applied to every track session, fixed at construction
/// (except the wait window, see `TrackSession::set_max_wait_time`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackConfig {
    /// Jitter buffer slots, rounded up to a power of two
    pub buffer_capacity: usize,
    /// Media time to wait for a missing packet before declaring it lost
    pub max_wait: Duration,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: BUFFER_CAPACITY,
            max_wait: Duration::from_millis(MAX_WAIT_MS),
        }
    }
}

pub struct RecorderConfig {
    pub listen: SocketAddr,
    pub output_dir: PathBuf,
    pub format: ContainerFormat,
    pub track: TrackConfig,
    pub max_sessions: usize,
    pub ice_servers: Vec<String>,
    pub health_log_interval: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        RecorderConfig {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), HTTP_SERVICE_PORT),
            output_dir: PathBuf::from("."),
            format: ContainerFormat::AnnexB,
            track: TrackConfig::default(),
            max_sessions: MAX_SESSIONS,
            ice_servers: Vec::new(),
            health_log_interval: Duration::from_secs(HEALTH_LOG_INTERVAL_SECS),
        }
    }
}

impl RecorderConfig {
    pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        let mut config = RecorderConfig::default();

        if let Some(listen) = matches.get_one::<String>("listen") {
            config.listen = listen
                .parse()
                .with_context(|| format!("invalid listen address '{}'", listen))?;
        }
        if let Some(dir) = matches.get_one::<PathBuf>("output-dir") {
            config.output_dir = dir.clone();
        }
        if let Some(format) = matches.get_one::<String>("format") {
            config.format = format.parse()?;
        }
        if let Some(capacity) = matches.get_one::<usize>("buffer-capacity") {
            config.track.buffer_capacity = *capacity;
        }
        if let Some(ms) = matches.get_one::<u64>("max-wait-ms") {
            config.track.max_wait = Duration::from_millis(*ms);
        }
        if let Some(max) = matches.get_one::<usize>("max-sessions") {
            config.max_sessions = *max;
        }
        if let Some(servers) = matches.get_many::<String>("ice-server") {
            config.ice_servers = servers.cloned().collect();
        }
        if let Some(secs) = matches.get_one::<u64>("health-interval-secs") {
            config.health_log_interval = Duration::from_secs((*secs).max(1));
        }

        Ok(config)
    }
}

pub fn command() -> Command {
    Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDR")
                .help("Address of the HTTP signaling endpoint."),
        )
        .arg(
            Arg::new("output-dir")
                .short('o')
                .long("output-dir")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Directory recordings are written to."),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FORMAT")
                .help("Recording layout: annexb (.h264 plus .ogg audio) or framelog (debug)."),
        )
        .arg(
            Arg::new("buffer-capacity")
                .long("buffer-capacity")
                .value_name("PACKETS")
                .value_parser(value_parser!(usize))
                .help("Jitter buffer slots per track."),
        )
        .arg(
            Arg::new("max-wait-ms")
                .long("max-wait-ms")
                .value_name("MS")
                .value_parser(value_parser!(u64))
                .help("Media time to wait for a missing packet before skipping it."),
        )
        .arg(
            Arg::new("max-sessions")
                .long("max-sessions")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .help("Maximum number of concurrent recordings."),
        )
        .arg(
            Arg::new("ice-server")
                .long("ice-server")
                .value_name("URL")
                .action(ArgAction::Append)
                .help("STUN/TURN server URL, may be repeated."),
        )
        .arg(
            Arg::new("health-interval-secs")
                .long("health-interval-secs")
                .value_name("SECS")
                .value_parser(value_parser!(u64))
                .help("Interval between track health reports."),
        )
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let matches = command().try_get_matches_from(["rtc-recorder"]).unwrap();
        let config = RecorderConfig::from_matches(&matches).unwrap();

        assert_eq!(config.listen.port(), HTTP_SERVICE_PORT);
        assert_eq!(config.format, ContainerFormat::AnnexB);
        assert_eq!(config.track, TrackConfig::default());
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn test_overrides() {
        let matches = command()
            .try_get_matches_from([
                "rtc-recorder",
                "--listen",
                "127.0.0.1:9000",
                "--format",
                "framelog",
                "--buffer-capacity",
                "64",
                "--max-wait-ms",
                "0",
                "--ice-server",
                "stun:a.example:3478",
                "--ice-server",
                "stun:b.example:3478",
            ])
            .unwrap();
        let config = RecorderConfig::from_matches(&matches).unwrap();

        assert_eq!(config.listen, "127.0.0.1:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.format, ContainerFormat::FrameLog);
        assert_eq!(config.track.buffer_capacity, 64);
        assert_eq!(config.track.max_wait, Duration::ZERO);
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn test_invalid_values() {
        let matches = command()
            .try_get_matches_from(["rtc-recorder", "--format", "mkv"])
            .unwrap();
        assert!(RecorderConfig::from_matches(&matches).is_err());

        let matches = command()
            .try_get_matches_from(["rtc-recorder", "--listen", "nowhere"])
            .unwrap();
        assert!(RecorderConfig::from_matches(&matches).is_err());
    }
}
