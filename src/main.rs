use crate::config::{RecorderConfig, app_name, version};
use crate::utils::net::server::SignalingServer;
use crate::utils::sos::SignalOfStop;
use anyhow::Context;
use log::info;

pub mod assets;
pub mod config;
pub mod decoder;
pub mod pipeline;
pub mod utils;
pub mod workers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = config::command().get_matches();
    let config = RecorderConfig::from_matches(&matches)?;

    let sos = SignalOfStop::new();

    // gracefully close the recordings when receiving SIGINT, SIGTERM, or SIGHUP
    let sos_clone = sos.clone();
    ctrlc::set_handler(move || {
        sos_clone.cancel();
    })
    .context("Error setting Ctrl-C handler")?;

    info!(
        "{} {}: recording {} files to {} (buffer {} packets, max wait {:?})",
        app_name(),
        version(),
        config.format.extension(),
        config.output_dir.display(),
        config.track.buffer_capacity,
        config.track.max_wait
    );

    let server = SignalingServer::new(config)?;
    server.run(sos).await
}
