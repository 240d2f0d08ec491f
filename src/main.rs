mod args;
mod commands;

use args::{Command, Settings};
use collabshare::core::config::LOG_FILE_NAME;
use collabshare::utils::data_dir;
use collabshare::utils::log_file::FileLogLayer;
use collabshare::utils::sos::SignalOfStop;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load();

    // Must happen before any persistence access.
    data_dir::init(settings.conf.as_deref())?;

    // webrtc_ice reports late STUN responses as warnings; they are harmless.
    let filter = match settings.verbose {
        0 => "warn,collabshare=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let log_path = data_dir::logs_dir()?.join(LOG_FILE_NAME);
    let file_layer = FileLogLayer::new(&log_path)?;

    // stdout carries command output; logs go to stderr and the file.
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match settings.command.clone() {
        Command::Run { invite, join } => commands::run(&settings, invite, join, sos).await,
        Command::Leave => commands::leave(&settings),
        Command::Loopback { file, chunk_size } => {
            commands::loopback(&settings, &file, chunk_size, sos).await
        }
    }
}
