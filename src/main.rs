use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use iotdash::config::Settings;
use iotdash::mqtt::{ConnectionStatus, RumqttTransport, SessionManager};
use iotdash::notify::TracingNotifier;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())
        .await
        .map_err(|e| eyre!("Failed to load settings: {}", e))?;

    let session = SessionManager::from_settings(&settings, RumqttTransport, TracingNotifier)
        .map_err(|e| eyre!("Failed to set up MQTT session: {}", e))?;

    info!("Connecting to MQTT broker");
    session.connect();

    let mut status = session.watch_status();
    let mut payload = session.watch_payload();
    let topics = settings.session.topics.clone();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    warn!("Session worker stopped unexpectedly");
                    break;
                }
                let current = *status.borrow_and_update();
                info!("MQTT status: {:?}", current);
                // Reconnects replay subscriptions themselves, only the first connect subscribes.
                if current == ConnectionStatus::Connected && session.subscriptions().is_empty() {
                    for topic in &topics {
                        session.subscribe(topic.as_str());
                    }
                }
            }
            changed = payload.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(message) = payload.borrow_and_update().message.clone() {
                    info!("Latest payload: {}", message);
                }
            }
        }
    }

    session
        .shutdown()
        .await
        .map_err(|e| eyre!("Failed to shut down MQTT session: {}", e))?;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
