pub mod bridge;
pub mod command;
pub mod config;
pub mod device;
pub mod discovery;
pub mod history;
pub mod mqtt;
pub mod status_page;

use crate::bridge::Bridge;
use crate::command::playlist::HttpPlaylistResolver;
use crate::config::{AppConfig, Cli};
use crate::device::CastConnector;
use crate::mqtt::{MessageSink, MqttHandler};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup(cli.verbose)?;

    let config = AppConfig::load(&cli).await?;
    let shutdown = CancellationToken::new();

    let (bridge, events) = Bridge::new(
        &config,
        Arc::new(CastConnector::new()),
        Arc::new(HttpPlaylistResolver::new()?),
    )?;
    let bridge = Arc::new(bridge);

    // The broker must be reachable at startup; later outages are retried.
    let mut handler = MqttHandler::new(&config.mqtt, bridge.filters());
    handler
        .connect()
        .await
        .map_err(|e| eyre!("Unable to reach broker {}: {}", config.mqtt.broker, e))?;

    let pump = bridge.spawn_event_pump(events, Arc::new(handler.publisher()), shutdown.clone());
    let discovery = bridge.start(shutdown.clone())?;

    let page = if config.status_page.enabled {
        let bridge = Arc::clone(&bridge);
        let bus = handler.status();
        let settings = config.status_page.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) =
                status_page::serve(bridge, bus, &settings.host, settings.port, shutdown).await
            {
                error!("Status page failed: {}", e);
            }
        }))
    } else {
        None
    };

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        ctrl_c.cancel();
    });

    let sink: Arc<dyn MessageSink> = bridge.dispatcher();
    handler.run(sink, shutdown.clone()).await;

    discovery.abort();
    bridge.shutdown().await;
    let _ = pump.await;
    if let Some(page) = page {
        let _ = page.await;
    }
    info!("Bye");
    Ok(())
}

fn setup(verbose: bool) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", if verbose { "debug" } else { "info" })
    }
    setup_logging_env(verbose);
    Ok(())
}

fn setup_logging_env(verbose: bool) {
    FmtSubscriber::builder()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
