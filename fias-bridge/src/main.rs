//! fias-bridge: FIAS interface server for hotel PMS integration.
//!
//! The PMS connects over TCP and drives the guest registry through
//! check-in, check-out, change and posting records. An admin HTTP API
//! exposes the registry, the link state and recent log events.

use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

mod config;
mod dispatch;
mod error;
mod guests;
mod logging;
mod server;
mod supervisor;
mod web;

use config::{Args, Config, ConfigFile};
use dispatch::Dispatcher;
use guests::GuestRegistry;
use logging::LogBuffer;
use server::{ConnectionManager, Link, LinkStatus};
use supervisor::Supervisor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let file_config = match config::config_path(&args) {
        Some(path) => match config::load_config(&path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file {}: {}", path.display(), e);
                return Err(e);
            }
        },
        None => ConfigFile::default(),
    };
    let config = Config::resolve(&args, file_config)?;

    // Initialize logging with file output, rotation and the in-memory buffer
    let log_buffer = Arc::new(LogBuffer::default());
    logging::init_logging(
        &config.log_dir,
        config.log_retention_days,
        config.verbose,
        config.log_level.as_deref(),
        Arc::clone(&log_buffer),
    )?;

    info!("fias-bridge {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Interface: version {}, type {}, character set {}, {} decimal place(s), guest name macro {:?}",
        config.settings.protocol_version,
        config.settings.interface_type,
        config.settings.character_set,
        config.settings.decimal_places,
        config.settings.guest_name_template.as_str()
    );
    if config.link.strict_checksum {
        info!("Strict checksum mode: frames with a bad LRC are rejected");
    }

    let registry = Arc::new(GuestRegistry::new());
    let settings = Arc::new(config.settings.clone());
    let link = Arc::new(Link::new());
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::clone(&settings)));
    let manager = Arc::new(ConnectionManager::new(
        config.link.clone(),
        dispatcher,
        Arc::clone(&link),
    ));

    spawn_status_logger(&link);

    // Bind failures end the process here.
    let supervisor = match Supervisor::start(manager, config.restart_delay).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("{}", e);
            if e.is_bind() {
                error!("Check that no other process uses port {}", config.link.listen_addr.port());
            }
            return Err(e.into());
        }
    };

    // Start the admin API
    let web_shutdown = CancellationToken::new();
    let web_state = Arc::new(web::WebState::new(
        Arc::clone(&link),
        Arc::clone(&registry),
        Arc::clone(&log_buffer),
        settings,
    ));
    let web_listen = config.web_listen;
    let web_token = web_shutdown.clone();
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::start_web_server(web_listen, web_state, web_token).await {
            error!("Admin API error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    supervisor.shutdown().await;
    web_shutdown.cancel();
    if let Err(e) = web_task.await {
        warn!("Admin API task failed: {}", e);
    }

    info!("fias-bridge stopped");
    Ok(())
}

/// Log every link status change.
fn spawn_status_logger(link: &Link) {
    let mut status = link.subscribe();
    tokio::spawn(async move {
        loop {
            match status.recv().await {
                Ok(LinkStatus::Connected { peer }) => info!("PMS link up ({})", peer),
                Ok(LinkStatus::Disconnected) => info!("PMS link down"),
                Ok(LinkStatus::Error { reason }) => warn!("PMS link error: {}", reason),
                Ok(LinkStatus::Listening) => info!("Waiting for PMS connection"),
                Ok(LinkStatus::Stopped) => {
                    info!("PMS link stopped");
                    break;
                }
                Err(RecvError::Lagged(skipped)) => warn!("Status logger skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
