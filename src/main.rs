//! Pantry Hub Bridge
//!
//! Runs the hub integration headless against a surface described in a JSON file.

use pantry_hub_bridge::{
    bus::{BusEvent, NotificationLevel},
    config,
    controller::{Controller, ControllerOptions},
    hub::websocket::WsHub,
    store::Store,
    surface::{InputSurface, MemorySurface, SharedSurface},
};

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "pantry-hub-bridge", version = env!("PHB_VERSION"), about)]
struct Args {
    /// Page URL returned by the hub after authorization (carries auth_callback, code, state)
    #[arg(long)]
    callback_url: Option<Url>,

    /// Remove every stored hub credential and exit
    #[arg(long)]
    clear_auth: bool,

    /// JSON list of input descriptors for the headless surface
    #[arg(long)]
    surface: Option<PathBuf>,

    /// Hub URL to use when none is stored yet
    #[arg(long)]
    hub_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pantry_hub_bridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Pantry Hub Bridge v{} ({})",
        env!("PHB_VERSION"),
        env!("PHB_GIT_SHA")
    );

    let mut settings = config::load_settings()?;
    if args.hub_url.is_some() {
        settings.hub_url = args.hub_url.clone();
    }
    let store_path = settings.store_path();
    tracing::info!("Store: {}", store_path.display());
    let store = Store::open(store_path, settings.key_prefix.clone());

    let surface: Arc<MemorySurface> = match &args.surface {
        Some(path) => Arc::new(
            MemorySurface::from_json_file(path)
                .with_context(|| format!("loading surface from {}", path.display()))?,
        ),
        None => Arc::new(MemorySurface::new()),
    };
    tracing::info!("Surface has {} inputs", surface.inputs().len());
    let shared: SharedSurface = surface.clone();

    let controller = Controller::new(ControllerOptions::from_settings(
        &settings,
        Arc::new(WsHub::new()),
        store,
        shared,
    ));

    if args.clear_auth {
        controller.clear_auth().await?;
        tracing::info!("Stored credentials cleared");
        return Ok(());
    }

    let stop = CancellationToken::new();
    let mut events = controller.bus().subscribe();
    let log_stop = stop.clone();
    let log_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = log_stop.cancelled() => break,
                event = events.recv() => match event {
                    Ok(BusEvent::Notification { level, message }) => match level {
                        NotificationLevel::Error => tracing::error!("{}", message),
                        NotificationLevel::Warning => tracing::warn!("{}", message),
                        _ => tracing::info!("{}", message),
                    },
                    Ok(BusEvent::ValueWritten { module, input, value }) => {
                        tracing::info!("[{}] {} = {}", module, input, value);
                    }
                    Ok(BusEvent::ShuttingDown { .. }) => break,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    if let Some(cleaned) = controller.initialize(args.callback_url.as_ref()).await? {
        tracing::info!("Authorization callback handled; continue at {}", cleaned);
    }

    shutdown_signal().await;

    controller.destroy().await;
    stop.cancel();
    if let Err(e) = log_task.await {
        tracing::warn!("Event log task failed: {}", e);
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
