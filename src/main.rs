use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use weather_node::clock::{SharedClock, SystemClock};
use weather_node::config::Config;
use weather_node::network::HostNetwork;
use weather_node::node::{Delivery, Node};
use weather_node::replay::ReplayBoard;

const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,weather_node=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Weather node starting...");

    // Load configuration
    let config_path =
        std::env::var("WEATHER_NODE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration: {}\n\n\
             Make sure:\n\
             1. {} exists (or WEATHER_NODE_CONFIG points to your config)\n\
             2. All required environment variables are set (check .env.example)\n\
             3. Create a .env file if needed",
            e,
            config_path
        )
    })?;
    info!(
        "Configuration loaded for '{}' (data in {})",
        config.device.nickname,
        config.storage.data_dir.display()
    );

    let replay_file = config.replay.file.clone().ok_or_else(|| {
        anyhow::anyhow!(
            "No sample source configured\n\n\
             Set replay.file in {} to a file of recorded samples",
            config_path
        )
    })?;
    let board = ReplayBoard::from_file(&replay_file).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load replay samples from {}: {}",
            replay_file.display(),
            e
        )
    })?;

    let clock: SharedClock = Arc::new(SystemClock);
    let delivery = Delivery::from_config(&config, clock.clone())?;

    // Set up shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut node = Node::new(
        &config,
        clock,
        board,
        HostNetwork::new(),
        delivery,
        shutdown_rx,
    );

    if let Err(e) = node.run().await {
        error!("Node error: {}", e);
    }

    info!("Weather node shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
