//! Event bus broker entry point.
//!
//! Loads configuration, sets up logging, binds the network front-end and runs
//! until a termination signal arrives.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Context};
use cli::CliArgs;
use config::AppConfig;
use event_bus::{Broker, NetworkServer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long connections get to wind down after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Application {
    config: AppConfig,
    server: Arc<NetworkServer>,
}

impl Application {
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        // Configuration is loaded before logging exists.
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        config.apply_cli_overrides(&args);
        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;

        logging::setup_logging(&config.logging)?;
        info!(
            "🚀 Event Bus Server v{} | Config: {}",
            env!("CARGO_PKG_VERSION"),
            args.config_path.display()
        );

        let server_config = config.to_server_config()?;
        let server = NetworkServer::bind(server_config, Broker::new())
            .await
            .with_context(|| format!("binding {}", config.server.bind_address))?;

        Ok(Self {
            config,
            server: Arc::new(server),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("📋 Configuration Summary:");
        info!("  🌐 Listening on: {}", self.server.local_addr());
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!("  📏 Max line length: {} bytes", self.config.server.max_line_length);

        let server_handle = {
            let server = self.server.clone();
            tokio::spawn(async move { server.run().await })
        };

        let monitoring_handle = match self.config.monitoring.stats_interval_secs {
            0 => None,
            secs => Some(tokio::spawn(monitor_stats(self.server.clone(), Duration::from_secs(secs)))),
        };

        info!("✅ Event bus is running");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        tokio::select! {
            signal = signals::wait_for_shutdown_signal() => {
                info!("📡 Received {} signal", signal?);
            }
            finished = server_handle => {
                // The accept loop only returns on its own after an error.
                finished.context("accept loop panicked")??;
                return Err(anyhow!("accept loop stopped unexpectedly"));
            }
        }

        info!("🛑 Shutdown signal received, initiating graceful shutdown...");
        if let Some(handle) = monitoring_handle {
            handle.abort();
        }
        self.server.shutdown();

        info!("⏳ Waiting for connections to close...");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.server.stats().active_connections > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connection(s) still open after {:?}",
                self.server.stats().active_connections,
                SHUTDOWN_GRACE
            );
        }

        let broker_stats = self.server.broker().stats().await;
        let network_stats = self.server.stats();
        info!("📊 Final Statistics:");
        info!("  - Connections served: {}", network_stats.total_connections);
        info!("  - Events published: {}", broker_stats.events_published);
        info!("  - Requests dispatched: {}", broker_stats.requests_dispatched);
        info!("✅ Event bus shutdown complete");
        Ok(())
    }
}

/// Logs broker and connection counters every `period`.
async fn monitor_stats(server: Arc<NetworkServer>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;
    let mut last_published = 0u64;

    loop {
        interval.tick().await;
        let stats = server.broker().stats().await;
        let network = server.stats();
        let published = stats.events_published - last_published;
        last_published = stats.events_published;

        info!(
            "📊 Bus Health - {} events/period | {} subscribers on {} queues | {} handlers on {} queues | {} connections",
            published,
            stats.active_subscribers,
            stats.subscriber_queues,
            stats.active_handlers,
            stats.handler_queues,
            network.active_connections
        );
        if stats.requests_unhandled > 0 {
            info!(
                "  {} of {} requests found no handler so far",
                stats.requests_unhandled, stats.requests_dispatched
            );
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Event bus error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start event bus: {:?}", e);
            std::process::exit(1);
        }
    }
}
