//! Bridge node entry point
//!
//! Joins a proxy cluster's presence registry as an observer: claims an
//! instance id, follows every notification, keeps the roster views fresh and
//! logs cluster statistics until told to stop.

mod cli;
mod config;
mod logging;
mod signals;
mod standalone;

use anyhow::anyhow;
use presence_bridge::{BridgeContext, HandlerError, RedisStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use cli::CliArgs;
use config::AppConfig;
use standalone::StandaloneProxy;

// ============================================================================
// Application
// ============================================================================

struct Application {
    config: AppConfig,
    context: BridgeContext,
}

impl Application {
    async fn new(args: CliArgs) -> anyhow::Result<Self> {
        // configuration comes first so the log settings are known
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        args.apply_overrides(&mut config);
        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;

        logging::setup_logging(&config.logging)?;
        info!(
            "🚀 Presence bridge node v{} | config: {}",
            env!("CARGO_PKG_VERSION"),
            args.config_path.display()
        );

        let bridge_config = config.to_bridge_config();
        let store = Arc::new(RedisStore::connect(&bridge_config.store).await?);
        let proxy = Arc::new(StandaloneProxy::new(config.bridge.backends.clone()));
        let context = BridgeContext::start(bridge_config, store, proxy).await?;

        for channel in &config.bridge.watch_channels {
            let key = channel.clone();
            context.api().bus().on(channel, move |payload| {
                if payload.is_empty() {
                    return Err(HandlerError::InvalidPayload("empty payload".to_string()));
                }
                info!("💬 [{}] {}", key, payload);
                Ok(())
            });
        }

        Ok(Self { config, context })
    }

    async fn run(self) -> anyhow::Result<()> {
        info!("📋 Configuration Summary:");
        info!("  🔑 Key prefix: {}", self.config.bridge.key_prefix);
        info!("  🗄️ Store: {}:{}", self.config.store.hostname, self.config.store.port);
        info!("  ⏱️ Presence TTL: {}s", self.config.bridge.cache_expire_seconds);
        info!("  🔄 Cache interval: {}s", self.config.bridge.cache_update_interval_seconds);

        let monitoring_handle = (self.config.bridge.monitor_interval_seconds > 0).then(|| {
            let api = self.context.api().clone();
            let period = Duration::from_secs(self.config.bridge.monitor_interval_seconds);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                let mut last_dispatched = 0u64;
                loop {
                    interval.tick().await;
                    let online = api.online_count().await;
                    let backends = api.registry().occupied_backends().await;
                    let stats = api.bus().stats();
                    info!(
                        "📊 Cluster: {} online across {} backend(s) | bus: {} dispatched (+{}), {} published, {} handler failure(s)",
                        online,
                        backends.len(),
                        stats.dispatched,
                        stats.dispatched - last_dispatched,
                        stats.published,
                        stats.handler_failures
                    );
                    last_dispatched = stats.dispatched;
                }
            })
        });

        info!("✅ {}", self.context.status_line(None).replace('\n', " | "));
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let outcome = tokio::select! {
            signal = signals::wait_for_shutdown_signal() => signal
                .map(|received| info!("📡 Received {}, shutting down", received))
                .map_err(anyhow::Error::from),
            fatal = self.context.wait_fatal() => match fatal {
                Some(e) => Err(anyhow!(e)),
                None => Ok(()),
            },
        };

        if let Some(handle) = monitoring_handle {
            handle.abort();
        }
        self.context.shutdown().await;
        outcome
    }
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let app = match Application::new(args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("❌ Failed to start bridge node: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("❌ Bridge node stopped: {:#}", e);
        std::process::exit(1);
    }

    info!("👋 Bridge node shutdown complete");
    Ok(())
}
