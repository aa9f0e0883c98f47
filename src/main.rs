//! Transaction coordinator service
//!
//! Hosts the coordination store, keeps RPC failover state healthy for the
//! configured chains, and serves status and metrics endpoints.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use workflow_tx_coordinator::api::{self, AppState};
use workflow_tx_coordinator::config::Settings;
use workflow_tx_coordinator::metrics::{self, MetricsServer};
use workflow_tx_coordinator::state::{NonceStore, StateManager};
use workflow_tx_coordinator::tx::GasStrategy;
use workflow_tx_coordinator::CoordinatorRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting transaction coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let instance_id = settings
        .service
        .instance_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(
        "Instance {} loaded configuration for {} chains",
        instance_id,
        settings.enabled_chains().len()
    );

    info!(
        "Sessions: inclusion wait {}s, stale lock after {}ms",
        settings.submission.inclusion_timeout_secs, settings.nonce.lock_timeout_ms
    );

    // Initialize database connection
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    state_manager.run_migrations().await?;

    let store: Arc<dyn NonceStore> = state_manager.clone();
    let registry = Arc::new(CoordinatorRegistry::new(
        store,
        settings.nonce.clone(),
        settings.rpc.clone(),
    ));

    // Warm the provider cache for known chains
    for (name, chain) in settings.enabled_chains() {
        match registry
            .providers()
            .get_or_connect(&chain.rpc_url, chain.fallback_rpc_url.as_deref())
        {
            Ok(_) => info!("Registered RPC endpoints for {} (chain {})", name, chain.chain_id),
            Err(e) => warn!("Failed to register RPC endpoints for {}: {}", name, e),
        }
    }

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState::new(
            registry.clone(),
            Arc::new(GasStrategy::new(settings.gas.clone())),
            settings.chains.values().cloned().collect(),
        );
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let registry = registry.clone();
        let interval = settings.service.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                // Bring endpoints on fallback back to their primary
                for (primary_url, recovered) in registry.providers().probe_primaries().await {
                    if recovered {
                        info!("Primary RPC {} recovered", primary_url);
                    } else {
                        warn!("Primary RPC {} still unavailable", primary_url);
                    }
                }

                // Check database connection
                match registry.store().health_check().await {
                    Ok(()) => metrics::record_health_check(),
                    Err(e) => {
                        warn!("Database health check failed: {}", e);
                        metrics::record_health_check_failure();
                    }
                }
            }
        }
    });

    info!("Transaction coordinator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    registry.reset_nonce_coordinator();
    registry.reset_providers();

    info!("Transaction coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,workflow_tx_coordinator=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
