mod api;
mod metrics;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use assignrelay_core::{
    config::redact_credentials, create_roster_source, load_config, validate_config, AmqpConnector,
    AssignmentOrchestrator, AssignmentProcessor, BrokerConnector, HttpWorkItemService,
    NotificationFanout, RosterSource, SessionGroups, WorkItemService,
};

use api::create_router;
use state::AppState;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Determine config path
    let config_path = std::env::var("ASSIGNRELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Broker: {}", redact_credentials(&config.broker.url));
    info!("Roster source: {:?}", config.roster.source);

    // Session hub doubles as the notification transport
    let sessions = SessionGroups::new(config.notifications.session_buffer);
    let fanout = NotificationFanout::new(Arc::new(sessions.clone()));

    let work_items: Arc<dyn WorkItemService> = Arc::new(
        HttpWorkItemService::new(&config.work_items)
            .context("Failed to create work-item client")?,
    );
    info!("Work-item service at {}", config.work_items.base_url);

    let processor = Arc::new(AssignmentProcessor::new(work_items, fanout));

    // Bind before the orchestrator opens any broker resources
    let addr = SocketAddr::new(config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Create orchestrator if enabled
    let orchestrator = if config.orchestrator.enabled {
        let roster_source: Arc<dyn RosterSource> = Arc::from(
            create_roster_source(&config.roster).context("Failed to create roster source")?,
        );
        let connector: Arc<dyn BrokerConnector> =
            Arc::new(AmqpConnector::new(config.broker.clone()));

        let orch = AssignmentOrchestrator::new(
            config.orchestrator.clone(),
            &config.broker,
            roster_source,
            connector,
            processor,
        );

        // Startup runs in the background; broker and roster failures are
        // reported through /api/v1/status.
        orch.start().await;
        info!("Assignment orchestrator started");
        Some(Arc::new(orch))
    } else {
        info!("Orchestrator disabled in config");
        None
    };

    // Create app state
    let state = Arc::new(AppState::new(
        config.clone(),
        orchestrator.clone(),
        sessions,
    ));

    // Create router
    let app = create_router(state);

    // Run server with graceful shutdown
    info!("Starting server on {}", addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Stop orchestrator whether or not the server exited cleanly
    if let Some(ref orch) = orchestrator {
        info!("Stopping orchestrator...");
        orch.stop().await;
        info!("Orchestrator stopped");
    }

    served.context("Server error")?;
    info!("Server shut down");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
