use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use hfp_sink::config::Config;
use hfp_sink::health::{ActivityTracker, HealthCheck};
use hfp_sink::server::{router, serve, setup_metrics_recorder, with_metrics_routes, AppState};
use hfp_sink::service::HfpSinkService;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn start_server(config: &Config, activity: Arc<ActivityTracker>) -> Result<JoinHandle<()>> {
    let state = AppState {
        activity,
        health: HealthCheck::new(
            config.health_max_since_handled(),
            config.health_max_pending_age(),
        ),
    };
    let router = with_metrics_routes(router(state), setup_metrics_recorder()?);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = %e, "HTTP server stopped");
        }
    }))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c"),
        _ = terminate => info!("Received SIGTERM"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting HFP sink service");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    config.validate().context("Invalid configuration")?;
    info!("Configuration loaded: {:?}", config);

    let activity = Arc::new(ActivityTracker::new());
    let server_handle = start_server(&config, activity.clone())?;
    info!("Started metrics server on {}", config.bind_address());

    let service = HfpSinkService::new(config, activity)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let result = service.run(shutdown.clone()).await;
    shutdown.cancel();
    server_handle.abort();

    if let Err(e) = &result {
        error!(error = %e, "HFP sink service failed");
    }
    result
}
