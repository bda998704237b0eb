//! LUKi API gateway.
//!
//! Startup order: tracing, configuration (fatal on error), credential
//! verifiers and downstream clients (fatal on error), admin server,
//! background tasks, main listener, ready. SIGINT or SIGTERM stops new
//! work and drains in-flight requests.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use luki_core::config::{find_config_file, load_and_validate};
use luki_core::lifecycle::{DrainResult, LifecycleConfig, LifecycleManager};
use luki_core::telemetry::GatewayMetrics;
use luki_gateway::admin::AdminServer;
use luki_gateway::{GatewayState, StartupError, router};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long a drained server may take to close idle connections.
const SERVER_CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    /// If not given, searches: LUKI_CONFIG, /etc/luki/config.yaml, ./config.yaml
    #[arg(long, env = "LUKI_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address for client traffic, overriding `server.bind`
    #[arg(long, env = "LUKI_BIND")]
    bind: Option<String>,

    /// Admin server port, overriding `admin.port`
    #[arg(long, env = "LUKI_ADMIN_PORT")]
    admin_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The guard must live until exit so buffered log lines are flushed.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let started = Instant::now();

    // Configuration
    let config_path = find_config_file(cli.config.as_deref()).inspect_err(|e| {
        error!(error = %e, "No usable configuration file, refusing to start");
    })?;
    info!(path = %config_path.display(), "Loading configuration file");
    let (mut config, validation) = load_and_validate(&config_path).inspect_err(|e| {
        error!(error = %e, "Invalid configuration, refusing to start");
    })?;
    for warning in &validation.warnings {
        warn!(warning = %warning, "Configuration warning");
    }
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.admin_port {
        config.admin.port = port;
    }
    let config = Arc::new(config);

    // Lifecycle and metrics
    let lifecycle = Arc::new(LifecycleManager::new(LifecycleConfig::from_server_config(
        &config.server,
    )));
    let mut registry = Registry::default();
    let metrics = Arc::new(GatewayMetrics::new(&mut registry));
    let registry = Arc::new(registry);
    lifecycle.set_metrics(metrics.clone());

    let state = GatewayState::from_config(config.clone(), lifecycle.clone(), Some(metrics.clone()))
        .inspect_err(|e| error!(error = %e, "Startup failed"))?;
    lifecycle.mark_config_loaded();

    let shutdown = lifecycle.shutdown_token();

    // Admin server
    let admin = AdminServer::new(&config.admin, lifecycle.clone(), registry);
    info!(addr = %admin.bind_addr(), "Admin server starting (/health, /ready, /metrics)");
    let admin_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = admin.run(admin_shutdown).await {
            error!(error = %e, "Admin server error");
        }
    });

    // Background tasks
    if let Some(limiter) = state.dispatcher.limiter() {
        limiter.spawn_cleanup_task(shutdown.clone());
    }
    lifecycle.spawn_health_monitor(state.downstreams());
    spawn_uptime_gauge(metrics, lifecycle.clone(), shutdown.clone());

    // Main listener
    let bind = config.server.bind.clone();
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|source| StartupError::Bind {
            addr: bind.clone(),
            source,
        })
        .inspect_err(|e| error!(error = %e, "Startup failed"))?;

    setup_signal_handlers(lifecycle.clone());

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let server_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
    });

    lifecycle.mark_ready();
    info!(
        addr = %bind,
        routes = config.effective_routes().len(),
        downstreams = config.downstreams.len(),
        startup_ms = started.elapsed().as_millis() as u64,
        "LUKi gateway listening"
    );

    tokio::select! {
        result = &mut server => {
            lifecycle.mark_stopped();
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(StartupError::Serve(e).into()),
                Err(e) => Err(e.into()),
            };
        }
        _ = shutdown.cancelled() => {}
    }

    info!(
        active_requests = lifecycle.active_request_count(),
        drain_timeout_secs = lifecycle.config().drain_timeout.as_secs(),
        "Waiting for active requests to drain"
    );
    let drain_result = lifecycle.drain_requests().await;

    match drain_result {
        DrainResult::Complete => {
            if tokio::time::timeout(SERVER_CLOSE_GRACE, &mut server).await.is_err() {
                server.abort();
            }
            lifecycle.mark_stopped();
            info!("All requests drained, shutting down cleanly");
            Ok(())
        }
        DrainResult::Timeout { remaining } => {
            server.abort();
            lifecycle.mark_stopped();
            Err(format!("Drain timeout exceeded with {remaining} remaining requests").into())
        }
    }
}

fn spawn_uptime_gauge(
    metrics: Arc<GatewayMetrics>,
    lifecycle: Arc<LifecycleManager>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    metrics.uptime_seconds.set(lifecycle.uptime().as_secs() as i64);
                }
                _ = shutdown.cancelled() => break,
            }
        }
    });
}

/// SIGINT and SIGTERM both begin a graceful shutdown, which cancels the
/// lifecycle's shutdown token.
fn setup_signal_handlers(lifecycle: Arc<LifecycleManager>) {
    let lifecycle_sigint = lifecycle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                lifecycle_sigint.begin_shutdown();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating graceful shutdown");
                lifecycle.begin_shutdown();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
            }
        }
    });

    #[cfg(not(unix))]
    let _ = lifecycle;
}
