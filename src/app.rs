use crate::config::Config;
use crate::origin::HttpOrigin;
use crate::state::AppState;
use crate::store::RedisStore;
use crate::utils::fmt_duration;
use crate::web::create_router;
use anyhow::Context;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Main application struct containing all necessary components
pub struct App {
    config: Config,
    app_state: AppState,
}

impl App {
    /// Connect to the coordination store and wire the coordinator.
    ///
    /// Fails if Redis is unreachable: the proxy cannot coordinate without it.
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        let store = RedisStore::connect(
            &config.redis_host,
            config.redis_port,
            config.redis_password.as_deref(),
        )
        .await
        .context("Failed to connect to coordination store")?;

        let origin =
            HttpOrigin::new(config.origin_timeout).context("Failed to build origin HTTP client")?;

        let stampede = config.stampede();
        info!(
            lock_key = %stampede.lock_key,
            lock_ttl = fmt_duration(stampede.lock_ttl),
            cache_ttl = fmt_duration(stampede.cache_ttl),
            wait_budget = fmt_duration(stampede.wait_budget),
            poll_interval = fmt_duration(stampede.poll_interval),
            origin_timeout = fmt_duration(config.origin_timeout),
            "stampede control configured"
        );

        let app_state = AppState::new(Arc::new(store), Arc::new(origin), stampede);

        Ok(App { config, app_state })
    }

    /// Serve until a shutdown signal, then drain in-flight requests for at most `SHUTDOWN_TIMEOUT`.
    pub async fn run(self) -> ExitCode {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = ?e, %addr, "Failed to bind listener");
                return ExitCode::FAILURE;
            }
        };
        info!(%addr, "web server listening");

        let shutdown = CancellationToken::new();
        let router = create_router(self.app_state);
        let drain = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(drain.cancelled_owned())
                .await
        });

        wait_for_signal().await;
        info!(
            timeout = fmt_duration(self.config.shutdown_timeout),
            "shutdown signal received, draining requests"
        );
        shutdown.cancel();

        match tokio::time::timeout(self.config.shutdown_timeout, server).await {
            Ok(Ok(Ok(()))) => {
                info!("web server stopped");
                ExitCode::SUCCESS
            }
            Ok(Ok(Err(e))) => {
                error!(error = ?e, "web server failed");
                ExitCode::FAILURE
            }
            Ok(Err(e)) => {
                error!(error = ?e, "web server task panicked");
                ExitCode::FAILURE
            }
            Err(_) => {
                warn!("in-flight requests did not finish before the shutdown timeout");
                ExitCode::FAILURE
            }
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = ?e, "Failed to listen for Ctrl+C");
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
                error!(error = ?e, "Failed to listen for SIGTERM");
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
