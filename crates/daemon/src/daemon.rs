//! Daemon startup and main loop for the live-stream daemon
//!
//! Owns the job registry and the HTTP server, and runs the shutdown
//! sequence: stop accepting, drain requests, stop running encoders.

use crate::api::{create_router, ApiState};
use crate::config::{Config, ConfigError};
use crate::registry::{JobRegistry, RegistrySettings};
use crate::startup::{run_startup_checks, StartupError};
use axum::Router;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Errors from the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server error: {0}")]
    Serve(#[from] std::io::Error),

    #[error("HTTP server task failed: {0}")]
    Task(String),
}

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Server error
    #[error(transparent)]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    registry: JobRegistry,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// Loads the file, applies environment overrides and runs the startup
    /// checks.
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::new(config)
    }

    /// Initialize the daemon with an existing configuration, running the
    /// startup checks.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config))
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when the encoder is not installed.
    pub fn new_without_checks(config: Config) -> Self {
        let registry = JobRegistry::new(RegistrySettings::from_config(&config));
        Self { config, registry }
    }

    pub fn registry(&self) -> JobRegistry {
        self.registry.clone()
    }

    /// Creates the API router over this daemon's registry
    pub fn router(&self) -> Router {
        create_router(ApiState {
            registry: self.registry.clone(),
            limits: self.config.limits.clone(),
        })
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!(addr = %addr, media_root = %self.config.media.root.display(), "HTTP server listening");
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves
    ///
    /// In-flight requests get `shutdown_timeout_secs` to finish. Running
    /// jobs are stopped before returning, also when the server fails.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let graceful = async move {
            let _ = shutdown_rx.changed().await;
        };
        let server = axum::serve(listener, self.router()).with_graceful_shutdown(graceful);
        let mut server_task = tokio::spawn(async move { server.await });

        let stopped_early = tokio::select! {
            res = &mut server_task => Some(res),
            () = shutdown => None,
        };

        let result = match stopped_early {
            Some(res) => {
                error!("HTTP server stopped unexpectedly");
                flatten(res)
            }
            None => {
                info!("Shutdown signal received, starting graceful shutdown...");
                let _ = shutdown_tx.send(true);
                let drain = Duration::from_secs(self.config.server.shutdown_timeout_secs);
                match tokio::time::timeout(drain, &mut server_task).await {
                    Ok(res) => flatten(res),
                    Err(_) => {
                        warn!(timeout_secs = drain.as_secs(), "Requests still in flight after drain timeout");
                        server_task.abort();
                        Ok(())
                    }
                }
            }
        };

        self.registry.stop_all().await;
        info!("HTTP server shut down");
        result.map_err(DaemonError::from)
    }
}

fn flatten(
    res: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), ServerError> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ServerError::Serve(e)),
        Err(e) => Err(ServerError::Task(e.to_string())),
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use crate::validate::{validate, JobCreateRequest};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    fn test_config(tmp: &TempDir) -> Config {
        let mut config = Config::default();
        config.server.addr = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.shutdown_timeout_secs = 2;
        config.media.root = tmp.path().join("media");
        config
    }

    async fn raw_get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_daemon_initialization_without_checks() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let daemon = Daemon::new_without_checks(config.clone());

        assert_eq!(daemon.config, config);
        assert!(daemon.registry().list().await.is_empty());
        assert_eq!(daemon.registry().media_root(), tmp.path().join("media"));
    }

    #[tokio::test]
    async fn test_new_fails_on_unusable_media_root() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        std::fs::write(tmp.path().join("media"), b"x").unwrap();
        config.media.root = tmp.path().join("media");

        let result = Daemon::new(config);
        assert!(matches!(result, Err(DaemonError::Startup(_))));
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let tmp = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(test_config(&tmp));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let serve = daemon.serve(listener, async {
            let _ = stop_rx.await;
        });
        let client = async {
            let response = raw_get(addr, "/health").await;
            let _ = stop_tx.send(());
            response
        };

        let (result, response) = tokio::join!(serve, client);
        assert!(result.is_ok());
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""status":"ok""#));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_stops_running_jobs() {
        use crate::supervisor::test_support::{fake_encoder, SLEEPER};

        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.encoder = fake_encoder(tmp.path(), "enc.sh", SLEEPER);
        let daemon = Daemon::new_without_checks(config.clone());
        let registry = daemon.registry();

        let request = JobCreateRequest {
            description: "Test job".to_string(),
            ..Default::default()
        };
        let spec = validate(&request, &config.limits, &config.encoder).unwrap();
        let job = registry.create(spec).await;
        registry.start(&job.id).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        daemon.serve(listener, async {}).await.unwrap();

        assert_eq!(registry.running_count().await, 0);
        assert_eq!(registry.get(&job.id).await.unwrap().status, JobStatus::Completed);
    }
}
