//! Live start/stop of the HTTP endpoint
//!
//! An interactive client flips the service on and off while the model stays
//! loaded. Transitions are serialized through one async mutex, so `start`
//! and `stop` never interleave even when called from different tasks.

use super::routes::{router, AppState};
use crate::{
    config::ServerConfig,
    error::{BgRemovalError, Result},
    provider::ModelProvider,
    service::RemovalService,
};
use std::net::SocketAddr;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug)]
struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

/// Starts and stops the network endpoint against a shared provider
#[derive(Debug)]
pub struct ServiceToggle {
    provider: ModelProvider,
    config: ServerConfig,
    running: Mutex<Option<RunningServer>>,
}

impl ServiceToggle {
    #[must_use]
    pub fn new(provider: ModelProvider, config: ServerConfig) -> Self {
        Self {
            provider,
            config,
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listener and begin serving requests
    ///
    /// Returns the bound address (useful with port 0).
    ///
    /// # Errors
    /// - `AlreadyRunning` when the endpoint is up
    /// - `ModelNotReady` when the provider has not finished loading
    /// - Bind failures
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            if !server.task.is_finished() {
                return Err(BgRemovalError::AlreadyRunning);
            }
            tracing::warn!("Previous server task exited on its own, restarting");
        }

        let handle = self.provider.ready_handle().ok_or(BgRemovalError::ModelNotReady)?;
        let service = RemovalService::new(handle).with_timeout(self.config.inference_timeout);
        let app = router(AppState::new(service, &self.config.project_name), &self.config);

        let bind = self.config.bind_addr()?;
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .map_err(|e| BgRemovalError::file_io_error("bind", bind.to_string(), &e))?;
        let addr = listener.local_addr()?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = signal.await;
                })
                .await
        });

        tracing::info!("{} listening on http://{addr}", self.config.project_name);
        *running = Some(RunningServer {
            addr,
            shutdown,
            task,
        });
        Ok(addr)
    }

    /// Stop accepting connections and wait for in-flight requests
    ///
    /// Does nothing when the endpoint is already stopped.
    ///
    /// # Errors
    /// The server task failed or panicked.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        let Some(server) = running.take() else {
            tracing::debug!("Stop requested while not running");
            return Ok(());
        };

        let _ = server.shutdown.send(());
        let outcome = server
            .task
            .await
            .map_err(|e| BgRemovalError::internal(format!("Server task failed: {e}")))?;
        tracing::info!("Server on {} stopped", server.addr);
        outcome.map_err(BgRemovalError::from)
    }

    /// Whether the endpoint is serving
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|server| !server.task.is_finished())
    }

    /// Address the endpoint is bound to
    ///
    /// # Errors
    /// `NotRunning` when stopped.
    pub async fn local_addr(&self) -> Result<SocketAddr> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|server| server.addr)
            .ok_or(BgRemovalError::NotRunning)
    }
}
