use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::config::ServerConfig;
use crate::gateway;
use crate::rpc::ExecService;
use crate::state::AppState;

/// How long transports get to drain after sessions are gone.
const TRANSPORT_DRAIN: Duration = Duration::from_secs(5);

/// Binds both transports and owns the ordered shutdown.
pub struct Supervisor;

/// A running server.
pub struct ServerHandle {
    pub rpc_addr: SocketAddr,
    pub stream_addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
    transports: Vec<JoinHandle<Result<()>>>,
}

impl Supervisor {
    pub async fn start(config: &ServerConfig, audit: AuditLog) -> Result<ServerHandle> {
        let state = AppState::new(config, audit);

        let rpc_listener = TcpListener::bind(config.rpc_listen)
            .await
            .with_context(|| format!("failed to bind rpc listener on {}", config.rpc_listen))?;
        let stream_listener = TcpListener::bind(config.stream_listen)
            .await
            .with_context(|| {
                format!("failed to bind stream listener on {}", config.stream_listen)
            })?;
        let rpc_addr = rpc_listener.local_addr()?;
        let stream_addr = stream_listener.local_addr()?;

        let shutdown = CancellationToken::new();

        let service = ExecService::new(state.clone()).into_server();
        let rpc_shutdown = shutdown.clone();
        let rpc = tokio::spawn(async move {
            Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(rpc_listener),
                    rpc_shutdown.cancelled_owned(),
                )
                .await
                .context("rpc server failed")
        });

        let app = gateway::router(state.clone());
        let stream_shutdown = shutdown.clone();
        let stream = tokio::spawn(async move {
            axum::serve(stream_listener, app)
                .with_graceful_shutdown(stream_shutdown.cancelled_owned())
                .await
                .context("stream server failed")
        });

        info!(%rpc_addr, %stream_addr, pid = std::process::id(), "rexec server started");
        Ok(ServerHandle {
            rpc_addr,
            stream_addr,
            state,
            shutdown,
            transports: vec![rpc, stream],
        })
    }
}

impl ServerHandle {
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Run until SIGINT or SIGTERM, then shut down.
    pub async fn run_until_signal(self) -> Result<()> {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
        self.shutdown().await
    }

    /// Terminate every session, then stop both transports.
    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down: terminating sessions");
        self.state.shutdown_sessions().await;

        info!("shutting down: stopping transports");
        self.shutdown.cancel();
        for handle in self.transports {
            match tokio::time::timeout(TRANSPORT_DRAIN, handle).await {
                Ok(joined) => joined.context("transport task panicked")??,
                Err(_) => warn!("transport did not drain in time"),
            }
        }
        info!("rexec server stopped");
        Ok(())
    }
}
