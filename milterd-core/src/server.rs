//! The milter server: accept loop, connection tracking and graceful
//! shutdown.
//!
//! Every accepted connection gets a fresh [`ConnectionId`] and runs inside
//! a tracing span carrying the short id, so every log line of the
//! connection is attributable. SIGINT and SIGTERM (or cancelling the
//! shutdown handle) close all connections bottom-up and wait — bounded —
//! for the connection set to drain.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::app::AppFactory;
use crate::error::MilterError;
use crate::network::connection::{ConnectionHandle, handle_connection};
use crate::network::ConnectionId;
use crate::session::SessionConfig;

type ConnectionMap = Arc<Mutex<HashMap<ConnectionId, ConnectionHandle>>>;

/// A bound milter server, ready to accept MTA connections.
pub struct MilterServer {
    listener: TcpListener,
    app_factory: AppFactory,
    session_config: SessionConfig,
    connections: ConnectionMap,
    shutdown: CancellationToken,
}

impl MilterServer {
    /// Bind the listening socket and validate the application's flag
    /// configuration. A contradictory configuration surfaces here, at
    /// startup, not at the first connection.
    pub async fn bind(
        host: &str,
        port: u16,
        app_factory: AppFactory,
    ) -> Result<Self, MilterError> {
        let probe = app_factory();
        probe.protocol_flags().validate()?;

        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self {
            listener,
            app_factory,
            session_config: SessionConfig::default(),
            connections: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        })
    }

    /// The bound address, useful with an OS-assigned port.
    pub fn local_addr(&self) -> Result<SocketAddr, MilterError> {
        Ok(self.listener.local_addr()?)
    }

    /// A token that ends [`MilterServer::run`] with a graceful shutdown
    /// when cancelled, equivalent to receiving a signal.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Override the per-session configuration.
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Accept connections until SIGINT/SIGTERM or a shutdown-handle
    /// cancellation, then shut down gracefully.
    pub async fn run(self) -> Result<(), MilterError> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        let local = self.listener.local_addr()?;
        info!(addr = %local, "server started, awaiting connections");

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("shutting down milter on SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("shutting down milter on SIGTERM");
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    info!("shutting down milter on request");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.accept_connection(stream, peer),
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }

        self.shutdown_connections().await;
        Ok(())
    }

    fn accept_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let id = ConnectionId::generate();
        let span = info_span!("conn", id = %id.short());
        {
            let _entered = span.enter();
            debug!(%peer, "MTA connected");
        }

        let connections = self.connections.clone();
        let on_close = Box::new(move |id: ConnectionId| {
            debug!(id = %id.short(), "connection released");
            if let Ok(mut map) = connections.lock() {
                map.remove(&id);
            }
        });

        let handle = handle_connection(
            stream,
            id,
            (self.app_factory)(),
            self.session_config.clone(),
            on_close,
            span,
        );
        if let Ok(mut map) = self.connections.lock() {
            map.insert(id, handle);
        }
    }

    /// Bottom-up close to every open connection, then a bounded drain
    /// poll: up to 50 iterations of increasing sleep (~1.3 s in total),
    /// warning every fifth iteration while connections remain.
    async fn shutdown_connections(&self) {
        let handles: Vec<ConnectionId> = match self.connections.lock() {
            Ok(map) => {
                debug!(count = map.len(), "closing connections");
                for handle in map.values() {
                    handle.close_bottom_up();
                }
                map.keys().copied().collect()
            }
            Err(_) => Vec::new(),
        };

        if !handles.is_empty() {
            for i in 1..=50u64 {
                let remaining = self
                    .connections
                    .lock()
                    .map(|map| map.len())
                    .unwrap_or_default();
                if remaining == 0 {
                    break;
                }
                if i % 5 == 0 {
                    warn!(remaining, "still pending connections during shutdown");
                }
                tokio::time::sleep(Duration::from_millis(i)).await;
            }
        }

        info!("milter shutdown complete");
    }
}
