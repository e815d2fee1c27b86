//! TCP Listener and Connection Handling
//!
//! Accepts viewer connections and hands each admitted one to its own task.
//! Connections beyond the concurrency cap are closed right away, before any
//! key exchange. The ephemeral mode serves a single connection and returns.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::registry::ConcurrencyRegistry;
use super::session::{SessionConfig, StreamSession};
use crate::ErrorKind;

/// Which endpoint this acceptor implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Multi-viewer video playback
    #[default]
    Playback,
    /// Single connection, then exit
    Ephemeral,
}

impl StreamMode {
    /// Concurrency cap actually enforced in this mode
    pub fn session_cap(self, configured: usize) -> usize {
        match self {
            StreamMode::Playback => configured,
            StreamMode::Ephemeral => 1,
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamMode::Playback => write!(f, "playback"),
            StreamMode::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

impl FromStr for StreamMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "playback" => Ok(StreamMode::Playback),
            "ephemeral" => Ok(StreamMode::Ephemeral),
            other => Err(format!("unknown stream mode '{}'", other)),
        }
    }
}

/// Acceptor configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub mode: StreamMode,
    pub max_sessions: usize,
    pub session: SessionConfig,
}

/// Server error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind stream port {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Bind { .. } => ErrorKind::Environment,
            ServerError::Accept(_) => ErrorKind::Transport,
        }
    }
}

/// Bound acceptor, ready to run
pub struct StreamServer {
    listener: TcpListener,
    mode: StreamMode,
    registry: ConcurrencyRegistry,
    session_config: Arc<SessionConfig>,
}

impl StreamServer {
    pub async fn bind(addr: &str, config: StreamConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let cap = config.mode.session_cap(config.max_sessions);

        Ok(StreamServer {
            listener,
            mode: config.mode,
            registry: ConcurrencyRegistry::new(cap),
            session_config: Arc::new(config.session),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn registry(&self) -> ConcurrencyRegistry {
        self.registry.clone()
    }

    /// Run until the process exits, or until the single ephemeral session ends
    pub async fn run(self) -> Result<(), ServerError> {
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.run_with_shutdown(shutdown_rx).await
    }

    /// Run with graceful shutdown support. Stops accepting on signal;
    /// sessions already running are left to finish.
    pub async fn run_with_shutdown(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        log::info!(
            "Stream server listening on {} ({} mode, max {} sessions)",
            self.describe_addr(),
            self.mode,
            self.registry.max_sessions()
        );
        log::info!("Serving {}", self.session_config.media_path.display());

        let mut ephemeral_session = None;
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer)) => {
                            log::debug!("Accepted connection from {}", peer);
                            let handle = self.spawn_session(socket, peer);
                            if self.mode == StreamMode::Ephemeral {
                                if let Some(handle) = handle {
                                    ephemeral_session = Some((peer, handle));
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            log::error!("{}", ServerError::Accept(e));
                        }
                    }
                }
                _ = shutdown.recv() => {
                    log::info!("Stream server shutting down ({} sessions still active)", self.registry.active_count());
                    return Ok(());
                }
            }
        }

        // Ephemeral: the listener stops accepting here; wait for the single
        // session unless shutdown comes first
        if let Some((peer, mut handle)) = ephemeral_session {
            tokio::select! {
                result = &mut handle => {
                    if let Err(e) = result {
                        log::error!("Ephemeral session task for {} aborted: {}", peer, e);
                    }
                    log::info!("Ephemeral session finished, releasing listener");
                }
                _ = shutdown.recv() => {
                    log::info!("Stream server shutting down, ephemeral session for {} left to finish", peer);
                }
            }
        }

        Ok(())
    }

    /// Admit the connection into its own task, or close it immediately when
    /// the registry is full
    fn spawn_session(&self, socket: TcpStream, peer: SocketAddr) -> Option<JoinHandle<()>> {
        let permit = match self.registry.try_acquire(peer) {
            Some(permit) => permit,
            None => {
                log::warn!(
                    "Rejecting {}: {} of {} sessions active",
                    peer,
                    self.registry.active_count(),
                    self.registry.max_sessions()
                );
                drop(socket);
                return None;
            }
        };
        if let Err(e) = socket.set_nodelay(true) {
            log::debug!("set_nodelay failed for {}: {}", peer, e);
        }

        let config = self.session_config.clone();
        Some(tokio::spawn(async move {
            let id = permit.id();
            let session = StreamSession::with_permit(socket, permit, config);
            match session.run().await {
                Ok(stats) => log::debug!(
                    "Session {} for {} completed with {} frames",
                    id,
                    peer,
                    stats.frames_sent
                ),
                Err(e) => log::debug!("Session {} for {} ended with {} error", id, peer, e.kind()),
            }
        }))
    }

    fn describe_addr(&self) -> String {
        self.local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    }
}

/// Bind a fresh acceptor and run it in the background. Returns the bound
/// address once the listener is up, or the bind failure.
pub async fn launch(
    addr: &str,
    config: StreamConfig,
) -> Result<(SocketAddr, JoinHandle<Result<(), ServerError>>), ServerError> {
    let server = StreamServer::bind(addr, config).await?;
    let local_addr = server.local_addr().map_err(|source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    Ok((local_addr, tokio::spawn(server.run())))
}
