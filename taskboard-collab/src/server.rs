//! WebSocket server with project-scoped routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── MembershipRegistry
//!             ├── /ws/projects/7/ ──► ConnectionHandler ── BoardService ──┤
//! Client B ──┘                         │                                  └── BoardStore
//!                                      ▼
//!                               ProjectChannel (project_7)
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    (others)
//! ```
//!
//! Each connection runs on its own task:
//! - the route is checked during the HTTP upgrade (404 on mismatch)
//! - a missing project is closed with code 4001 before joining
//! - a `select!` loop pumps inbound frames into the handler and the
//!   member's outbound queue into the socket
//! - leaving the group runs on every exit path

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{ChannelStats, ProjectChannel};
use crate::handler::{ActionOutcome, ConnectionHandler, ConnectionPhase};
use crate::membership::MembershipRegistry;
use crate::model::ProjectId;
use crate::protocol::CLOSE_PROJECT_NOT_FOUND;
use crate::service::{BoardService, ServiceError};
use crate::storage::{BoardStore, MemoryStore, RocksStore, StoreConfig, StoreError};

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per connection before drops start
    pub member_queue_capacity: usize,
    /// Run order-changing writes of a project one at a time
    pub serialize_moves: bool,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Largest accepted WebSocket frame, in bytes
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            member_queue_capacity: 256,
            serialize_moves: true,
            storage_path: None,
            max_frame_size: 1 << 20,
        }
    }
}

impl ServerConfig {
    fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_frame_size(Some(self.max_frame_size))
            .max_message_size(Some(self.max_frame_size))
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Upgrades refused by route or closed with 4001
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_groups: usize,
    pub channel: ChannelStats,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
}

/// Decrements the active connection count however the task ends.
struct ActiveConnection(Arc<AtomicServerStats>);

impl ActiveConnection {
    fn new(stats: Arc<AtomicServerStats>) -> Self {
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Extract the project id from `/ws/projects/{id}/`.
///
/// The trailing slash is optional; the id must be a positive decimal
/// integer.
pub fn parse_project_path(path: &str) -> Option<ProjectId> {
    let rest = path.strip_prefix("/ws/projects/")?;
    let digits = rest.strip_suffix('/').unwrap_or(rest);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<ProjectId>().ok().filter(|id| *id > 0)
}

fn route_not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("unknown route".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// The board server.
pub struct BoardServer {
    config: ServerConfig,
    service: Arc<BoardService>,
    stats: Arc<AtomicServerStats>,
}

impl BoardServer {
    /// Create a server, opening RocksDB when a storage path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn BoardStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn BoardStore>) -> Self {
        let channel = Arc::new(ProjectChannel::new(Arc::new(MembershipRegistry::new())));
        let mut service = BoardService::new(store, channel);
        if !config.serialize_moves {
            service = service.without_move_lock();
        }
        Self {
            config,
            service: Arc::new(service),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// The service used for server-originated mutations.
    pub fn service(&self) -> &Arc<BoardService> {
        &self.service
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Board server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = Arc::clone(&self.service);
            let stats = Arc::clone(&self.stats);
            let queue_capacity = self.config.member_queue_capacity.max(1);
            let ws_config = self.config.websocket_config();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, service, stats, queue_capacity, ws_config)
                        .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<BoardService>,
        stats: Arc<AtomicServerStats>,
        queue_capacity: usize,
        ws_config: WebSocketConfig,
    ) -> Result<(), ServerError> {
        let mut route = None;
        let check_route = |request: &Request, response: Response| {
            match parse_project_path(request.uri().path()) {
                Some(project) => {
                    route = Some(project);
                    Ok(response)
                }
                None => {
                    log::info!("Refusing upgrade from {addr} to {}", request.uri().path());
                    Err(route_not_found())
                }
            }
        };
        let upgraded = tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            check_route,
            Some(ws_config),
        )
        .await;

        let mut ws_stream = match upgraded {
            Ok(ws) => ws,
            // Refused by the route check; the 404 has already been written
            Err(_) if route.is_none() => {
                stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(project) = route else {
            return Ok(());
        };

        let _active = ActiveConnection::new(Arc::clone(&stats));
        let (outbox, mut inbox) = mpsc::channel::<Arc<str>>(queue_capacity);
        let mut handler = ConnectionHandler::new(project, service);

        match handler.open(outbox).await {
            Ok(ConnectionPhase::Joined) => {}
            Ok(_) => {
                stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                let frame = CloseFrame {
                    code: CloseCode::from(CLOSE_PROJECT_NOT_FOUND),
                    reason: "project not found".into(),
                };
                ws_stream.close(Some(frame)).await?;
                return Ok(());
            }
            Err(e) => {
                log::error!("Could not admit {addr} to project {project}: {e}");
                let frame = CloseFrame {
                    code: CloseCode::Error,
                    reason: "storage unavailable".into(),
                };
                let _ = ws_stream.close(Some(frame)).await;
                return Err(e.into());
            }
        }

        log::info!("WebSocket connection from {addr} joined project {project}");
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let result: Result<(), ServerError> = loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(text.len() as u64, Ordering::Relaxed);
                            if let ActionOutcome::Dropped(reason) = handler.handle_text(text.as_str()).await {
                                log::trace!("Frame from {addr} dropped: {reason:?}");
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            log::debug!("Ignoring {} byte binary frame from {addr}", data.len());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break Ok(());
                        }
                        Some(Ok(_)) => {}
                    }
                }

                // Outgoing group message
                frame = inbox.recv() => {
                    let Some(frame) = frame else { break Ok(()) };
                    if let Err(e) = ws_sender.send(Message::text(frame.to_string())).await {
                        break Err(e.into());
                    }
                }
            }
        };

        handler.close();
        result
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        let registry = self.service.channel().registry();
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_groups: registry.group_count(),
            channel: self.service.channel().stats(),
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
