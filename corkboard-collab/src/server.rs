//! WebSocket relay with board-scoped rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── forwarder(A) ──► outbox(A) ──► A
//!            ├── join-board(7) ── Room 7 (BroadcastGroup)
//! Client B ──┘                         └── forwarder(B) ──► outbox(B) ──► B
//! ```
//!
//! The relay holds no board state. It authenticates the handshake, keeps
//! per-room presence, and fans client events out to the other members of
//! the event's room. Each membership gets its own forwarder task, so one
//! connection can sit in several rooms at once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use corkboard_core::{BoardId, PresenceUser};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomManager, RoomMessage};
use crate::config::{env_or, ConfigError};
use crate::protocol::{Frame, JoinRefused, OnlineUsers, UserJoined, UserLeft};
use crate::rooms::JoinOutcome;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per board room
    pub max_members_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            max_members_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `CORKBOARD_BIND_ADDR`, `CORKBOARD_MAX_MEMBERS`,
    /// `CORKBOARD_BROADCAST_CAPACITY` and `CORKBOARD_HEARTBEAT_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: env_or("CORKBOARD_BIND_ADDR", defaults.bind_addr)?,
            max_members_per_room: env_or("CORKBOARD_MAX_MEMBERS", defaults.max_members_per_room)?,
            broadcast_capacity: env_or("CORKBOARD_BROADCAST_CAPACITY", defaults.broadcast_capacity)?,
            heartbeat_interval_secs: env_or("CORKBOARD_HEARTBEAT_SECS", defaults.heartbeat_interval_secs)?,
        })
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub relayed_frames: u64,
    pub active_rooms: usize,
}

/// Maps a handshake credential to the user it belongs to.
///
/// Credential issuance lives outside the relay; this is only the lookup.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<PresenceUser>;
}

/// Fixed token table, loaded from a JSON object `{token: {userId, username}}`.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, PresenceUser>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: impl Into<String>, user: PresenceUser) -> Self {
        self.insert(token, user);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, user: PresenceUser) {
        self.users.insert(token.into(), user);
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let users = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { users })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, token: &str) -> Option<PresenceUser> {
        self.users.get(token).cloned()
    }
}

/// Resolve the `Authorization: Bearer` header of a handshake request.
fn authorize(resolver: &dyn CredentialResolver, request: &Request) -> Result<PresenceUser, ErrorResponse> {
    let user = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .and_then(|token| resolver.resolve(token.trim()));

    user.ok_or_else(|| {
        let mut response = ErrorResponse::new(Some("invalid or missing credential".to_string()));
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        response
    })
}

#[derive(Clone)]
struct RelayContext {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    resolver: Arc<dyn CredentialResolver>,
    stats: Arc<RwLock<ServerStats>>,
}

/// The relay server.
pub struct RelayServer {
    ctx: RelayContext,
}

impl RelayServer {
    pub fn new(config: ServerConfig, resolver: impl CredentialResolver + 'static) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity.max(1),
            config.max_members_per_room,
        ));
        Self {
            ctx: RelayContext {
                config,
                rooms,
                resolver: Arc::new(resolver),
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.ctx.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.ctx.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.ctx.rooms
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: RelayContext) -> Result<(), BoxError> {
    let mut identity = None;
    let resolver = ctx.resolver.clone();
    let handshake = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        let user = authorize(resolver.as_ref(), request)?;
        identity = Some(user);
        Ok(response)
    })
    .await;

    let ws_stream = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("Handshake with {addr} refused: {e}");
            return Ok(());
        }
    };
    let user = identity.ok_or("handshake completed without an identity")?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (outbox, mut outbox_rx) = mpsc::channel::<Message>(ctx.config.broadcast_capacity.max(1));

    log::info!("{} ({}) connected from {addr}", user.username, user.user_id);
    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut conn = Connection {
        id: Uuid::new_v4(),
        user,
        addr,
        ctx: ctx.clone(),
        outbox,
        memberships: HashMap::new(),
    };

    let mut heartbeat = tokio::time::interval(Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1)));
    heartbeat.tick().await;

    let result = async {
        loop {
            tokio::select! {
                incoming = ws_receiver.next() => match incoming {
                    Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                        Ok(frame) => {
                            if let Some(reply) = conn.handle_frame(frame).await {
                                ws_sender.send(Message::text(reply.encode()?)).await?;
                            }
                        }
                        Err(e) => log::warn!("Skipping frame from {addr}: {e}"),
                    },
                    Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                },

                Some(outgoing) = outbox_rx.recv() => ws_sender.send(outgoing).await?,

                _ = heartbeat.tick() => ws_sender.send(Message::Ping(Default::default())).await?,
            }
        }
        Ok::<(), BoxError>(())
    }
    .await;

    conn.leave_all().await;
    {
        let mut s = ctx.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = ctx.rooms.room_count().await;
    }
    result
}

struct Membership {
    room: Arc<BroadcastGroup>,
    forwarder: JoinHandle<()>,
}

/// One authenticated socket and the rooms it has joined.
struct Connection {
    id: Uuid,
    user: PresenceUser,
    addr: SocketAddr,
    ctx: RelayContext,
    outbox: mpsc::Sender<Message>,
    memberships: HashMap<BoardId, Membership>,
}

impl Connection {
    /// Handle one client frame. Returns a frame to send back directly.
    async fn handle_frame(&mut self, frame: Frame) -> Option<Frame> {
        match frame {
            Frame::JoinBoard(board_id) => self.join(board_id).await,
            Frame::LeaveBoard(board_id) => {
                self.leave(board_id).await;
                None
            }
            Frame::UserTyping(mut typing) => {
                typing.user_id = Some(self.user.user_id);
                self.relay(Frame::UserTyping(typing)).await;
                None
            }
            frame if frame.is_room_event() => {
                self.relay(frame).await;
                None
            }
            other => {
                log::warn!("Ignoring relay-only frame {} from {}", other.name(), self.addr);
                None
            }
        }
    }

    async fn join(&mut self, board_id: BoardId) -> Option<Frame> {
        if !self.memberships.contains_key(&board_id) {
            let joined = match self.ctx.rooms.join(board_id, self.id, self.user.clone()).await {
                Ok(joined) => joined,
                Err(full) => {
                    log::warn!("Refusing {} on board {board_id}: {full}", self.user.username);
                    return Some(Frame::JoinRefused(JoinRefused {
                        board_id,
                        reason: full.to_string(),
                    }));
                }
            };

            let forwarder = tokio::spawn(forward(joined.receiver, self.id, self.outbox.clone()));
            if joined.outcome == JoinOutcome::FirstSession {
                let announce = Frame::UserJoined(UserJoined {
                    user_id: self.user.user_id,
                    username: self.user.username.clone(),
                    board_id: Some(board_id),
                });
                if let Err(e) = joined.room.broadcast(self.id, &announce) {
                    log::warn!("Failed to announce join on board {board_id}: {e}");
                }
            }
            self.memberships.insert(
                board_id,
                Membership {
                    room: joined.room,
                    forwarder,
                },
            );
            self.refresh_room_count().await;
            log::info!("{} joined board {board_id}", self.user.username);
        } else {
            log::debug!("{} re-joined board {board_id}", self.user.username);
        }

        let membership = self.memberships.get(&board_id)?;
        Some(Frame::OnlineUsers(OnlineUsers {
            board_id,
            users: membership.room.online_users().await,
        }))
    }

    async fn leave(&mut self, board_id: BoardId) {
        let Some(membership) = self.memberships.remove(&board_id) else {
            log::debug!("{} left board {board_id} without joining", self.user.username);
            return;
        };
        membership.forwarder.abort();

        if let Some((room, departure)) = self.ctx.rooms.leave(board_id, &self.id).await {
            if departure.last_session {
                let frame = Frame::UserLeft(UserLeft {
                    user_id: departure.user.user_id,
                    board_id: Some(board_id),
                });
                if let Err(e) = room.broadcast(self.id, &frame) {
                    log::warn!("Failed to announce leave on board {board_id}: {e}");
                }
            }
        }
        self.refresh_room_count().await;
        log::info!("{} left board {board_id}", self.user.username);
    }

    async fn leave_all(&mut self) {
        let boards: Vec<BoardId> = self.memberships.keys().copied().collect();
        for board_id in boards {
            self.leave(board_id).await;
        }
    }

    /// Fan a mutation or typing event out to the rest of its room.
    async fn relay(&mut self, frame: Frame) {
        let Some(board_id) = frame.board_id() else {
            return;
        };
        let Some(membership) = self.memberships.get(&board_id) else {
            log::warn!(
                "Dropping {} from {}: not a member of board {board_id}",
                frame.name(),
                self.user.username
            );
            return;
        };
        match membership.room.broadcast(self.id, &frame) {
            Ok(_) => self.ctx.stats.write().await.relayed_frames += 1,
            Err(e) => log::warn!("Failed to relay {}: {e}", frame.name()),
        }
    }

    async fn refresh_room_count(&self) {
        let count = self.ctx.rooms.room_count().await;
        self.ctx.stats.write().await.active_rooms = count;
    }
}

/// Copy room traffic into one connection's outbox, skipping its own frames.
async fn forward(mut rx: broadcast::Receiver<Arc<RoomMessage>>, conn_id: Uuid, outbox: mpsc::Sender<Message>) {
    loop {
        match rx.recv().await {
            Ok(message) if message.origin == conn_id => continue,
            Ok(message) => {
                if outbox.send(Message::text(message.text.clone())).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(n)) => log::warn!("Connection {conn_id} lagged by {n} frames"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corkboard_core::UserId;
    use std::io::Write;

    fn request(authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("ws://localhost/");
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    fn credentials() -> StaticCredentials {
        StaticCredentials::new().with("tok-ana", PresenceUser::new(UserId(1), "ana"))
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:5000");
        assert_eq!(config.max_members_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_authorize_bearer() {
        let resolver = credentials();
        let user = authorize(&resolver, &request(Some("Bearer tok-ana"))).unwrap();
        assert_eq!(user.username, "ana");
    }

    #[test]
    fn test_authorize_rejects_unknown_or_missing() {
        let resolver = credentials();
        for header in [None, Some("Bearer nope"), Some("tok-ana")] {
            let err = authorize(&resolver, &request(header)).unwrap_err();
            assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn test_static_credentials_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"tok-bo": {{"userId": 2, "username": "bo"}}}}"#).unwrap();

        let creds = StaticCredentials::from_file(file.path()).unwrap();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds.resolve("tok-bo"), Some(PresenceUser::new(UserId(2), "bo")));
        assert!(creds.resolve("tok-ana").is_none());
    }

    #[test]
    fn test_static_credentials_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2").unwrap();
        assert!(matches!(
            StaticCredentials::from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            StaticCredentials::from_file("/definitely/not/here.json"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::new(ServerConfig::default(), credentials());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.relayed_frames, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:5000");
        assert_eq!(server.room_manager().room_count().await, 0);
    }
}
