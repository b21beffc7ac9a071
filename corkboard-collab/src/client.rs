//! WebSocket implementation of [`BroadcastChannel`].
//!
//! Provides:
//! - Connection lifecycle (`Disconnected → Connecting → Connected`)
//! - Bearer credential on the handshake
//! - Room join/leave and fire-and-forget emits
//! - Room membership confirmed by the relay's answer to each join
//! - Dispatch of relay frames to registered handlers
//!
//! Emits while disconnected fail fast with `ChannelDisconnected`; nothing
//! is queued for later. Each connection carries a generation number so a
//! reader task that outlives its socket cannot tear down a newer one.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use corkboard_core::{BoardId, Credential, SyncError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::channel::{
    BroadcastChannel, ChannelEvent, ChannelState, EventKind, Handler, RoomEvent, SubscriptionId, Subscribers,
};
use crate::protocol::{ChannelError, Frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Link {
    outgoing: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Rooms asked for and rooms the relay has admitted us to.
#[derive(Debug, Default)]
struct Rooms {
    joined: BTreeSet<BoardId>,
    pending: BTreeSet<BoardId>,
}

impl Rooms {
    fn clear(&mut self) {
        self.joined.clear();
        self.pending.clear();
    }

    /// Fold the relay's answer to a `join-board` into membership.
    fn settle(&mut self, event: &ChannelEvent) {
        match event {
            ChannelEvent::OnlineUsers { board_id, .. } => {
                if self.pending.remove(board_id) {
                    self.joined.insert(*board_id);
                }
            }
            ChannelEvent::JoinRefused { board_id, reason } => {
                self.pending.remove(board_id);
                self.joined.remove(board_id);
                log::warn!("Relay refused board {board_id}: {reason}");
            }
            _ => {}
        }
    }
}

struct ClientInner {
    state: RwLock<ChannelState>,
    generation: AtomicU64,
    link: tokio::sync::Mutex<Option<Link>>,
    rooms: Mutex<Rooms>,
    subscribers: Subscribers,
}

impl ClientInner {
    fn state(&self) -> ChannelState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ChannelState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn rooms(&self) -> std::sync::MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The reader for `generation` saw its socket end.
    async fn connection_lost(&self, generation: u64) {
        let mut link = self.link.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if let Some(old) = link.take() {
            old.writer.abort();
        }
        drop(link);
        self.set_state(ChannelState::Disconnected);
        self.rooms().clear();
        log::warn!("Channel connection lost");
        self.subscribers.dispatch(&ChannelEvent::Disconnected);
    }
}

/// The WebSocket channel client.
pub struct ChannelClient {
    url: String,
    inner: Arc<ClientInner>,
}

impl ChannelClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            inner: Arc::new(ClientInner {
                state: RwLock::new(ChannelState::Disconnected),
                generation: AtomicU64::new(0),
                link: tokio::sync::Mutex::new(None),
                rooms: Mutex::new(Rooms::default()),
                subscribers: Subscribers::new(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Rooms the relay has admitted this connection to.
    pub fn rooms(&self) -> Vec<BoardId> {
        self.inner.rooms().joined.iter().copied().collect()
    }

    async fn open(&self, credential: &Credential) -> Result<WsStream, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|_| ChannelError::Handshake("credential is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _)) => Ok(ws),
            Err(tungstenite::Error::Http(response)) if response.status() == StatusCode::UNAUTHORIZED => {
                Err(ChannelError::Unauthorized)
            }
            Err(e) => Err(ChannelError::Handshake(e.to_string())),
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), SyncError> {
        if self.inner.state() != ChannelState::Connected {
            return Err(SyncError::ChannelDisconnected);
        }
        let outgoing = match self.inner.link.lock().await.as_ref() {
            Some(link) => link.outgoing.clone(),
            None => return Err(SyncError::ChannelDisconnected),
        };
        let text = frame.encode()?;
        outgoing
            .send(Message::text(text))
            .await
            .map_err(|_| SyncError::ChannelDisconnected)
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut outgoing: mpsc::Receiver<Message>) {
    while let Some(message) = outgoing.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() || closing {
            break;
        }
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, inner: Arc<ClientInner>, generation: u64) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                Ok(frame) => match ChannelEvent::from_frame(frame) {
                    Some(event) => {
                        inner.rooms().settle(&event);
                        inner.subscribers.dispatch(&event);
                    }
                    None => log::debug!("Ignoring client-only frame from relay"),
                },
                Err(e) => log::warn!("Skipping frame from relay: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                log::warn!("Channel read error: {e}");
                break;
            }
            Ok(_) => {}
        }
    }
    inner.connection_lost(generation).await;
}

#[async_trait]
impl BroadcastChannel for ChannelClient {
    async fn connect(&self, credential: &Credential) -> Result<(), SyncError> {
        let mut link = self.inner.link.lock().await;
        if link.is_some() && self.inner.state() == ChannelState::Connected {
            log::debug!("Channel already connected to {}", self.url);
            return Ok(());
        }
        if let Some(stale) = link.take() {
            stale.reader.abort();
            stale.writer.abort();
        }

        self.inner.set_state(ChannelState::Connecting);
        let ws = match self.open(credential).await {
            Ok(ws) => ws,
            Err(e) => {
                self.inner.set_state(ChannelState::Disconnected);
                log::warn!("Channel connect to {} failed: {e}", self.url);
                return Err(e.into());
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, stream) = ws.split();
        let (outgoing, outgoing_rx) = mpsc::channel(256);
        self.inner.set_state(ChannelState::Connected);

        let writer = tokio::spawn(write_loop(sink, outgoing_rx));
        let reader = tokio::spawn(read_loop(stream, self.inner.clone(), generation));
        *link = Some(Link {
            outgoing,
            reader,
            writer,
        });
        drop(link);

        log::info!("Channel connected to {}", self.url);
        self.inner.subscribers.dispatch(&ChannelEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        let mut link = self.inner.link.lock().await;
        // Retire the generation first so the reader's exit is not reported.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let Some(old) = link.take() else {
            self.inner.set_state(ChannelState::Disconnected);
            return;
        };
        drop(link);

        old.reader.abort();
        if old.outgoing.send(Message::Close(None)).await.is_err() {
            old.writer.abort();
        }
        self.inner.set_state(ChannelState::Disconnected);
        self.inner.rooms().clear();
        log::info!("Channel disconnected from {}", self.url);
        self.inner.subscribers.dispatch(&ChannelEvent::Disconnected);
    }

    fn state(&self) -> ChannelState {
        self.inner.state()
    }

    async fn join_room(&self, board_id: BoardId) -> Result<(), SyncError> {
        // Pending before the frame leaves, so a fast answer finds it.
        self.inner.rooms().pending.insert(board_id);
        if let Err(e) = self.send(Frame::JoinBoard(board_id)).await {
            self.inner.rooms().pending.remove(&board_id);
            return Err(e);
        }
        Ok(())
    }

    async fn leave_room(&self, board_id: BoardId) -> Result<(), SyncError> {
        let was_member = {
            let mut rooms = self.inner.rooms();
            let was_pending = rooms.pending.remove(&board_id);
            rooms.joined.remove(&board_id) || was_pending
        };
        if !was_member {
            return Ok(());
        }
        match self.send(Frame::LeaveBoard(board_id)).await {
            Err(SyncError::ChannelDisconnected) => Ok(()),
            other => other,
        }
    }

    async fn emit(&self, event: RoomEvent) -> Result<(), SyncError> {
        let frame = event.into_frame();
        let name = frame.name();
        self.send(frame).await.inspect_err(|e| log::debug!("Dropping {name}: {e}"))
    }

    fn on(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        self.inner.subscribers.on(kind, handler)
    }

    fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.inner.subscribers.off(kind, id)
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        if let Ok(mut link) = self.inner.link.try_lock() {
            if let Some(old) = link.take() {
                old.reader.abort();
                old.writer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corkboard_core::{ListId, MutationEvent};

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = ChannelClient::new("ws://127.0.0.1:1");
        assert_eq!(client.state(), ChannelState::Disconnected);
        assert!(!client.is_connected());
        assert!(client.rooms().is_empty());
        assert_eq!(client.url(), "ws://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_emit_while_disconnected_is_dropped() {
        let client = ChannelClient::new("ws://127.0.0.1:1");
        let event = MutationEvent::list_deleted(BoardId(1), ListId(2));
        assert_eq!(client.emit(event.into()).await, Err(SyncError::ChannelDisconnected));
        assert_eq!(client.join_room(BoardId(1)).await, Err(SyncError::ChannelDisconnected));
        assert!(client.rooms().is_empty());
    }

    #[tokio::test]
    async fn test_leave_unjoined_room_is_ok() {
        let client = ChannelClient::new("ws://127.0.0.1:1");
        assert_eq!(client.leave_room(BoardId(1)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = ChannelClient::new(format!("ws://127.0.0.1:{port}"));
        let result = client.connect(&Credential::new("tok")).await;
        assert!(result.is_err());
        assert_eq!(client.state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_rooms_settle_on_relay_answer() {
        let mut rooms = Rooms::default();
        rooms.pending.insert(BoardId(1));
        rooms.pending.insert(BoardId(2));

        rooms.settle(&ChannelEvent::OnlineUsers {
            board_id: BoardId(1),
            users: vec![],
        });
        rooms.settle(&ChannelEvent::JoinRefused {
            board_id: BoardId(2),
            reason: "full".into(),
        });
        assert_eq!(rooms.joined.iter().copied().collect::<Vec<_>>(), vec![BoardId(1)]);
        assert!(rooms.pending.is_empty());

        // An answer nobody asked for does not add a room.
        rooms.settle(&ChannelEvent::OnlineUsers {
            board_id: BoardId(3),
            users: vec![],
        });
        assert!(!rooms.joined.contains(&BoardId(3)));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let client = ChannelClient::new("not a url");
        let err = client.connect(&Credential::new("tok")).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
