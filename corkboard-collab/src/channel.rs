//! Client-side view of the broadcast channel.
//!
//! Components receive an `Arc<dyn BroadcastChannel>` rather than reaching
//! for a process-wide socket, so tests can hand them a [`LoopbackChannel`]
//! instead of a real [`ChannelClient`].
//!
//! [`LoopbackChannel`]: crate::loopback::LoopbackChannel
//! [`ChannelClient`]: crate::client::ChannelClient

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use corkboard_core::{BoardId, Credential, MutationEvent, PresenceUser, SyncError, TypingEvent, UserId};

use crate::protocol::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Something a client publishes to a room.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Mutation(MutationEvent),
    Typing(TypingEvent),
}

impl RoomEvent {
    pub fn board_id(&self) -> BoardId {
        match self {
            RoomEvent::Mutation(e) => e.board_id(),
            RoomEvent::Typing(e) => e.board_id,
        }
    }

    pub fn into_frame(self) -> Frame {
        match self {
            RoomEvent::Mutation(e) => Frame::from(e),
            RoomEvent::Typing(e) => Frame::UserTyping(e),
        }
    }
}

impl From<MutationEvent> for RoomEvent {
    fn from(event: MutationEvent) -> Self {
        RoomEvent::Mutation(event)
    }
}

impl From<TypingEvent> for RoomEvent {
    fn from(event: TypingEvent) -> Self {
        RoomEvent::Typing(event)
    }
}

/// Subscription key. One per variant of [`ChannelEvent`], with mutations
/// split by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    ListCreated,
    ListUpdated,
    ListDeleted,
    CardCreated,
    CardUpdated,
    CardDeleted,
    UserTyping,
    UserJoined,
    UserLeft,
    OnlineUsers,
    JoinRefused,
}

impl EventKind {
    pub const MUTATIONS: [EventKind; 6] = [
        EventKind::ListCreated,
        EventKind::ListUpdated,
        EventKind::ListDeleted,
        EventKind::CardCreated,
        EventKind::CardUpdated,
        EventKind::CardDeleted,
    ];

    pub const PRESENCE: [EventKind; 4] = [
        EventKind::UserJoined,
        EventKind::UserLeft,
        EventKind::OnlineUsers,
        EventKind::JoinRefused,
    ];
}

/// What subscribers receive.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Mutation(MutationEvent),
    UserTyping(TypingEvent),
    UserJoined {
        board_id: Option<BoardId>,
        user: PresenceUser,
    },
    UserLeft {
        board_id: Option<BoardId>,
        user_id: UserId,
    },
    OnlineUsers {
        board_id: BoardId,
        users: Vec<PresenceUser>,
    },
    /// The relay turned down a `join_room`; the room is not joined.
    JoinRefused {
        board_id: BoardId,
        reason: String,
    },
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Connected => EventKind::Connected,
            ChannelEvent::Disconnected => EventKind::Disconnected,
            ChannelEvent::Mutation(MutationEvent::ListCreated(_)) => EventKind::ListCreated,
            ChannelEvent::Mutation(MutationEvent::ListUpdated(_)) => EventKind::ListUpdated,
            ChannelEvent::Mutation(MutationEvent::ListDeleted(_)) => EventKind::ListDeleted,
            ChannelEvent::Mutation(MutationEvent::CardCreated(_)) => EventKind::CardCreated,
            ChannelEvent::Mutation(MutationEvent::CardUpdated(_)) => EventKind::CardUpdated,
            ChannelEvent::Mutation(MutationEvent::CardDeleted(_)) => EventKind::CardDeleted,
            ChannelEvent::UserTyping(_) => EventKind::UserTyping,
            ChannelEvent::UserJoined { .. } => EventKind::UserJoined,
            ChannelEvent::UserLeft { .. } => EventKind::UserLeft,
            ChannelEvent::OnlineUsers { .. } => EventKind::OnlineUsers,
            ChannelEvent::JoinRefused { .. } => EventKind::JoinRefused,
        }
    }

    /// Translate a frame received from the relay. Client-to-relay frames
    /// have no client-side meaning and yield `None`.
    pub fn from_frame(frame: Frame) -> Option<Self> {
        if let Some(mutation) = frame.mutation() {
            return Some(ChannelEvent::Mutation(mutation));
        }
        match frame {
            Frame::UserTyping(e) => Some(ChannelEvent::UserTyping(e)),
            Frame::UserJoined(e) => Some(ChannelEvent::UserJoined {
                board_id: e.board_id,
                user: e.user(),
            }),
            Frame::UserLeft(e) => Some(ChannelEvent::UserLeft {
                board_id: e.board_id,
                user_id: e.user_id,
            }),
            Frame::OnlineUsers(e) => Some(ChannelEvent::OnlineUsers {
                board_id: e.board_id,
                users: e.users,
            }),
            Frame::JoinRefused(e) => Some(ChannelEvent::JoinRefused {
                board_id: e.board_id,
                reason: e.reason,
            }),
            _ => None,
        }
    }
}

pub type Handler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Handler registry shared by channel implementations.
///
/// Handlers for one kind run in registration order. Dispatch snapshots the
/// handler list before calling out, so a handler may subscribe or
/// unsubscribe without deadlocking.
#[derive(Clone, Default)]
pub struct Subscribers {
    table: Arc<Mutex<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>>,
    next_id: Arc<AtomicU64>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().entry(kind).or_default().push((id, handler));
        id
    }

    pub fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut table = self.lock();
        let Some(handlers) = table.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        before != handlers.len()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map_or(0, Vec::len)
    }

    pub fn dispatch(&self, event: &ChannelEvent) {
        let handlers: Vec<Handler> = match self.lock().get(&event.kind()) {
            Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };
        for handler in handlers {
            handler(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<(SubscriptionId, Handler)>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Room-scoped, best-effort publish/subscribe transport.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    /// Open the channel. A no-op when already connected.
    async fn connect(&self, credential: &Credential) -> Result<(), SyncError>;

    /// Close the channel and forget every room membership.
    async fn disconnect(&self);

    fn state(&self) -> ChannelState;

    fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Ask to join a room. The room counts as joined once the relay
    /// answers with `online-users`; a `join-refused` answer leaves it out.
    async fn join_room(&self, board_id: BoardId) -> Result<(), SyncError>;

    async fn leave_room(&self, board_id: BoardId) -> Result<(), SyncError>;

    /// Publish to the other members of the event's room. Nothing is queued:
    /// while disconnected this fails with `ChannelDisconnected`.
    async fn emit(&self, event: RoomEvent) -> Result<(), SyncError>;

    fn on(&self, kind: EventKind, handler: Handler) -> SubscriptionId;

    fn off(&self, kind: EventKind, id: SubscriptionId) -> bool;
}
