//! Per-board fan-out for the relay.
//!
//! Every room owns one tokio broadcast channel. Frames are encoded once and
//! shared as `Arc<RoomMessage>`; each member's forwarder drops the frames it
//! originated itself, so a sender never hears its own events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use corkboard_core::{BoardId, PresenceUser};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ChannelError, Frame};
use crate::rooms::{Departure, JoinOutcome, RoomMembers};

/// One encoded frame travelling through a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessage {
    /// Connection that caused the frame; it is not delivered back there.
    pub origin: Uuid,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_members: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("room {board_id} is full ({max} members)")]
pub struct RoomFull {
    pub board_id: BoardId,
    pub max: usize,
}

/// Fan-out group for a single board room.
pub struct BroadcastGroup {
    board_id: BoardId,
    sender: broadcast::Sender<Arc<RoomMessage>>,
    members: RwLock<RoomMembers>,
    capacity: usize,
    max_members: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(board_id: BoardId, capacity: usize, max_members: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            board_id,
            sender,
            members: RwLock::new(RoomMembers::new()),
            capacity,
            max_members,
            messages_sent: AtomicU64::new(0),
        }
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a connection. Fails once the room holds `max_members`
    /// connections; a connection already inside is always accepted.
    pub async fn add_member(&self, conn_id: Uuid, user: PresenceUser) -> Result<JoinOutcome, RoomFull> {
        let mut members = self.members.write().await;
        if !members.contains(&conn_id) && members.len() >= self.max_members {
            return Err(RoomFull {
                board_id: self.board_id,
                max: self.max_members,
            });
        }
        Ok(members.join(conn_id, user))
    }

    pub async fn remove_member(&self, conn_id: &Uuid) -> Option<Departure> {
        self.members.write().await.leave(conn_id)
    }

    pub async fn has_member(&self, conn_id: &Uuid) -> bool {
        self.members.read().await.contains(conn_id)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn online_users(&self) -> Vec<PresenceUser> {
        self.members.read().await.online_users()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomMessage>> {
        self.sender.subscribe()
    }

    /// Encode `frame` once and fan it out. Returns the receiver count.
    pub fn broadcast(&self, origin: Uuid, frame: &Frame) -> Result<usize, ChannelError> {
        let text = frame.encode()?;
        Ok(self.broadcast_raw(Arc::new(RoomMessage { origin, text })))
    }

    pub fn broadcast_raw(&self, message: Arc<RoomMessage>) -> usize {
        let count = self.sender.send(message).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }
}

/// Result of [`RoomManager::join`].
pub struct Joined {
    pub room: Arc<BroadcastGroup>,
    pub outcome: JoinOutcome,
    /// Subscribed before the membership was recorded, so nothing sent
    /// after the join is missed.
    pub receiver: broadcast::Receiver<Arc<RoomMessage>>,
}

/// Maps board ids to their fan-out groups.
///
/// Joins and leaves take the map's write lock for their whole duration so a
/// room can never be dropped while someone is joining it.
pub struct RoomManager {
    rooms: RwLock<HashMap<BoardId, Arc<BroadcastGroup>>>,
    capacity: usize,
    max_members: usize,
}

impl RoomManager {
    pub fn new(capacity: usize, max_members: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_members,
        }
    }

    pub async fn join(&self, board_id: BoardId, conn_id: Uuid, user: PresenceUser) -> Result<Joined, RoomFull> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(board_id)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(board_id, self.capacity, self.max_members)))
            .clone();
        let receiver = room.subscribe();
        match room.add_member(conn_id, user).await {
            Ok(outcome) => Ok(Joined { room, outcome, receiver }),
            Err(full) => {
                if room.member_count().await == 0 {
                    rooms.remove(&board_id);
                }
                Err(full)
            }
        }
    }

    /// Remove a connection from a room, dropping the room once empty.
    pub async fn leave(&self, board_id: BoardId, conn_id: &Uuid) -> Option<(Arc<BroadcastGroup>, Departure)> {
        let mut rooms = self.rooms.write().await;
        let room = rooms.get(&board_id)?.clone();
        let departure = room.remove_member(conn_id).await?;
        if room.member_count().await == 0 {
            rooms.remove(&board_id);
            log::debug!("Room {board_id} removed (empty)");
        }
        Some((room, departure))
    }

    pub async fn get(&self, board_id: BoardId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(&board_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_boards(&self) -> Vec<BoardId> {
        self.rooms.read().await.keys().copied().collect()
    }
}
