//! In-process broadcast channel.
//!
//! `LoopbackHub` plays the relay for any number of `LoopbackChannel`s in the
//! same process, with the same room and presence rules: no echo to the
//! sender, `user-joined`/`user-left` on a user's first/last session, and
//! `online-users` to every joiner. Delivery is synchronous, which makes
//! multi-client scenarios deterministic in tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use corkboard_core::{BoardId, Credential, PresenceUser, SyncError};
use uuid::Uuid;

use crate::channel::{
    BroadcastChannel, ChannelEvent, ChannelState, EventKind, Handler, RoomEvent, SubscriptionId, Subscribers,
};
use crate::protocol::ChannelError;
use crate::rooms::{JoinOutcome, RoomMembers};

type Delivery = (Subscribers, ChannelEvent);

struct Endpoint {
    user: PresenceUser,
    subscribers: Subscribers,
    rooms: BTreeSet<BoardId>,
}

#[derive(Default)]
struct HubState {
    credentials: HashMap<String, PresenceUser>,
    rooms: HashMap<BoardId, RoomMembers>,
    endpoints: HashMap<Uuid, Endpoint>,
}

impl HubState {
    fn to_others(&self, board_id: BoardId, except: Uuid, event: ChannelEvent) -> Vec<Delivery> {
        let Some(room) = self.rooms.get(&board_id) else {
            return Vec::new();
        };
        room.connections()
            .filter(|conn| **conn != except)
            .filter_map(|conn| self.endpoints.get(conn))
            .map(|endpoint| (endpoint.subscribers.clone(), event.clone()))
            .collect()
    }

    fn join(&mut self, conn: Uuid, board_id: BoardId) -> Result<Vec<Delivery>, SyncError> {
        let endpoint = self.endpoints.get_mut(&conn).ok_or(SyncError::ChannelDisconnected)?;
        endpoint.rooms.insert(board_id);
        let user = endpoint.user.clone();
        let own = endpoint.subscribers.clone();

        let room = self.rooms.entry(board_id).or_default();
        let outcome = room.join(conn, user.clone());
        let users = room.online_users();

        let mut deliveries = Vec::new();
        if outcome == JoinOutcome::FirstSession {
            deliveries = self.to_others(
                board_id,
                conn,
                ChannelEvent::UserJoined {
                    board_id: Some(board_id),
                    user,
                },
            );
        }
        deliveries.push((own, ChannelEvent::OnlineUsers { board_id, users }));
        Ok(deliveries)
    }

    fn leave(&mut self, conn: Uuid, board_id: BoardId) -> Vec<Delivery> {
        if let Some(endpoint) = self.endpoints.get_mut(&conn) {
            endpoint.rooms.remove(&board_id);
        }
        let Some(room) = self.rooms.get_mut(&board_id) else {
            return Vec::new();
        };
        let departure = room.leave(&conn);
        if room.is_empty() {
            self.rooms.remove(&board_id);
        }
        match departure {
            Some(d) if d.last_session => self.to_others(
                board_id,
                conn,
                ChannelEvent::UserLeft {
                    board_id: Some(board_id),
                    user_id: d.user.user_id,
                },
            ),
            _ => Vec::new(),
        }
    }

    fn detach(&mut self, conn: Uuid) -> Vec<Delivery> {
        let boards: Vec<BoardId> = match self.endpoints.get(&conn) {
            Some(endpoint) => endpoint.rooms.iter().copied().collect(),
            None => return Vec::new(),
        };
        let deliveries: Vec<Delivery> = boards.into_iter().flat_map(|board| self.leave(conn, board)).collect();
        self.endpoints.remove(&conn);
        deliveries
    }

    fn publish(&self, conn: Uuid, event: RoomEvent) -> Result<Vec<Delivery>, SyncError> {
        let endpoint = self.endpoints.get(&conn).ok_or(SyncError::ChannelDisconnected)?;
        let board_id = event.board_id();
        if !endpoint.rooms.contains(&board_id) {
            log::warn!("Loopback dropping event from {}: not in board {board_id}", endpoint.user.username);
            return Ok(Vec::new());
        }
        let event = match event {
            RoomEvent::Mutation(e) => ChannelEvent::Mutation(e),
            RoomEvent::Typing(mut e) => {
                e.user_id = Some(endpoint.user.user_id);
                ChannelEvent::UserTyping(e)
            }
        };
        Ok(self.to_others(board_id, conn, event))
    }
}

fn deliver(deliveries: Vec<Delivery>) {
    for (subscribers, event) in deliveries {
        subscribers.dispatch(&event);
    }
}

/// Shared in-process relay.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `credential` as `user` on subsequent connects.
    pub fn register(&self, credential: &Credential, user: PresenceUser) {
        self.lock().credentials.insert(credential.expose().to_string(), user);
    }

    pub fn channel(&self) -> LoopbackChannel {
        LoopbackChannel {
            id: Uuid::new_v4(),
            hub: self.clone(),
            subscribers: Subscribers::new(),
            state: Mutex::new(ChannelState::Disconnected),
        }
    }

    /// Distinct users currently in a room.
    pub fn online_users(&self, board_id: BoardId) -> Vec<PresenceUser> {
        self.lock()
            .rooms
            .get(&board_id)
            .map(RoomMembers::online_users)
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One client's endpoint on a [`LoopbackHub`].
pub struct LoopbackChannel {
    id: Uuid,
    hub: LoopbackHub,
    subscribers: Subscribers,
    state: Mutex<ChannelState>,
}

impl LoopbackChannel {
    fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

#[async_trait]
impl BroadcastChannel for LoopbackChannel {
    async fn connect(&self, credential: &Credential) -> Result<(), SyncError> {
        if self.is_connected() {
            return Ok(());
        }
        {
            let mut hub = self.hub.lock();
            let user = hub
                .credentials
                .get(credential.expose())
                .cloned()
                .ok_or(ChannelError::Unauthorized)?;
            hub.endpoints.insert(
                self.id,
                Endpoint {
                    user,
                    subscribers: self.subscribers.clone(),
                    rooms: BTreeSet::new(),
                },
            );
        }
        self.set_state(ChannelState::Connected);
        self.subscribers.dispatch(&ChannelEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }
        let deliveries = self.hub.lock().detach(self.id);
        self.set_state(ChannelState::Disconnected);
        deliver(deliveries);
        self.subscribers.dispatch(&ChannelEvent::Disconnected);
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn join_room(&self, board_id: BoardId) -> Result<(), SyncError> {
        let deliveries = self.hub.lock().join(self.id, board_id)?;
        deliver(deliveries);
        Ok(())
    }

    async fn leave_room(&self, board_id: BoardId) -> Result<(), SyncError> {
        let deliveries = self.hub.lock().leave(self.id, board_id);
        deliver(deliveries);
        Ok(())
    }

    async fn emit(&self, event: RoomEvent) -> Result<(), SyncError> {
        let deliveries = self.hub.lock().publish(self.id, event)?;
        deliver(deliveries);
        Ok(())
    }

    fn on(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        self.subscribers.on(kind, handler)
    }

    fn off(&self, kind: EventKind, id: SubscriptionId) -> bool {
        self.subscribers.off(kind, id)
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        let deliveries = self.hub.lock().detach(self.id);
        deliver(deliveries);
    }
}
