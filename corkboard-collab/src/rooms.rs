//! Room membership bookkeeping shared by the relay and the loopback hub.
//!
//! Membership is per connection; presence is per user. A user with two
//! sessions in the same room shows up once, announced when the first
//! session joins and retired when the last one leaves.

use std::collections::{BTreeMap, HashMap};

use corkboard_core::{PresenceUser, UserId};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// This connection was already in the room; nothing changed.
    AlreadyMember,
    /// First session of this user; others should see `user-joined`.
    FirstSession,
    /// The user was already present through another connection.
    AdditionalSession,
}

/// A connection that left a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user: PresenceUser,
    /// No other session of this user remains; others should see `user-left`.
    pub last_session: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RoomMembers {
    sessions: HashMap<Uuid, PresenceUser>,
}

impl RoomMembers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&mut self, conn_id: Uuid, user: PresenceUser) -> JoinOutcome {
        if self.sessions.contains_key(&conn_id) {
            return JoinOutcome::AlreadyMember;
        }
        let present = self.is_present(user.user_id);
        self.sessions.insert(conn_id, user);
        if present {
            JoinOutcome::AdditionalSession
        } else {
            JoinOutcome::FirstSession
        }
    }

    pub fn leave(&mut self, conn_id: &Uuid) -> Option<Departure> {
        let user = self.sessions.remove(conn_id)?;
        let last_session = !self.is_present(user.user_id);
        Some(Departure { user, last_session })
    }

    pub fn is_present(&self, user_id: UserId) -> bool {
        self.sessions.values().any(|u| u.user_id == user_id)
    }

    pub fn contains(&self, conn_id: &Uuid) -> bool {
        self.sessions.contains_key(conn_id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Uuid> {
        self.sessions.keys()
    }

    /// Distinct users in the room, ordered by id.
    pub fn online_users(&self) -> Vec<PresenceUser> {
        let distinct: BTreeMap<UserId, &PresenceUser> =
            self.sessions.values().map(|u| (u.user_id, u)).collect();
        distinct.into_values().cloned().collect()
    }

    /// Number of connections (not users).
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
