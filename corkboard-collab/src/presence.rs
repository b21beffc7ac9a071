//! Who else is looking at a board right now.
//!
//! [`PresenceRoster`] is the pure bookkeeping: one roster of *other* users
//! per board the client cares about. The local user is filtered out no
//! matter what the relay sends, and the local viewer is always counted once
//! on top of the roster.
//!
//! [`PresenceTracker`] binds a roster to a [`BroadcastChannel`]: it joins and
//! leaves rooms, re-joins every cared-about board after connecting, and
//! wipes all rosters when the channel drops. A board the relay refuses is
//! dropped from the roster so reconnects do not ask for it again.
//!
//! Several local views may show the same board. The room is left only when
//! the last of them is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use corkboard_core::{BoardId, Credential, PresenceUser, SyncError, UserId};

use crate::channel::{BroadcastChannel, ChannelEvent, ChannelState, EventKind, SubscriptionId};

#[derive(Debug, Clone)]
pub struct PresenceRoster {
    local_user: UserId,
    boards: HashMap<BoardId, BTreeMap<UserId, PresenceUser>>,
    views: HashMap<BoardId, usize>,
}

impl PresenceRoster {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            boards: HashMap::new(),
            views: HashMap::new(),
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    /// Start caring about a board. Repeated calls leave the roster as is.
    pub fn join_board(&mut self, board_id: BoardId) {
        self.boards.entry(board_id).or_default();
    }

    pub fn leave_board(&mut self, board_id: BoardId) {
        self.boards.remove(&board_id);
        self.views.remove(&board_id);
    }

    /// One more local view of `board_id`. Returns how many are open.
    pub fn open_view(&mut self, board_id: BoardId) -> usize {
        self.join_board(board_id);
        let views = self.views.entry(board_id).or_default();
        *views += 1;
        *views
    }

    /// One local view of `board_id` closed. Returns whether it was the
    /// last, in which case the board is no longer tracked.
    pub fn close_view(&mut self, board_id: BoardId) -> bool {
        if let Some(views) = self.views.get_mut(&board_id) {
            *views = views.saturating_sub(1);
            if *views > 0 {
                return false;
            }
        }
        self.leave_board(board_id);
        true
    }

    pub fn boards(&self) -> Vec<BoardId> {
        let mut boards: Vec<BoardId> = self.boards.keys().copied().collect();
        boards.sort();
        boards
    }

    /// Forget every remote viewer; the set of cared-about boards survives.
    pub fn clear(&mut self) {
        for roster in self.boards.values_mut() {
            roster.clear();
        }
    }

    /// Fold one channel event into the rosters. Returns whether anything
    /// changed.
    pub fn apply(&mut self, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::OnlineUsers { board_id, users } => {
                let local_user = self.local_user;
                let Some(roster) = self.boards.get_mut(board_id) else {
                    return false;
                };
                let next: BTreeMap<UserId, PresenceUser> = users
                    .iter()
                    .filter(|u| u.user_id != local_user)
                    .map(|u| (u.user_id, u.clone()))
                    .collect();
                let changed = *roster != next;
                *roster = next;
                changed
            }
            ChannelEvent::UserJoined { board_id, user } => {
                if user.user_id == self.local_user {
                    return false;
                }
                let Some(board_id) = self.attribute(*board_id) else {
                    return false;
                };
                match self.boards.get_mut(&board_id) {
                    Some(roster) => roster.insert(user.user_id, user.clone()).as_ref() != Some(user),
                    None => false,
                }
            }
            ChannelEvent::UserLeft { board_id, user_id } => {
                let Some(board_id) = self.attribute(*board_id) else {
                    return false;
                };
                self.boards
                    .get_mut(&board_id)
                    .is_some_and(|roster| roster.remove(user_id).is_some())
            }
            ChannelEvent::JoinRefused { board_id, .. } => self.boards.remove(board_id).is_some(),
            ChannelEvent::Disconnected => {
                let had_any = self.boards.values().any(|r| !r.is_empty());
                self.clear();
                had_any
            }
            _ => false,
        }
    }

    /// Board an un-tagged presence change belongs to: only unambiguous when
    /// exactly one board is tracked.
    fn attribute(&self, board_id: Option<BoardId>) -> Option<BoardId> {
        match board_id {
            Some(id) => Some(id),
            None if self.boards.len() == 1 => self.boards.keys().next().copied(),
            None => {
                log::debug!("Ignoring presence change without boardId across {} boards", self.boards.len());
                None
            }
        }
    }

    /// Other users viewing `board_id`, ordered by id.
    pub fn online_users(&self, board_id: BoardId) -> Vec<PresenceUser> {
        self.boards
            .get(&board_id)
            .map(|roster| roster.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Distinct other viewers plus the local viewer.
    pub fn online_count(&self, board_id: BoardId) -> usize {
        self.boards.get(&board_id).map_or(0, BTreeMap::len) + 1
    }
}

/// Presence state machine bound to a broadcast channel.
pub struct PresenceTracker {
    channel: Arc<dyn BroadcastChannel>,
    roster: Arc<Mutex<PresenceRoster>>,
    subscriptions: Vec<(EventKind, SubscriptionId)>,
}

impl PresenceTracker {
    pub fn new(channel: Arc<dyn BroadcastChannel>, local_user: UserId) -> Self {
        let roster = Arc::new(Mutex::new(PresenceRoster::new(local_user)));
        let subscriptions = EventKind::PRESENCE
            .into_iter()
            .chain([EventKind::Disconnected])
            .map(|kind| {
                let roster = roster.clone();
                let id = channel.on(
                    kind,
                    Arc::new(move |event: &ChannelEvent| {
                        lock(&roster).apply(event);
                    }),
                );
                (kind, id)
            })
            .collect();

        Self {
            channel,
            roster,
            subscriptions,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Connect the channel, then (re-)join every board this client cares
    /// about. Idempotent.
    pub async fn connect(&self, credential: &Credential) -> Result<(), SyncError> {
        self.channel.connect(credential).await?;
        let boards = lock(&self.roster).boards();
        for board_id in boards {
            self.channel.join_room(board_id).await?;
        }
        Ok(())
    }

    /// Register presence on a board. Safe to repeat.
    pub async fn join_board(&self, board_id: BoardId) {
        lock(&self.roster).join_board(board_id);
        if !self.channel.is_connected() {
            log::debug!("Board {board_id} will be joined once the channel connects");
            return;
        }
        if let Err(e) = self.channel.join_room(board_id).await {
            log::warn!("Failed to join board {board_id}: {e}");
        }
    }

    pub async fn leave_board(&self, board_id: BoardId) {
        lock(&self.roster).leave_board(board_id);
        self.leave_room(board_id).await;
    }

    /// Join on behalf of one more local view of the board.
    pub async fn acquire_board(&self, board_id: BoardId) {
        let views = lock(&self.roster).open_view(board_id);
        log::debug!("Board {board_id} open in {views} view(s)");
        self.join_board(board_id).await;
    }

    /// Release one local view; the room is left with the last one.
    pub async fn release_board(&self, board_id: BoardId) {
        let last = lock(&self.roster).close_view(board_id);
        if !last {
            log::debug!("Board {board_id} still open elsewhere; staying in the room");
            return;
        }
        self.leave_room(board_id).await;
    }

    async fn leave_room(&self, board_id: BoardId) {
        if let Err(e) = self.channel.leave_room(board_id).await {
            log::debug!("Leaving board {board_id}: {e}");
        }
    }

    /// Close the channel. Every roster is emptied.
    pub async fn disconnect(&self) {
        self.channel.disconnect().await;
        lock(&self.roster).clear();
    }

    pub fn online_users(&self, board_id: BoardId) -> Vec<PresenceUser> {
        lock(&self.roster).online_users(board_id)
    }

    pub fn online_count(&self, board_id: BoardId) -> usize {
        lock(&self.roster).online_count(board_id)
    }

    pub fn boards(&self) -> Vec<BoardId> {
        lock(&self.roster).boards()
    }

    pub fn channel(&self) -> &Arc<dyn BroadcastChannel> {
        &self.channel
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        for (kind, id) in self.subscriptions.drain(..) {
            self.channel.off(kind, id);
        }
    }
}

fn lock(roster: &Mutex<PresenceRoster>) -> MutexGuard<'_, PresenceRoster> {
    roster.lock().unwrap_or_else(PoisonError::into_inner)
}
