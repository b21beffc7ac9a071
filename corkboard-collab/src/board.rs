//! Client glue: one signed-in user ([`ClientContext`]) and one open board
//! ([`BoardSession`]).
//!
//! ```text
//!   BoardSession
//!     ├── store ──────────▶ authoritative writes and fetches
//!     ├── view  ◀── merge ─ channel handlers (remote mutations, typing)
//!     ├── controller ─────▶ optimistic reorders / moves / status
//!     └── presence ───────▶ room join / leave, online count
//! ```
//!
//! Every mutating operation goes store first, then the local view, then the
//! room. Broadcast failures are logged and swallowed; store failures are
//! returned.

use std::sync::Arc;

use corkboard_core::validate;
use corkboard_core::{
    BoardId, BoardView, Card, CardId, CardPatch, CardStatus, CardUpdate, List, ListId, Merged, MutationEvent,
    NewCard, PresenceUser, StoreError, SyncError, TypingEvent, UserId,
};

use crate::channel::{BroadcastChannel, ChannelEvent, EventKind, SubscriptionId};
use crate::client::ChannelClient;
use crate::config::ClientConfig;
use crate::optimistic::{lock_view, Commit, MoveCardCommand, OptimisticController, SharedView};
use crate::presence::PresenceTracker;
use crate::session::{Session, SessionStore};
use crate::store::{BoardStore, HttpBoardStore};

/// Everything a signed-in client shares across boards.
pub struct ClientContext {
    session: Session,
    sessions: Arc<dyn SessionStore>,
    store: Arc<dyn BoardStore>,
    presence: PresenceTracker,
}

impl ClientContext {
    pub fn new(
        session: Session,
        sessions: Arc<dyn SessionStore>,
        store: Arc<dyn BoardStore>,
        channel: Arc<dyn BroadcastChannel>,
    ) -> Self {
        let presence = PresenceTracker::new(channel, session.user.id);
        Self {
            session,
            sessions,
            store,
            presence,
        }
    }

    /// Resume the persisted session against the configured endpoints.
    /// `Ok(None)` when nobody is signed in.
    pub fn restore(config: &ClientConfig, sessions: Arc<dyn SessionStore>) -> Result<Option<Self>, SyncError> {
        let Some(session) = sessions.load()? else {
            return Ok(None);
        };
        let store = HttpBoardStore::new(config.api_url.clone(), session.credential.clone());
        let channel = ChannelClient::new(config.socket_url.clone());
        Ok(Some(Self::new(session, sessions, Arc::new(store), Arc::new(channel))))
    }

    pub fn user(&self) -> UserId {
        self.session.user.id
    }

    pub fn username(&self) -> &str {
        &self.session.user.username
    }

    pub fn store(&self) -> &Arc<dyn BoardStore> {
        &self.store
    }

    pub fn channel(&self) -> &Arc<dyn BroadcastChannel> {
        self.presence.channel()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Open the broadcast channel and rejoin every board already open.
    pub async fn connect(&self) -> Result<(), SyncError> {
        self.presence.connect(&self.session.credential).await
    }

    pub async fn sign_out(&self) -> Result<(), SyncError> {
        self.presence.disconnect().await;
        self.sessions.clear()
    }

    /// Route a failure through the session: a rejected credential signs
    /// the user out.
    pub(crate) fn observe(&self, error: SyncError) -> SyncError {
        if error == SyncError::StoreUnavailable(StoreError::Unauthorized) {
            log::warn!("Credential for {} rejected; clearing session", self.session.user.username);
            if let Err(e) = self.sessions.clear() {
                log::error!("Failed to clear session: {e}");
            }
        }
        error
    }
}

/// One open board.
pub struct BoardSession {
    ctx: Arc<ClientContext>,
    board_id: BoardId,
    view: SharedView,
    controller: OptimisticController,
    subscriptions: Vec<(EventKind, SubscriptionId)>,
    released: bool,
}

fn merge(view: &SharedView, event: &MutationEvent) {
    let name = event.name();
    match lock_view(view).apply(event) {
        Ok(Merged::Applied) => log::trace!("Merged {name}"),
        Ok(Merged::Duplicate) => log::debug!("Ignoring duplicate {name}"),
        Ok(Merged::Filtered(reason)) => log::trace!("Filtered {name}: {reason:?}"),
        Err(e) => log::debug!("Ignoring {name}: {e}"),
    }
}

impl BoardSession {
    /// Fetch the board, start merging room traffic into it, and join the
    /// room.
    pub async fn open(ctx: Arc<ClientContext>, board_id: BoardId) -> Result<Self, SyncError> {
        let mut view = BoardView::new(board_id, ctx.user());
        load(&ctx, &mut view).await?;
        let view: SharedView = Arc::new(std::sync::Mutex::new(view));

        let channel = ctx.channel().clone();
        let mut subscriptions = Vec::new();
        for kind in EventKind::MUTATIONS {
            let view = view.clone();
            let id = channel.on(
                kind,
                Arc::new(move |event: &ChannelEvent| {
                    if let ChannelEvent::Mutation(mutation) = event {
                        merge(&view, mutation);
                    }
                }),
            );
            subscriptions.push((kind, id));
        }
        let typing_view = view.clone();
        let id = channel.on(
            EventKind::UserTyping,
            Arc::new(move |event: &ChannelEvent| {
                if let ChannelEvent::UserTyping(typing) = event {
                    lock_view(&typing_view).apply_typing(typing);
                }
            }),
        );
        subscriptions.push((EventKind::UserTyping, id));
        let typing_view = view.clone();
        let id = channel.on(
            EventKind::Disconnected,
            Arc::new(move |_: &ChannelEvent| lock_view(&typing_view).clear_typing()),
        );
        subscriptions.push((EventKind::Disconnected, id));

        ctx.presence().acquire_board(board_id).await;
        log::info!("Opened board {board_id}");

        let controller = OptimisticController::new(ctx.store().clone(), view.clone());
        Ok(Self {
            ctx,
            board_id,
            view,
            controller,
            subscriptions,
            released: false,
        })
    }

    /// Stop merging and leave the room, unless another session still has
    /// the board open.
    pub async fn close(mut self) {
        self.unsubscribe();
        self.released = true;
        self.ctx.presence().release_board(self.board_id).await;
        log::info!("Closed board {}", self.board_id);
    }

    fn unsubscribe(&mut self) {
        let channel = self.ctx.channel();
        for (kind, id) in self.subscriptions.drain(..) {
            channel.off(kind, id);
        }
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    pub fn view(&self) -> &SharedView {
        &self.view
    }

    pub fn lists(&self) -> Vec<List> {
        lock_view(&self.view).lists().items().to_vec()
    }

    /// Cards of a rendered list, in order.
    pub fn cards(&self, list_id: ListId) -> Vec<Card> {
        lock_view(&self.view)
            .cards(list_id)
            .map(|cards| cards.items().to_vec())
            .unwrap_or_default()
    }

    pub fn typing_users(&self, card_id: CardId) -> Vec<UserId> {
        lock_view(&self.view).typing_users(card_id)
    }

    pub fn online_count(&self) -> usize {
        self.ctx.presence().online_count(self.board_id)
    }

    pub fn online_users(&self) -> Vec<PresenceUser> {
        self.ctx.presence().online_users(self.board_id)
    }

    /// Discard the cache and fetch the board again.
    pub async fn refresh(&self) -> Result<(), SyncError> {
        self.reload(false).await.map(|_| ())
    }

    /// Fetches the board and installs it. With `only_if_idle`, a view that
    /// picked up new optimistic ops during the fetch is left alone.
    async fn reload(&self, only_if_idle: bool) -> Result<bool, SyncError> {
        let mut fresh = BoardView::new(self.board_id, self.ctx.user());
        load(&self.ctx, &mut fresh).await?;
        let mut view = lock_view(&self.view);
        if only_if_idle && view.in_flight() > 0 {
            return Ok(false);
        }
        view.load_lists(fresh.lists().items().to_vec());
        for list in fresh.lists().items() {
            let cards = fresh.cards(list.id).map(|c| c.items().to_vec()).unwrap_or_default();
            view.load_cards(list.id, cards);
        }
        Ok(true)
    }

    pub async fn create_list(&self, title: &str) -> Result<List, SyncError> {
        let title = validate::list_title(title)?;
        let list = self
            .ctx
            .store()
            .create_list(self.board_id, &title)
            .await
            .map_err(|e| self.ctx.observe(e.into()))?;
        {
            let mut view = lock_view(&self.view);
            view.lists_mut().insert_sorted(list.clone());
            view.load_cards(list.id, Vec::new());
        }
        self.broadcast([MutationEvent::list_created(list.clone())]).await;
        Ok(list)
    }

    pub async fn delete_list(&self, list_id: ListId) -> Result<(), SyncError> {
        self.ctx
            .store()
            .delete_list(list_id)
            .await
            .map_err(|e| self.ctx.observe(e.into()))?;
        let event = MutationEvent::list_deleted(self.board_id, list_id);
        merge(&self.view, &event);
        self.broadcast([event]).await;
        Ok(())
    }

    pub async fn create_card(&self, list_id: ListId, card: NewCard) -> Result<Card, SyncError> {
        let card = validate::new_card(card)?;
        let created = self
            .ctx
            .store()
            .create_card(list_id, &card)
            .await
            .map_err(|e| self.ctx.observe(e.into()))?;
        let event = MutationEvent::card_created(created.clone());
        merge(&self.view, &event);
        self.broadcast([event]).await;
        Ok(created)
    }

    /// Replace a card's editable fields. The card must be in view.
    pub async fn update_card(&self, card_id: CardId, update: CardUpdate) -> Result<Card, SyncError> {
        let title = validate::card_title(&update.title)?;
        validate::card_description(&update.description)?;
        let update = CardUpdate { title, ..update };
        let list_id = self.list_of(card_id)?;

        let updated = self
            .ctx
            .store()
            .update_card(card_id, &update)
            .await
            .map_err(|e| self.ctx.observe(e.into()))?;
        let event = MutationEvent::card_updated(self.board_id, list_id, CardPatch::from(&updated));
        merge(&self.view, &event);
        self.broadcast([event]).await;
        Ok(updated)
    }

    pub async fn delete_card(&self, card_id: CardId) -> Result<(), SyncError> {
        let list_id = self.list_of(card_id)?;
        self.ctx
            .store()
            .delete_card(card_id)
            .await
            .map_err(|e| self.ctx.observe(e.into()))?;
        let event = MutationEvent::card_deleted(self.board_id, list_id, card_id);
        merge(&self.view, &event);
        self.broadcast([event]).await;
        Ok(())
    }

    pub async fn reorder_lists(&self, source: usize, target: usize) -> Result<(), SyncError> {
        let commit = self.controller.reorder_lists(source, target).await;
        self.committed(commit).await
    }

    pub async fn reorder_cards(&self, list_id: ListId, source: usize, target: usize) -> Result<(), SyncError> {
        let commit = self.controller.reorder_cards(list_id, source, target).await;
        self.committed(commit).await
    }

    pub async fn move_card(&self, command: MoveCardCommand) -> Result<(), SyncError> {
        let commit = self.controller.move_card(command).await;
        self.committed(commit).await
    }

    pub async fn set_card_status(&self, card_id: CardId, status: CardStatus) -> Result<(), SyncError> {
        let commit = self.controller.set_card_status(card_id, status).await;
        self.committed(commit).await
    }

    /// Tell the room the local user started or stopped typing on a card.
    pub async fn set_typing(&self, card_id: CardId, is_typing: bool) {
        let event = TypingEvent {
            board_id: self.board_id,
            card_id,
            is_typing,
            user_id: Some(self.ctx.user()),
        };
        if let Err(e) = self.ctx.channel().emit(event.into()).await {
            log::debug!("Not broadcasting user-typing: {e}");
        }
    }

    fn list_of(&self, card_id: CardId) -> Result<ListId, SyncError> {
        lock_view(&self.view)
            .find_card(card_id)
            .map(|card| card.list_id)
            .ok_or_else(|| SyncError::InvalidArgument(format!("card {card_id} is not in view")))
    }

    async fn committed(&self, commit: Result<Commit, SyncError>) -> Result<(), SyncError> {
        match commit {
            Ok(commit) => {
                self.broadcast(commit.events).await;
                Ok(())
            }
            Err(e) => {
                let e = self.ctx.observe(e);
                if matches!(&e, SyncError::StoreUnavailable(cause) if *cause != StoreError::Unauthorized) {
                    self.resync_after_rollback().await;
                }
                Err(e)
            }
        }
    }

    /// A rollback restores the pre-image, which drops remote merges that
    /// landed while the op was in flight. Once no other op is pending,
    /// reload so the view catches up with the store.
    async fn resync_after_rollback(&self) {
        if lock_view(&self.view).in_flight() > 0 {
            return;
        }
        match self.reload(true).await {
            Ok(true) => log::debug!("Reloaded board {} after rollback", self.board_id),
            Ok(false) => log::debug!("Skipped reload of board {}: new ops in flight", self.board_id),
            Err(e) => log::debug!("Reload of board {} after rollback failed: {e}", self.board_id),
        }
    }

    async fn broadcast(&self, events: impl IntoIterator<Item = MutationEvent>) {
        let channel = self.ctx.channel();
        for event in events {
            let name = event.name();
            if let Err(e) = channel.emit(event.into()).await {
                log::debug!("Not broadcasting {name}: {e}");
            }
        }
    }
}

impl Drop for BoardSession {
    fn drop(&mut self) {
        self.unsubscribe();
        if self.released {
            return;
        }
        // Dropped without close: release the room in the background.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ctx = self.ctx.clone();
                let board_id = self.board_id;
                handle.spawn(async move { ctx.presence().release_board(board_id).await });
            }
            Err(_) => log::warn!("Board {} dropped outside a runtime; room not left", self.board_id),
        }
    }
}

/// Fetch lists, then each list's cards, into `view`.
async fn load(ctx: &ClientContext, view: &mut BoardView) -> Result<(), SyncError> {
    let store = ctx.store();
    let lists = store
        .lists(view.board_id())
        .await
        .map_err(|e| ctx.observe(e.into()))?;
    let ids: Vec<ListId> = lists.iter().map(|l| l.id).collect();
    view.load_lists(lists);
    for list_id in ids {
        let cards = store.cards(list_id).await.map_err(|e| ctx.observe(e.into()))?;
        view.load_cards(list_id, cards);
    }
    log::debug!("Loaded board {}: {} lists", view.board_id(), view.lists().len());
    Ok(())
}
