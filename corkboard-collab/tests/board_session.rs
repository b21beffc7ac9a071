//! Multi-client board scenarios on the in-process hub and memory store.
//!
//! Delivery through `LoopbackHub` is synchronous, so every assertion can
//! run straight after the operation that caused it.

use std::sync::Arc;

use corkboard_collab::board::{BoardSession, ClientContext};
use corkboard_collab::config::ClientConfig;
use corkboard_collab::loopback::LoopbackHub;
use corkboard_collab::optimistic::MoveCardCommand;
use corkboard_collab::session::{MemorySessionStore, Session, SessionStore};
use corkboard_collab::store::MemoryStore;
use corkboard_core::{
    BoardId, CardStatus, CardUpdate, Credential, List, NewCard, PresenceUser, StoreError, SyncError, UserId,
};

const BOARD: BoardId = BoardId(1);

struct Fixture {
    hub: LoopbackHub,
    store: Arc<MemoryStore>,
    lists: Vec<List>,
}

impl Fixture {
    /// A board with lists A, B, C and no cards.
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let lists = ["A", "B", "C"].into_iter().map(|t| store.seed_list(BOARD, t)).collect();
        Self {
            hub: LoopbackHub::new(),
            store,
            lists,
        }
    }

    async fn client(&self, id: i64, name: &str) -> (Arc<ClientContext>, Arc<MemorySessionStore>) {
        let credential = Credential::new(format!("tok-{name}"));
        self.hub.register(&credential, PresenceUser::new(UserId(id), name));
        let session = Session::new(UserId(id), name, credential);
        let sessions = Arc::new(MemorySessionStore::with(session.clone()));
        let ctx = ClientContext::new(
            session,
            sessions.clone(),
            self.store.clone(),
            Arc::new(self.hub.channel()),
        );
        ctx.connect().await.unwrap();
        (Arc::new(ctx), sessions)
    }

    async fn open(&self, id: i64, name: &str) -> BoardSession {
        let (ctx, _) = self.client(id, name).await;
        BoardSession::open(ctx, BOARD).await.unwrap()
    }
}

fn titles(session: &BoardSession) -> Vec<String> {
    session.lists().into_iter().map(|l| l.title).collect()
}

fn card_titles(session: &BoardSession, list: &List) -> Vec<String> {
    session.cards(list.id).into_iter().map(|c| c.title).collect()
}

#[tokio::test]
async fn test_open_loads_lists_and_cards_in_order() {
    let fx = Fixture::new();
    fx.store.seed_card(&fx.lists[0], "first");
    fx.store.seed_card(&fx.lists[0], "second");

    let ana = fx.open(1, "ana").await;
    assert_eq!(titles(&ana), vec!["A", "B", "C"]);
    assert_eq!(card_titles(&ana, &fx.lists[0]), vec!["first", "second"]);
    assert_eq!(ana.online_count(), 1);
}

#[tokio::test]
async fn test_presence_between_sessions() {
    let fx = Fixture::new();
    let ana = fx.open(1, "ana").await;
    let bo = fx.open(2, "bo").await;
    assert_eq!(ana.online_count(), 2);
    assert_eq!(bo.online_users(), vec![PresenceUser::new(UserId(1), "ana")]);

    bo.close().await;
    assert_eq!(ana.online_count(), 1);
}

#[tokio::test]
async fn test_closing_one_of_two_views_keeps_presence() {
    let fx = Fixture::new();
    let (ctx, _) = fx.client(1, "ana").await;
    let first = BoardSession::open(ctx.clone(), BOARD).await.unwrap();
    let second = BoardSession::open(ctx, BOARD).await.unwrap();
    let bo = fx.open(2, "bo").await;
    assert_eq!(bo.online_count(), 2);

    first.close().await;
    assert_eq!(bo.online_count(), 2);
    assert_eq!(second.online_count(), 2);

    // The remaining view still receives room traffic.
    bo.create_list("Doing").await.unwrap();
    assert_eq!(titles(&second), vec!["A", "B", "C", "Doing"]);

    second.close().await;
    assert_eq!(bo.online_count(), 1);
}

#[tokio::test]
async fn test_created_list_and_card_reach_other_viewer_once() {
    let fx = Fixture::new();
    let ana = fx.open(1, "ana").await;
    let bo = fx.open(2, "bo").await;

    let doing = ana.create_list("  Doing ").await.unwrap();
    assert_eq!(doing.title, "Doing");
    assert_eq!(titles(&ana), vec!["A", "B", "C", "Doing"]);
    assert_eq!(titles(&bo), vec!["A", "B", "C", "Doing"]);

    let card = ana.create_card(doing.id, NewCard::titled("write tests")).await.unwrap();
    assert_eq!(card_titles(&ana, &doing), vec!["write tests"]);
    assert_eq!(card_titles(&bo, &doing), vec!["write tests"]);

    let mut update = CardUpdate::from(&card);
    update.title = "write more tests".to_string();
    ana.update_card(card.id, update).await.unwrap();
    assert_eq!(card_titles(&bo, &doing), vec!["write more tests"]);

    ana.delete_card(card.id).await.unwrap();
    assert!(card_titles(&bo, &doing).is_empty());

    ana.delete_list(doing.id).await.unwrap();
    assert_eq!(titles(&bo), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_invalid_input_never_reaches_store() {
    let fx = Fixture::new();
    let ana = fx.open(1, "ana").await;
    let calls = fx.store.calls();

    assert!(matches!(ana.create_list("   ").await, Err(SyncError::InvalidArgument(_))));
    assert!(matches!(
        ana.create_list(&"x".repeat(51)).await,
        Err(SyncError::InvalidArgument(_))
    ));
    let mut long = NewCard::titled("ok");
    long.description = "d".repeat(501);
    assert!(matches!(
        ana.create_card(fx.lists[0].id, long).await,
        Err(SyncError::InvalidArgument(_))
    ));
    assert_eq!(fx.store.calls(), calls);
}

#[tokio::test]
async fn test_reorder_is_broadcast() {
    let fx = Fixture::new();
    let ana = fx.open(1, "ana").await;
    let bo = fx.open(2, "bo").await;

    ana.reorder_lists(0, 2).await.unwrap();
    assert_eq!(titles(&ana), vec!["B", "C", "A"]);
    assert_eq!(titles(&bo), vec!["B", "C", "A"]);
}

#[tokio::test]
async fn test_failed_reorder_rolls_back_and_stays_local() {
    let fx = Fixture::new();
    let ana = fx.open(1, "ana").await;
    let bo = fx.open(2, "bo").await;

    fx.store.fail_next(1);
    let err = ana.reorder_lists(0, 1).await.unwrap_err();
    assert!(err.is_user_visible());
    assert_eq!(titles(&ana), vec!["A", "B", "C"]);
    assert_eq!(titles(&bo), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_rollback_reloads_changes_the_view_missed() {
    let fx = Fixture::new();
    let ana = fx.open(1, "ana").await;
    // Stands in for a remote create whose merge the rollback wiped out.
    fx.store.seed_list(BOARD, "D");
    fx.store.seed_card(&fx.lists[1], "late");

    fx.store.fail_next(1);
    ana.reorder_lists(0, 2).await.unwrap_err();
    assert_eq!(titles(&ana), vec!["A", "B", "C", "D"]);
    assert_eq!(card_titles(&ana, &fx.lists[1]), vec!["late"]);
}

#[tokio::test]
async fn test_rollback_during_outage_keeps_restored_view() {
    let fx = Fixture::new();
    let ana = fx.open(1, "ana").await;

    fx.store.set_offline(true);
    let err = ana.reorder_lists(0, 1).await.unwrap_err();
    assert!(err.is_user_visible());
    assert_eq!(titles(&ana), vec!["A", "B", "C"]);

    fx.store.set_offline(false);
    ana.reorder_lists(0, 1).await.unwrap();
    assert_eq!(titles(&ana), vec!["B", "A", "C"]);
}

#[tokio::test]
async fn test_card_move_between_lists_is_broadcast() {
    let fx = Fixture::new();
    let (todo, done) = (&fx.lists[0], &fx.lists[1]);
    fx.store.seed_card(todo, "x");
    fx.store.seed_card(todo, "y");
    fx.store.seed_card(done, "z");
    let ana = fx.open(1, "ana").await;
    let bo = fx.open(2, "bo").await;

    ana.move_card(MoveCardCommand {
        from_list: todo.id,
        to_list: done.id,
        source_index: 0,
        target_index: 0,
    })
    .await
    .unwrap();

    for session in [&ana, &bo] {
        assert_eq!(card_titles(session, todo), vec!["y"]);
        assert_eq!(card_titles(session, done), vec!["x", "z"]);
    }
    let moved = bo.cards(done.id).remove(0);
    assert_eq!(moved.list_id, done.id);
}

#[tokio::test]
async fn test_card_reorder_within_list() {
    let fx = Fixture::new();
    let list = &fx.lists[0];
    for title in ["a", "b", "c"] {
        fx.store.seed_card(list, title);
    }
    let ana = fx.open(1, "ana").await;
    let bo = fx.open(2, "bo").await;

    ana.reorder_cards(list.id, 2, 0).await.unwrap();
    assert_eq!(card_titles(&bo, list), vec!["c", "a", "b"]);
    assert!(ana.reorder_cards(list.id, 0, 3).await.is_err());
}

#[tokio::test]
async fn test_status_change_is_broadcast() {
    let fx = Fixture::new();
    let card = fx.store.seed_card(&fx.lists[0], "ship it");
    let ana = fx.open(1, "ana").await;
    let bo = fx.open(2, "bo").await;

    ana.set_card_status(card.id, CardStatus::InProgress).await.unwrap();
    assert_eq!(bo.cards(fx.lists[0].id)[0].status, CardStatus::InProgress);
    assert_eq!(fx.store.card(card.id).unwrap().status, CardStatus::InProgress);
}

#[tokio::test]
async fn test_other_boards_are_not_touched() {
    let fx = Fixture::new();
    let other = fx.store.seed_list(BoardId(2), "Elsewhere");
    let ana = fx.open(1, "ana").await;
    let (bo_ctx, _) = fx.client(2, "bo").await;
    let bo = BoardSession::open(bo_ctx, BoardId(2)).await.unwrap();

    ana.create_list("Doing").await.unwrap();
    assert_eq!(titles(&bo), vec![other.title.clone()]);
    assert_eq!(bo.online_count(), 1);
}

#[tokio::test]
async fn test_typing_indicator_excludes_self() {
    let fx = Fixture::new();
    let card = fx.store.seed_card(&fx.lists[0], "x");
    let ana = fx.open(1, "ana").await;
    let bo = fx.open(2, "bo").await;

    ana.set_typing(card.id, true).await;
    assert_eq!(bo.typing_users(card.id), vec![UserId(1)]);
    assert!(ana.typing_users(card.id).is_empty());

    ana.set_typing(card.id, false).await;
    assert!(bo.typing_users(card.id).is_empty());
}

#[tokio::test]
async fn test_refresh_picks_up_missed_changes() {
    let fx = Fixture::new();
    let ana = fx.open(1, "ana").await;
    fx.store.seed_list(BOARD, "D");
    fx.store.seed_card(&fx.lists[2], "late");

    ana.refresh().await.unwrap();
    assert_eq!(titles(&ana), vec!["A", "B", "C", "D"]);
    assert_eq!(card_titles(&ana, &fx.lists[2]), vec!["late"]);
}

#[tokio::test]
async fn test_rejected_credential_clears_session() {
    let fx = Fixture::new();
    let (ctx, sessions) = fx.client(1, "ana").await;
    let ana = BoardSession::open(ctx, BOARD).await.unwrap();

    fx.store.revoke_credentials();
    let err = ana.create_list("Doing").await.unwrap_err();
    assert_eq!(err, SyncError::StoreUnavailable(StoreError::Unauthorized));
    assert_eq!(sessions.load().unwrap(), None);
}

#[tokio::test]
async fn test_store_outage_blocks_open() {
    let fx = Fixture::new();
    let (ctx, sessions) = fx.client(1, "ana").await;
    fx.store.set_offline(true);
    assert!(matches!(
        BoardSession::open(ctx, BOARD).await,
        Err(SyncError::StoreUnavailable(StoreError::Transport(_)))
    ));
    assert!(sessions.load().unwrap().is_some());
}

#[test]
fn test_restore_without_session() {
    let sessions = Arc::new(MemorySessionStore::new());
    assert!(ClientContext::restore(&ClientConfig::default(), sessions)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_restore_with_session() {
    let session = Session::new(UserId(7), "dee", Credential::new("tok-dee"));
    let sessions = Arc::new(MemorySessionStore::with(session));
    let ctx = ClientContext::restore(&ClientConfig::default(), sessions)
        .unwrap()
        .expect("session should restore");
    assert_eq!(ctx.user(), UserId(7));
    assert_eq!(ctx.username(), "dee");
    assert!(!ctx.channel().is_connected());
}
