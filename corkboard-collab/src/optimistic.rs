//! Optimistic mutation controller.
//!
//! Two phases, kept apart so the pure part can be tested without a store:
//!
//! ```text
//!   Command ──plan(&view)──▶ Plan ──apply()──▶ Ok(Commit)       events to emit
//!   (pure, may fail with              │
//!    InvalidArgument)                 └──────▶ Err(RevertToken) ──revert()──▶ SyncError
//! ```
//!
//! `apply` writes the planned state into the shared view *before* the store
//! round trip, then submits every affected sibling's position in one bulk
//! call. Each write is recorded in the collection's in-flight ledger under
//! its own [`OpId`], so reverting one operation never rolls back over a
//! newer one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use corkboard_core::{
    move_item, transfer, BoardView, Card, CardId, CardPatch, CardPosition, CardStatus, CardUpdate, List, ListId,
    ListPatch, ListPosition, MutationEvent, OpId, Positioned, SyncError,
};

use crate::store::BoardStore;

/// The per-client cache, shared between the controller, the event handlers
/// and readers. Guards are never held across an await.
pub type SharedView = Arc<Mutex<BoardView>>;

pub(crate) fn lock_view(view: &SharedView) -> MutexGuard<'_, BoardView> {
    view.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reorder siblings within one parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderCommand {
    Lists { source: usize, target: usize },
    Cards { list_id: ListId, source: usize, target: usize },
}

/// Move one card into another list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveCardCommand {
    pub from_list: ListId,
    pub to_list: ListId,
    pub source_index: usize,
    /// Insertion index in the receiving list; its length appends.
    pub target_index: usize,
}

/// Change a card's status column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCommand {
    pub card_id: CardId,
    pub status: CardStatus,
}

#[derive(Debug, Clone)]
enum Change {
    Lists(Vec<List>),
    Cards(ListId, Vec<Card>),
}

/// What goes to the store in one call.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    ListPositions(Vec<ListPosition>),
    CardPositions(Vec<CardPosition>),
    CardUpdate(CardId, CardUpdate),
}

/// A fully computed optimistic operation, not yet applied.
#[derive(Debug, Clone)]
pub struct Plan {
    op: OpId,
    changes: Vec<Change>,
    submission: Option<Submission>,
    events: Vec<MutationEvent>,
}

impl Plan {
    fn noop() -> Self {
        Self {
            op: OpId::next(),
            changes: Vec::new(),
            submission: None,
            events: Vec::new(),
        }
    }

    pub fn op(&self) -> OpId {
        self.op
    }

    /// Nothing would change; `apply` skips the store.
    pub fn is_noop(&self) -> bool {
        self.submission.is_none()
    }

    pub fn submission(&self) -> Option<&Submission> {
        self.submission.as_ref()
    }

    /// One event per sibling whose position or parent changes.
    pub fn events(&self) -> &[MutationEvent] {
        &self.events
    }

    /// The list order this plan would make visible, if it touches lists.
    pub fn lists(&self) -> Option<&[List]> {
        self.changes.iter().find_map(|change| match change {
            Change::Lists(lists) => Some(lists.as_slice()),
            Change::Cards(..) => None,
        })
    }

    /// The card order this plan would make visible in `list_id`.
    pub fn cards(&self, list_id: ListId) -> Option<&[Card]> {
        self.changes.iter().find_map(|change| match change {
            Change::Cards(id, cards) if *id == list_id => Some(cards.as_slice()),
            _ => None,
        })
    }
}

/// Clone `items` into the order given by `positions`, stamping each with
/// its new position.
fn reposition<T: Positioned + Clone>(items: &[T], positions: &[(T::Id, i64)]) -> Vec<T> {
    let by_id: HashMap<T::Id, &T> = items.iter().map(|item| (item.id(), item)).collect();
    positions
        .iter()
        .filter_map(|(id, position)| {
            let mut item = (*by_id.get(id)?).clone();
            item.set_position(*position);
            Some(item)
        })
        .collect()
}

fn rendered(view: &BoardView, list_id: ListId) -> Result<&[Card], SyncError> {
    view.cards(list_id)
        .map(|cards| cards.items())
        .ok_or_else(|| SyncError::InvalidArgument(format!("list {list_id} is not rendered")))
}

impl ReorderCommand {
    pub fn plan(&self, view: &BoardView) -> Result<Plan, SyncError> {
        match *self {
            ReorderCommand::Lists { source, target } => plan_lists(view, source, target),
            ReorderCommand::Cards {
                list_id,
                source,
                target,
            } => plan_cards(view, list_id, source, target),
        }
    }
}

fn plan_lists(view: &BoardView, source: usize, target: usize) -> Result<Plan, SyncError> {
    let current = view.lists().items();
    let reordered = move_item(&view.lists().ids(), source, target)?;
    if source == target {
        return Ok(Plan::noop());
    }

    let next = reposition(current, &reordered.positions);
    let events = current
        .iter()
        .filter_map(|old| {
            let moved = next.iter().find(|l| l.id == old.id)?;
            (moved.position != old.position)
                .then(|| MutationEvent::list_updated(view.board_id(), ListPatch::position(old.id, moved.position)))
        })
        .collect();
    let positions = next
        .iter()
        .map(|list| ListPosition {
            id: list.id,
            position: list.position,
        })
        .collect();

    Ok(Plan {
        op: OpId::next(),
        changes: vec![Change::Lists(next)],
        submission: Some(Submission::ListPositions(positions)),
        events,
    })
}

fn plan_cards(view: &BoardView, list_id: ListId, source: usize, target: usize) -> Result<Plan, SyncError> {
    let current = rendered(view, list_id)?;
    let ids: Vec<CardId> = current.iter().map(|c| c.id).collect();
    let reordered = move_item(&ids, source, target)?;
    if source == target {
        return Ok(Plan::noop());
    }

    let next = reposition(current, &reordered.positions);
    let board_id = view.board_id();
    let events = current
        .iter()
        .filter_map(|old| {
            let moved = next.iter().find(|c| c.id == old.id)?;
            (moved.position != old.position).then(|| {
                MutationEvent::card_updated(board_id, list_id, CardPatch::position(old.id, list_id, moved.position))
            })
        })
        .collect();

    Ok(Plan {
        op: OpId::next(),
        submission: Some(Submission::CardPositions(card_positions(&next))),
        changes: vec![Change::Cards(list_id, next)],
        events,
    })
}

fn card_positions(cards: &[Card]) -> Vec<CardPosition> {
    cards
        .iter()
        .map(|card| CardPosition {
            id: card.id,
            position: card.position,
            list_id: card.list_id,
        })
        .collect()
}

impl MoveCardCommand {
    /// Within one list this is a plain reorder. Across lists the moved
    /// card's event is routed by its *source* list, carrying the new
    /// `list_id` in the patch.
    pub fn plan(&self, view: &BoardView) -> Result<Plan, SyncError> {
        if self.from_list == self.to_list {
            return plan_cards(view, self.from_list, self.source_index, self.target_index);
        }
        let source = rendered(view, self.from_list)?;
        let target = rendered(view, self.to_list)?;
        let source_ids: Vec<CardId> = source.iter().map(|c| c.id).collect();
        let target_ids: Vec<CardId> = target.iter().map(|c| c.id).collect();
        let transferred = transfer(&source_ids, &target_ids, self.source_index, self.target_index)?;

        let remaining = reposition(source, &transferred.source.positions);
        let mut arriving: Vec<Card> = target.to_vec();
        if let Some(card) = source.get(self.source_index) {
            let mut card = card.clone();
            card.list_id = self.to_list;
            arriving.push(card);
        }
        let receiving = reposition(&arriving, &transferred.target.positions);

        let board_id = view.board_id();
        let mut events = Vec::new();
        if let Some(card) = receiving.iter().find(|c| c.id == transferred.moved) {
            events.push(MutationEvent::card_updated(
                board_id,
                self.from_list,
                CardPatch::position(card.id, self.to_list, card.position),
            ));
        }
        for (before, after, list_id) in [(source, &remaining, self.from_list), (target, &receiving, self.to_list)] {
            for old in before {
                if let Some(new) = after.iter().find(|c| c.id == old.id && c.position != old.position) {
                    events.push(MutationEvent::card_updated(
                        board_id,
                        list_id,
                        CardPatch::position(new.id, list_id, new.position),
                    ));
                }
            }
        }

        let mut positions = card_positions(&remaining);
        positions.extend(card_positions(&receiving));

        Ok(Plan {
            op: OpId::next(),
            changes: vec![
                Change::Cards(self.from_list, remaining),
                Change::Cards(self.to_list, receiving),
            ],
            submission: Some(Submission::CardPositions(positions)),
            events,
        })
    }
}

impl StatusCommand {
    pub fn plan(&self, view: &BoardView) -> Result<Plan, SyncError> {
        let card = view
            .find_card(self.card_id)
            .ok_or_else(|| SyncError::InvalidArgument(format!("card {} is not in view", self.card_id)))?;
        if card.status == self.status {
            return Ok(Plan::noop());
        }
        let list_id = card.list_id;
        let next: Vec<Card> = rendered(view, list_id)?
            .iter()
            .map(|c| {
                let mut c = c.clone();
                if c.id == self.card_id {
                    c.status = self.status;
                }
                c
            })
            .collect();

        let mut updated = card.clone();
        updated.status = self.status;

        Ok(Plan {
            op: OpId::next(),
            changes: vec![Change::Cards(list_id, next)],
            submission: Some(Submission::CardUpdate(self.card_id, CardUpdate::from(&updated))),
            events: vec![MutationEvent::card_updated(
                view.board_id(),
                list_id,
                CardPatch::status(self.card_id, self.status),
            )],
        })
    }
}

/// An optimistic operation the store accepted.
#[derive(Debug, Clone)]
pub struct Commit {
    pub op: OpId,
    /// Broadcast these to the room.
    pub events: Vec<MutationEvent>,
}

/// A failed operation whose optimistic write is still visible. Hand it to
/// [`OptimisticController::revert`].
#[must_use = "the optimistic write stays visible until the token is reverted"]
#[derive(Debug)]
pub struct RevertToken {
    op: OpId,
    error: SyncError,
}

impl RevertToken {
    pub fn op(&self) -> OpId {
        self.op
    }

    pub fn error(&self) -> &SyncError {
        &self.error
    }
}

pub struct OptimisticController {
    store: Arc<dyn BoardStore>,
    view: SharedView,
}

impl OptimisticController {
    pub fn new(store: Arc<dyn BoardStore>, view: SharedView) -> Self {
        Self { store, view }
    }

    pub fn view(&self) -> &SharedView {
        &self.view
    }

    /// Write `plan` locally, then submit it.
    pub async fn apply(&self, plan: Plan) -> Result<Commit, RevertToken> {
        let Plan {
            op,
            changes,
            submission,
            events,
        } = plan;
        let Some(submission) = submission else {
            return Ok(Commit { op, events });
        };
        {
            let mut view = lock_view(&self.view);
            for change in changes {
                match change {
                    Change::Lists(lists) => view.lists_mut().apply_optimistic(op, lists),
                    Change::Cards(list_id, cards) => match view.cards_mut(list_id) {
                        Some(collection) => collection.apply_optimistic(op, cards),
                        None => log::debug!("List {list_id} unloaded before {op:?} was applied"),
                    },
                }
            }
        }

        let submitted = match &submission {
            Submission::ListPositions(positions) => self.store.update_list_positions(positions).await,
            Submission::CardPositions(positions) => self.store.update_card_positions(positions).await,
            Submission::CardUpdate(card_id, update) => self.store.update_card(*card_id, update).await.map(|_| ()),
        };

        match submitted {
            Ok(()) => {
                lock_view(&self.view).confirm_op(op);
                Ok(Commit { op, events })
            }
            Err(e) => Err(RevertToken { op, error: e.into() }),
        }
    }

    /// Undo a failed operation and return its error for the caller to show.
    /// Both lists of a card move are undone together.
    pub fn revert(&self, token: RevertToken) -> SyncError {
        let RevertToken { op, error } = token;
        let outcome = lock_view(&self.view).revert_op(op);
        log::info!("Reverted {op:?} ({outcome:?}): {error}");
        error
    }

    async fn run(&self, plan: Result<Plan, SyncError>) -> Result<Commit, SyncError> {
        let plan = plan?;
        self.apply(plan).await.map_err(|token| self.revert(token))
    }

    pub async fn reorder(&self, command: ReorderCommand) -> Result<Commit, SyncError> {
        let plan = command.plan(&lock_view(&self.view));
        self.run(plan).await
    }

    pub async fn reorder_lists(&self, source: usize, target: usize) -> Result<Commit, SyncError> {
        self.reorder(ReorderCommand::Lists { source, target }).await
    }

    pub async fn reorder_cards(&self, list_id: ListId, source: usize, target: usize) -> Result<Commit, SyncError> {
        self.reorder(ReorderCommand::Cards {
            list_id,
            source,
            target,
        })
        .await
    }

    pub async fn move_card(&self, command: MoveCardCommand) -> Result<Commit, SyncError> {
        let plan = command.plan(&lock_view(&self.view));
        self.run(plan).await
    }

    pub async fn set_card_status(&self, card_id: CardId, status: CardStatus) -> Result<Commit, SyncError> {
        let plan = StatusCommand { card_id, status }.plan(&lock_view(&self.view));
        self.run(plan).await
    }
}
