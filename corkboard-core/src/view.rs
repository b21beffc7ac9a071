//! Per-client cache of one open board, and the rules for merging remote
//! mutation events into it.
//!
//! Routing runs before merging: list events for another board and card
//! events for a list that is not rendered are dropped untouched. Updates and
//! deletes for identities the cache does not hold are reported as
//! [`SyncError::StaleMerge`]; callers log and ignore them.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::collection::{OpId, OrderedCollection, RevertOutcome};
use crate::error::SyncError;
use crate::event::{CardUpdated, MutationEvent, TypingEvent};
use crate::model::{BoardId, Card, CardId, List, ListId, UserId};

/// Why an event was discarded by the routing filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    OtherBoard,
    ListNotRendered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merged {
    Applied,
    /// A create for an identity already cached (usually our own REST insert).
    Duplicate,
    Filtered(FilterReason),
}

#[derive(Debug, Clone)]
pub struct BoardView {
    board_id: BoardId,
    local_user: UserId,
    lists: OrderedCollection<List>,
    /// Card collections of rendered lists only.
    cards: HashMap<ListId, OrderedCollection<Card>>,
    typing: BTreeMap<CardId, BTreeSet<UserId>>,
}

impl BoardView {
    pub fn new(board_id: BoardId, local_user: UserId) -> Self {
        Self {
            board_id,
            local_user,
            lists: OrderedCollection::new(),
            cards: HashMap::new(),
            typing: BTreeMap::new(),
        }
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    pub fn lists(&self) -> &OrderedCollection<List> {
        &self.lists
    }

    pub fn lists_mut(&mut self) -> &mut OrderedCollection<List> {
        &mut self.lists
    }

    pub fn cards(&self, list_id: ListId) -> Option<&OrderedCollection<Card>> {
        self.cards.get(&list_id)
    }

    pub fn cards_mut(&mut self, list_id: ListId) -> Option<&mut OrderedCollection<Card>> {
        self.cards.get_mut(&list_id)
    }

    pub fn is_rendered(&self, list_id: ListId) -> bool {
        self.cards.contains_key(&list_id)
    }

    /// Locate a cached card in any rendered list.
    pub fn find_card(&self, card_id: CardId) -> Option<&Card> {
        self.cards.values().find_map(|cards| cards.get(card_id))
    }

    /// Install a fresh list fetch; card collections of vanished lists go too.
    pub fn load_lists(&mut self, lists: Vec<List>) {
        self.lists.replace_all(lists);
        let live = self.lists.ids();
        self.cards.retain(|id, _| live.contains(id));
    }

    /// Install a fresh card fetch for one list, marking it rendered.
    pub fn load_cards(&mut self, list_id: ListId, cards: Vec<Card>) {
        self.cards
            .entry(list_id)
            .or_default()
            .replace_all(cards);
    }

    pub fn unload_cards(&mut self, list_id: ListId) {
        self.cards.remove(&list_id);
    }

    /// Optimistic ops still awaiting the store, across every collection.
    pub fn in_flight(&self) -> usize {
        self.lists.in_flight() + self.cards.values().map(OrderedCollection::in_flight).sum::<usize>()
    }

    /// The store accepted `op`; settle it in every collection that holds it.
    pub fn confirm_op(&mut self, op: OpId) -> bool {
        let mut held = self.lists.confirm(op);
        for cards in self.cards.values_mut() {
            held |= cards.confirm(op);
        }
        held
    }

    /// The store rejected `op`. An op spanning two lists is undone as one
    /// unit: while a newer op still builds on it in either list, neither
    /// list restores, and both pre-images wait on that newer op.
    pub fn revert_op(&mut self, op: OpId) -> RevertOutcome {
        let heir = std::iter::once(self.lists.successor(op))
            .chain(self.cards.values().map(|cards| cards.successor(op)))
            .flatten()
            .min();

        let outcomes: Vec<RevertOutcome> = match heir {
            Some(heir) => std::iter::once(self.lists.hand_off(op, heir))
                .chain(self.cards.values_mut().map(|cards| cards.hand_off(op, heir)))
                .collect(),
            None => std::iter::once(self.lists.revert(op))
                .chain(self.cards.values_mut().map(|cards| cards.revert(op)))
                .collect(),
        };
        if outcomes.contains(&RevertOutcome::Deferred) {
            RevertOutcome::Deferred
        } else if outcomes.contains(&RevertOutcome::Restored) {
            RevertOutcome::Restored
        } else {
            RevertOutcome::Superseded
        }
    }

    /// Merge one remote mutation event into the cache.
    pub fn apply(&mut self, event: &MutationEvent) -> Result<Merged, SyncError> {
        if event.board_id() != self.board_id {
            return Ok(Merged::Filtered(FilterReason::OtherBoard));
        }
        if let Some(list_id) = event.list_id() {
            if !self.is_rendered(list_id) {
                return Ok(Merged::Filtered(FilterReason::ListNotRendered));
            }
        }

        match event {
            MutationEvent::ListCreated(e) => {
                if !self.lists.insert_if_absent(e.list.clone()) {
                    return Ok(Merged::Duplicate);
                }
                // A new list has no cards yet, so it is rendered from the start.
                self.cards.entry(e.list.id).or_default();
                Ok(Merged::Applied)
            }
            MutationEvent::ListUpdated(e) => self
                .lists
                .patch(e.list.id, |list| e.list.apply_to(list))
                .map(|_| Merged::Applied)
                .ok_or(SyncError::StaleMerge {
                    kind: "list",
                    id: e.list.id.0,
                }),
            MutationEvent::ListDeleted(e) => {
                self.cards.remove(&e.list_id);
                self.lists
                    .remove(e.list_id)
                    .map(|_| Merged::Applied)
                    .ok_or(SyncError::StaleMerge {
                        kind: "list",
                        id: e.list_id.0,
                    })
            }
            MutationEvent::CardCreated(e) => {
                let cards = self.rendered_mut(e.list_id)?;
                Ok(dedupe(cards.insert_if_absent(e.card.clone())))
            }
            MutationEvent::CardUpdated(e) => self.apply_card_update(e),
            MutationEvent::CardDeleted(e) => {
                let card_id = e.card_id;
                self.typing.remove(&card_id);
                self.rendered_mut(e.list_id)?
                    .remove(card_id)
                    .map(|_| Merged::Applied)
                    .ok_or(SyncError::StaleMerge {
                        kind: "card",
                        id: card_id.0,
                    })
            }
        }
    }

    fn apply_card_update(&mut self, e: &CardUpdated) -> Result<Merged, SyncError> {
        let stale = SyncError::StaleMerge {
            kind: "card",
            id: e.card.id.0,
        };
        let source = self.rendered_mut(e.list_id)?;

        match e.card.list_id {
            Some(target) if target != e.list_id => {
                let mut card = source.remove(e.card.id).ok_or(stale)?;
                e.card.apply_to(&mut card);
                if let Some(cards) = self.cards.get_mut(&target) {
                    cards.insert_sorted(card);
                }
                Ok(Merged::Applied)
            }
            _ => source
                .patch(e.card.id, |card| e.card.apply_to(card))
                .map(|_| Merged::Applied)
                .ok_or(stale),
        }
    }

    fn rendered_mut(&mut self, list_id: ListId) -> Result<&mut OrderedCollection<Card>, SyncError> {
        // Routing already checked rendering; this only guards the invariant.
        self.cards
            .get_mut(&list_id)
            .ok_or(SyncError::StaleMerge {
                kind: "list",
                id: list_id.0,
            })
    }

    /// Track a remote typing indicator. Our own indicator is never shown.
    pub fn apply_typing(&mut self, event: &TypingEvent) -> bool {
        let Some(user_id) = event.user_id else {
            return false;
        };
        if event.board_id != self.board_id || user_id == self.local_user {
            return false;
        }
        if event.is_typing {
            self.typing.entry(event.card_id).or_default().insert(user_id)
        } else {
            let removed = self
                .typing
                .get_mut(&event.card_id)
                .is_some_and(|users| users.remove(&user_id));
            self.typing.retain(|_, users| !users.is_empty());
            removed
        }
    }

    pub fn typing_users(&self, card_id: CardId) -> Vec<UserId> {
        self.typing
            .get(&card_id)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Forget all typing indicators (e.g. after the channel drops).
    pub fn clear_typing(&mut self) {
        self.typing.clear();
    }
}

fn dedupe(inserted: bool) -> Merged {
    if inserted {
        Merged::Applied
    } else {
        Merged::Duplicate
    }
}
