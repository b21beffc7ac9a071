//! Mutation events exchanged between clients viewing the same board.
//!
//! Every event carries its routing keys (`boardId`, plus `listId` for card
//! events) so a receiver can drop it without asking the store anything.

use serde::{Deserialize, Serialize};

use crate::model::{BoardId, Card, CardId, CardPatch, List, ListId, ListPatch, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCreated {
    pub board_id: BoardId,
    pub list: List,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListUpdated {
    pub board_id: BoardId,
    pub list: ListPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDeleted {
    pub board_id: BoardId,
    pub list_id: ListId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardCreated {
    pub board_id: BoardId,
    pub list_id: ListId,
    pub card: Card,
}

/// `list_id` is the list the card was in before the update; a patch whose
/// own `list_id` differs moves the card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardUpdated {
    pub board_id: BoardId,
    pub list_id: ListId,
    pub card: CardPatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDeleted {
    pub board_id: BoardId,
    pub list_id: ListId,
    pub card_id: CardId,
}

/// A create/update/delete of a list or card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum MutationEvent {
    ListCreated(ListCreated),
    ListUpdated(ListUpdated),
    ListDeleted(ListDeleted),
    CardCreated(CardCreated),
    CardUpdated(CardUpdated),
    CardDeleted(CardDeleted),
}

impl MutationEvent {
    pub fn board_id(&self) -> BoardId {
        match self {
            MutationEvent::ListCreated(e) => e.board_id,
            MutationEvent::ListUpdated(e) => e.board_id,
            MutationEvent::ListDeleted(e) => e.board_id,
            MutationEvent::CardCreated(e) => e.board_id,
            MutationEvent::CardUpdated(e) => e.board_id,
            MutationEvent::CardDeleted(e) => e.board_id,
        }
    }

    /// Routing list for card events; `None` for list events.
    pub fn list_id(&self) -> Option<ListId> {
        match self {
            MutationEvent::CardCreated(e) => Some(e.list_id),
            MutationEvent::CardUpdated(e) => Some(e.list_id),
            MutationEvent::CardDeleted(e) => Some(e.list_id),
            _ => None,
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            MutationEvent::ListCreated(_) => "list-created",
            MutationEvent::ListUpdated(_) => "list-updated",
            MutationEvent::ListDeleted(_) => "list-deleted",
            MutationEvent::CardCreated(_) => "card-created",
            MutationEvent::CardUpdated(_) => "card-updated",
            MutationEvent::CardDeleted(_) => "card-deleted",
        }
    }

    pub fn list_created(list: List) -> Self {
        MutationEvent::ListCreated(ListCreated {
            board_id: list.board_id,
            list,
        })
    }

    pub fn list_updated(board_id: BoardId, list: ListPatch) -> Self {
        MutationEvent::ListUpdated(ListUpdated { board_id, list })
    }

    pub fn list_deleted(board_id: BoardId, list_id: ListId) -> Self {
        MutationEvent::ListDeleted(ListDeleted { board_id, list_id })
    }

    pub fn card_created(card: Card) -> Self {
        MutationEvent::CardCreated(CardCreated {
            board_id: card.board_id,
            list_id: card.list_id,
            card,
        })
    }

    pub fn card_updated(board_id: BoardId, list_id: ListId, card: CardPatch) -> Self {
        MutationEvent::CardUpdated(CardUpdated {
            board_id,
            list_id,
            card,
        })
    }

    pub fn card_deleted(board_id: BoardId, list_id: ListId, card_id: CardId) -> Self {
        MutationEvent::CardDeleted(CardDeleted {
            board_id,
            list_id,
            card_id,
        })
    }
}

/// Typing indicator. The relay fills in `user_id` before fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub board_id: BoardId,
    pub card_id: CardId,
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CardStatus;

    #[test]
    fn test_card_event_wire_shape() {
        let event = MutationEvent::card_deleted(BoardId(1), ListId(42), CardId(5));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "card-deleted");
        assert_eq!(json["data"]["boardId"], 1);
        assert_eq!(json["data"]["listId"], 42);
        assert_eq!(json["data"]["cardId"], 5);
    }

    #[test]
    fn test_routing_keys() {
        let patch = CardPatch::status(CardId(5), CardStatus::Done);
        let event = MutationEvent::card_updated(BoardId(1), ListId(42), patch);
        assert_eq!(event.board_id(), BoardId(1));
        assert_eq!(event.list_id(), Some(ListId(42)));
        assert_eq!(event.name(), "card-updated");

        let event = MutationEvent::list_deleted(BoardId(1), ListId(42));
        assert_eq!(event.list_id(), None);
    }

    #[test]
    fn test_decode_list_updated_from_wire() {
        let raw = r#"{"event":"list-updated","data":{"boardId":3,"list":{"id":9,"position":2}}}"#;
        let event: MutationEvent = serde_json::from_str(raw).unwrap();
        match event {
            MutationEvent::ListUpdated(e) => {
                assert_eq!(e.board_id, BoardId(3));
                assert_eq!(e.list.position, Some(2));
                assert_eq!(e.list.title, None);
            }
            other => panic!("Expected ListUpdated, got {other:?}"),
        }
    }
}
