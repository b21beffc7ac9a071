//! Board, list and card records as the authoritative store hands them out.
//!
//! The core never owns these records; it keeps a per-client cache of them
//! (see [`crate::view`]) that converges with the store over time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

id_type!(
    /// Store-issued board identity.
    BoardId
);
id_type!(
    /// Store-issued list identity.
    ListId
);
id_type!(
    /// Store-issued card identity.
    CardId
);
id_type!(
    /// Store-issued user identity.
    UserId
);

/// Records that live in an ordered sibling collection.
pub trait Positioned {
    type Id: Copy + Eq + std::hash::Hash + fmt::Debug + fmt::Display;

    fn id(&self) -> Self::Id;
    fn position(&self) -> i64;
    fn set_position(&mut self, position: i64);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Board {
    pub id: BoardId,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List {
    pub id: ListId,
    pub title: String,
    pub board_id: BoardId,
    /// Ordering key among the board's lists. Not required to be contiguous.
    pub position: i64,
}

impl Positioned for List {
    type Id = ListId;

    fn id(&self) -> ListId {
        self.id
    }

    fn position(&self) -> i64 {
        self.position
    }

    fn set_position(&mut self, position: i64) {
        self.position = position;
    }
}

/// Workflow column a card sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CardStatus {
    #[default]
    #[serde(rename = "To Do")]
    ToDo,
    #[serde(rename = "In Progress")]
    InProgress,
    #[serde(rename = "Done")]
    Done,
}

impl CardStatus {
    pub const ALL: [CardStatus; 3] = [CardStatus::ToDo, CardStatus::InProgress, CardStatus::Done];

    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::ToDo => "To Do",
            CardStatus::InProgress => "In Progress",
            CardStatus::Done => "Done",
        }
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: CardStatus,
    pub list_id: ListId,
    /// Denormalized so events about this card can be routed by board.
    pub board_id: BoardId,
    pub position: i64,
    #[serde(default)]
    pub assigned_to: Option<UserId>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
}

impl Positioned for Card {
    type Id = CardId;

    fn id(&self) -> CardId {
        self.id
    }

    fn position(&self) -> i64 {
        self.position
    }

    fn set_position(&mut self, position: i64) {
        self.position = position;
    }
}

/// Distinguishes "field absent" from "field explicitly null" in patches.
fn nullable<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

/// Partial list carried by `list-updated`. Absent fields are left untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListPatch {
    pub id: ListId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

impl ListPatch {
    pub fn position(id: ListId, position: i64) -> Self {
        Self {
            id,
            position: Some(position),
            ..Self::default()
        }
    }

    /// Shallow-merge into `list`. Returns true if the position changed.
    pub fn apply_to(&self, list: &mut List) -> bool {
        if let Some(title) = &self.title {
            list.title = title.clone();
        }
        match self.position {
            Some(position) if position != list.position => {
                list.position = position;
                true
            }
            _ => false,
        }
    }
}

impl From<&List> for ListPatch {
    fn from(list: &List) -> Self {
        Self {
            id: list.id,
            title: Some(list.title.clone()),
            position: Some(list.position),
        }
    }
}

/// Partial card carried by `card-updated`. Absent fields are left untouched;
/// `assigned_to`/`due_date` set to `null` clear the field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CardPatch {
    pub id: CardId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CardStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_id: Option<ListId>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<Option<UserId>>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<DateTime<Utc>>>,
}

impl CardPatch {
    pub fn position(id: CardId, list_id: ListId, position: i64) -> Self {
        Self {
            id,
            position: Some(position),
            list_id: Some(list_id),
            ..Self::default()
        }
    }

    pub fn status(id: CardId, status: CardStatus) -> Self {
        Self {
            id,
            status: Some(status),
            ..Self::default()
        }
    }

    /// Shallow-merge into `card`. Returns true if position or parent changed.
    pub fn apply_to(&self, card: &mut Card) -> bool {
        if let Some(title) = &self.title {
            card.title = title.clone();
        }
        if let Some(description) = &self.description {
            card.description = description.clone();
        }
        if let Some(status) = self.status {
            card.status = status;
        }
        if let Some(assigned_to) = self.assigned_to {
            card.assigned_to = assigned_to;
        }
        if let Some(due_date) = self.due_date {
            card.due_date = due_date;
        }
        let mut moved = false;
        if let Some(position) = self.position {
            moved |= position != card.position;
            card.position = position;
        }
        if let Some(list_id) = self.list_id {
            moved |= list_id != card.list_id;
            card.list_id = list_id;
        }
        moved
    }
}

impl From<&Card> for CardPatch {
    fn from(card: &Card) -> Self {
        Self {
            id: card.id,
            title: Some(card.title.clone()),
            description: Some(card.description.clone()),
            status: Some(card.status),
            position: Some(card.position),
            list_id: Some(card.list_id),
            assigned_to: Some(card.assigned_to),
            due_date: Some(card.due_date),
        }
    }
}

/// One viewer as the relay reports it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub user_id: UserId,
    pub username: String,
}

impl PresenceUser {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// One active viewer of one board.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PresenceEntry {
    pub user: PresenceUser,
    pub board_id: BoardId,
}

/// Opaque per-connection credential issued by the auth service.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Bulk list-position entry for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListPosition {
    pub id: ListId,
    pub position: i64,
}

/// Bulk card-position entry for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardPosition {
    pub id: CardId,
    pub position: i64,
    pub list_id: ListId,
}

/// Fields accepted by "create card".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NewCard {
    pub title: String,
    pub description: String,
    pub status: CardStatus,
    pub assigned_to: Option<UserId>,
    pub due_date: Option<DateTime<Utc>>,
}

impl NewCard {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Fields accepted by "update card". Mirrors the store's full-replace update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardUpdate {
    pub title: String,
    pub description: String,
    pub status: CardStatus,
    pub assigned_to: Option<UserId>,
    pub position: Option<i64>,
    pub list_id: Option<ListId>,
    pub due_date: Option<DateTime<Utc>>,
}

impl From<&Card> for CardUpdate {
    fn from(card: &Card) -> Self {
        Self {
            title: card.title.clone(),
            description: card.description.clone(),
            status: card.status,
            assigned_to: card.assigned_to,
            position: Some(card.position),
            list_id: Some(card.list_id),
            due_date: card.due_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card() -> Card {
        Card {
            id: CardId(1),
            title: "Write docs".into(),
            description: String::new(),
            status: CardStatus::ToDo,
            list_id: ListId(7),
            board_id: BoardId(3),
            position: 0,
            assigned_to: Some(UserId(9)),
            due_date: None,
        }
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&CardStatus::InProgress).unwrap();
        assert_eq!(json, "\"In Progress\"");
        let parsed: CardStatus = serde_json::from_str("\"To Do\"").unwrap();
        assert_eq!(parsed, CardStatus::ToDo);
    }

    #[test]
    fn test_card_patch_absent_vs_null() {
        let keep: CardPatch = serde_json::from_str(r#"{"id":1,"title":"x"}"#).unwrap();
        assert_eq!(keep.assigned_to, None);

        let clear: CardPatch = serde_json::from_str(r#"{"id":1,"assigned_to":null}"#).unwrap();
        assert_eq!(clear.assigned_to, Some(None));

        let mut c = card();
        keep.apply_to(&mut c);
        assert_eq!(c.assigned_to, Some(UserId(9)));
        assert_eq!(c.title, "x");
        clear.apply_to(&mut c);
        assert_eq!(c.assigned_to, None);
    }

    #[test]
    fn test_card_patch_reports_moves() {
        let mut c = card();
        assert!(!CardPatch::status(c.id, CardStatus::Done).apply_to(&mut c));
        assert_eq!(c.status, CardStatus::Done);
        assert!(CardPatch::position(c.id, ListId(8), 0).apply_to(&mut c));
        assert_eq!(c.list_id, ListId(8));
    }

    #[test]
    fn test_list_patch_merge() {
        let mut list = List {
            id: ListId(1),
            title: "Backlog".into(),
            board_id: BoardId(1),
            position: 2,
        };
        assert!(!ListPatch { id: ListId(1), title: Some("Todo".into()), position: None }.apply_to(&mut list));
        assert_eq!(list.title, "Todo");
        assert!(ListPatch::position(ListId(1), 0).apply_to(&mut list));
        assert_eq!(list.position, 0);
    }

    #[test]
    fn test_credential_debug_redacted() {
        let cred = Credential::new("secret-token");
        assert!(!format!("{cred:?}").contains("secret"));
        assert_eq!(cred.expose(), "secret-token");
    }

    #[test]
    fn test_presence_user_camel_case() {
        let user = PresenceUser::new(UserId(4), "dana");
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["userId"], 4);
        assert_eq!(json["username"], "dana");
    }
}
