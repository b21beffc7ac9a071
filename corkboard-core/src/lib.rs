//! Pure domain layer of corkboard: board/list/card records, mutation events,
//! the ordering engine, optimistic collections and the view merge rules.
//!
//! Nothing in this crate performs I/O. The networked pieces live in
//! `corkboard-collab`.

pub mod collection;
pub mod error;
pub mod event;
pub mod model;
pub mod ordering;
pub mod validate;
pub mod view;

pub use collection::{OpId, OrderedCollection, RevertOutcome};
pub use error::{StoreError, SyncError};
pub use event::{MutationEvent, TypingEvent};
pub use model::{
    Board, BoardId, Card, CardId, CardPatch, CardPosition, CardStatus, CardUpdate, Credential, List,
    ListId, ListPatch, ListPosition, NewCard, Positioned, PresenceEntry, PresenceUser, UserId,
};
pub use ordering::{move_item, transfer, OrderingError, Reordered, Transferred};
pub use view::{BoardView, FilterReason, Merged};
