//! # corkboard-collab: real-time board synchronization
//!
//! Relays list and card mutations between everyone viewing the same board,
//! tracks who is viewing, and keeps each client's cache in step with the
//! authoritative store.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   WebSocket    ┌──────────────┐
//! │ ChannelClient │ ◄────────────► │ RelayServer  │
//! │ (per client)  │   JSON frames  │ (stateless)  │
//! └──────┬────────┘                └──────┬───────┘
//!        │                                │
//!        ▼                                ▼
//! ┌───────────────┐                ┌──────────────┐
//! │ BoardSession  │                │ RoomManager  │
//! │  view, store, │                │ BroadcastGrp │
//! │  presence     │                │ per board    │
//! └──────┬────────┘                └──────────────┘
//!        │ REST
//!        ▼
//! ┌───────────────┐
//! │  BoardStore   │  authoritative lists and cards
//! └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames
//! - [`rooms`] / [`broadcast`]: per-board membership and fan-out
//! - [`server`]: the WebSocket relay
//! - [`channel`]: the client-side channel trait and handler registry
//! - [`client`]: WebSocket channel client
//! - [`loopback`]: in-process channel for tests
//! - [`presence`]: online rosters
//! - [`store`]: authoritative store (HTTP and in-memory)
//! - [`optimistic`]: optimistic reorders with per-operation rollback
//! - [`session`]: persisted sign-in
//! - [`board`]: one open board, wired together

pub mod board;
pub mod broadcast;
pub mod channel;
pub mod client;
pub mod config;
pub mod loopback;
pub mod optimistic;
pub mod presence;
pub mod protocol;
pub mod rooms;
pub mod server;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use board::{BoardSession, ClientContext};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use channel::{BroadcastChannel, ChannelEvent, ChannelState, EventKind, Handler, RoomEvent, SubscriptionId};
pub use client::ChannelClient;
pub use config::{ClientConfig, ConfigError};
pub use loopback::{LoopbackChannel, LoopbackHub};
pub use optimistic::{
    Commit, MoveCardCommand, OptimisticController, Plan, ReorderCommand, RevertToken, SharedView, StatusCommand,
};
pub use presence::{PresenceRoster, PresenceTracker};
pub use protocol::{ChannelError, Frame};
pub use server::{CredentialResolver, RelayServer, ServerConfig, ServerStats, StaticCredentials};
pub use session::{FileSessionStore, MemorySessionStore, Session, SessionStore, SessionUser};
pub use store::{BoardStore, HttpBoardStore, MemoryStore};
