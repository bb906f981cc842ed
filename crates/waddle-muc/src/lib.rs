//! # waddle-muc
//!
//! Multi-User Chat (XEP-0045) room and session-routing core for Waddle
//! Social.
//!
//! The crate owns room membership and stanza fan-out. It does not own
//! sockets: outbound stanzas leave through a [`PacketRouter`] supplied by
//! the embedding server, and idle users are probed through a
//! [`PresenceManager`].
//!
//! ## Architecture
//!
//! - **ChatServer**: registry of rooms (created on first join, removed when
//!   empty) and users (one per real address)
//! - **ChatUser**: routes a user's inbound stanzas to the rooms it occupies
//! - **ChatRoom**: membership, presence broadcast, history, private messages
//! - **Occupant**: a user's presence in one room, or the room's own voice
//! - **ConversationTracker**: groups traffic into conversations for
//!   archiving, fed from room events
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use waddle_muc::{ChannelRouter, ChatServer, MucConfig, RoutingPresenceManager};
//!
//! # fn main() -> Result<(), waddle_muc::MucError> {
//! let router = Arc::new(ChannelRouter::new());
//! let presence = Arc::new(RoutingPresenceManager::new(router.clone()));
//! let server = ChatServer::new(MucConfig::from_env(), router, presence)?;
//! # let _ = server;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conversation;
pub mod events;
pub mod metrics;
pub mod muc;
pub mod router;
pub mod stanza;
pub mod tasks;

mod error;
mod types;

pub use config::{AnnouncementConfig, ConversationConfig, HistoryType, MucConfig, RoomConfig};
pub use conversation::{
    spawn_conversation_worker, ConversationArchiver, ConversationEvent, ConversationFeed,
    ConversationKey, ConversationTracker,
};
pub use error::{stanza_error, stanza_error_element, MucError, StanzaErrorCondition, StanzaErrorType};
pub use events::MucEventListener;
pub use muc::{ChatRoom, ChatServer, ChatUser, Occupant, OccupantKind, RoomIqHandler};
pub use router::{
    ChannelRouter, OutboundStanza, PacketRouter, PresenceManager, RouteError, RoutingPresenceManager,
};
pub use stanza::Stanza;
pub use types::*;
