//! Multi-User Chat (XEP-0045) rooms, occupants and users.
//!
//! Back-references are keys: an [`Occupant`] knows its room by name and
//! its user by real address, and the [`ChatServer`] is passed down every
//! call chain that needs to reach another entity.

pub mod history;
pub mod occupant;
pub mod presence;
pub mod room;
pub mod server;
pub mod user;

pub use history::{HistoryPolicy, HistoryStrategy, RoomHistory};
pub use occupant::{Occupant, OccupantKind};
pub use room::{ChatRoom, RoomIqHandler};
pub use server::ChatServer;
pub use user::ChatUser;
