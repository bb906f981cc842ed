//! MUC lifecycle notifications.
//!
//! Listeners are invoked synchronously, after the room's locks are
//! released. They must not block: anything slow belongs on a queue (see
//! [`crate::conversation::ConversationFeed`]).

use std::sync::{Arc, PoisonError, RwLock};

use jid::Jid;
use xmpp_parsers::message::Message;

use crate::muc::ChatRoom;

/// Observer of room and occupant lifecycle events. Every callback
/// defaults to a no-op.
#[allow(unused_variables)]
pub trait MucEventListener: Send + Sync {
    /// A room was created on demand.
    fn room_created(&self, room: &ChatRoom) {}

    /// The last occupant left and the room was removed from the service.
    fn room_destroyed(&self, room: &ChatRoom) {}

    /// A user joined a room under `nickname`.
    fn occupant_joined(&self, room: &ChatRoom, user: &Jid, nickname: &str) {}

    /// A user left a room.
    fn occupant_left(&self, room: &ChatRoom, user: &Jid, nickname: &str) {}

    /// An occupant changed nickname.
    fn nickname_changed(&self, room: &ChatRoom, user: &Jid, old_nickname: &str, new_nickname: &str) {}

    /// A groupchat message was broadcast. `sender` is the real address.
    fn message_received(&self, room: &ChatRoom, sender: &Jid, nickname: &str, message: &Message) {}

    /// A private message was delivered between two occupants (real addresses).
    fn private_message_received(&self, room: &ChatRoom, from: &Jid, to: &Jid, message: &Message) {}
}

/// Fan-out of events to the registered listeners.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: RwLock<Vec<Arc<dyn MucEventListener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn add_listener(&self, listener: Arc<dyn MucEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Remove a previously registered listener (by identity).
    pub fn remove_listener(&self, listener: &Arc<dyn MucEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Invoke `f` on every listener. The listener list is snapshotted so a
    /// callback may register or remove listeners.
    pub fn dispatch(&self, mut f: impl FnMut(&dyn MucEventListener)) {
        let snapshot: Vec<Arc<dyn MucEventListener>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in snapshot {
            f(listener.as_ref());
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
