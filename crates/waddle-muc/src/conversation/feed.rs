//! Bridge from room events to the conversation tracker.
//!
//! Room callbacks run on the delivery path, so the feed only copies the
//! event onto a channel. A worker task applies events to the tracker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use xmpp_parsers::message::Message;

use super::ConversationTracker;
use crate::events::MucEventListener;
use crate::muc::ChatRoom;

/// A room event relevant to conversation tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    Joined {
        room: BareJid,
        user: Jid,
        nickname: String,
        at: DateTime<Utc>,
    },
    Left {
        room: BareJid,
        user: Jid,
        at: DateTime<Utc>,
    },
    NicknameChanged {
        room: BareJid,
        user: Jid,
        nickname: String,
        at: DateTime<Utc>,
    },
    RoomMessage {
        room: BareJid,
        sender: Jid,
        nickname: String,
        at: DateTime<Utc>,
    },
    PrivateMessage {
        from: Jid,
        to: Jid,
        at: DateTime<Utc>,
    },
    RoomDestroyed {
        room: BareJid,
        at: DateTime<Utc>,
    },
}

impl ConversationTracker {
    /// Apply one room event.
    pub fn apply(&self, event: ConversationEvent) {
        trace!(?event, "Applying conversation event");
        match event {
            ConversationEvent::Joined {
                room,
                user,
                nickname,
                at,
            } => self.joined_group_conversation(&room, &user, &nickname, at),
            ConversationEvent::Left { room, user, at } => {
                self.left_group_conversation(&room, &user, at)
            }
            ConversationEvent::NicknameChanged {
                room,
                user,
                nickname,
                at,
            } => {
                self.left_group_conversation(&room, &user, at);
                self.joined_group_conversation(&room, &user, &nickname, at);
            }
            ConversationEvent::RoomMessage {
                room,
                sender,
                nickname,
                at,
            } => {
                self.process_room_message(&room, &sender, &nickname, at);
            }
            ConversationEvent::PrivateMessage { from, to, at } => {
                self.process_message(&from, &to, at);
            }
            ConversationEvent::RoomDestroyed { room, at } => {
                self.room_conversation_ended(&room, at)
            }
        }
    }
}

/// [`MucEventListener`] that queues events for a conversation worker.
/// Rooms with logging disabled are not tracked.
#[derive(Debug, Clone)]
pub struct ConversationFeed {
    tx: mpsc::UnboundedSender<ConversationEvent>,
}

impl ConversationFeed {
    pub fn new(tx: mpsc::UnboundedSender<ConversationEvent>) -> Self {
        Self { tx }
    }

    /// A feed and the receiving end for [`spawn_conversation_worker`].
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConversationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn push(&self, room: &ChatRoom, event: ConversationEvent) {
        if !room.config().enable_logging {
            return;
        }
        if self.tx.send(event).is_err() {
            debug!(room = %room.address(), "Conversation worker gone, dropping event");
        }
    }
}

impl MucEventListener for ConversationFeed {
    fn room_destroyed(&self, room: &ChatRoom) {
        self.push(
            room,
            ConversationEvent::RoomDestroyed {
                room: room.address().clone(),
                at: room.ended_at().unwrap_or_else(Utc::now),
            },
        );
    }

    fn occupant_joined(&self, room: &ChatRoom, user: &Jid, nickname: &str) {
        self.push(
            room,
            ConversationEvent::Joined {
                room: room.address().clone(),
                user: user.clone(),
                nickname: nickname.to_string(),
                at: Utc::now(),
            },
        );
    }

    fn occupant_left(&self, room: &ChatRoom, user: &Jid, _nickname: &str) {
        self.push(
            room,
            ConversationEvent::Left {
                room: room.address().clone(),
                user: user.clone(),
                at: Utc::now(),
            },
        );
    }

    fn nickname_changed(&self, room: &ChatRoom, user: &Jid, _old_nickname: &str, new_nickname: &str) {
        self.push(
            room,
            ConversationEvent::NicknameChanged {
                room: room.address().clone(),
                user: user.clone(),
                nickname: new_nickname.to_string(),
                at: Utc::now(),
            },
        );
    }

    fn message_received(&self, room: &ChatRoom, sender: &Jid, nickname: &str, _message: &Message) {
        self.push(
            room,
            ConversationEvent::RoomMessage {
                room: room.address().clone(),
                sender: sender.clone(),
                nickname: nickname.to_string(),
                at: Utc::now(),
            },
        );
    }

    fn private_message_received(&self, room: &ChatRoom, from: &Jid, to: &Jid, _message: &Message) {
        self.push(
            room,
            ConversationEvent::PrivateMessage {
                from: from.clone(),
                to: to.clone(),
                at: Utc::now(),
            },
        );
    }
}

/// Apply queued events to `tracker` until the feed is dropped or
/// `shutdown` is cancelled.
pub fn spawn_conversation_worker(
    tracker: Arc<ConversationTracker>,
    mut rx: mpsc::UnboundedReceiver<ConversationEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => tracker.apply(event),
                    None => break,
                },
            }
        }
        debug!("Conversation worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MucConfig;
    use crate::conversation::ConversationKey;

    fn tracker() -> Arc<ConversationTracker> {
        Arc::new(ConversationTracker::without_archive(&MucConfig::with_domain(
            "muc.example.com",
        )))
    }

    #[test]
    fn test_nickname_change_splits_participation() {
        let tracker = tracker();
        let room: BareJid = "lobby@muc.example.com".parse().unwrap();
        let alice: Jid = "alice@example.com/home".parse().unwrap();
        let now = Utc::now();

        tracker.apply(ConversationEvent::Joined {
            room: room.clone(),
            user: alice.clone(),
            nickname: "alice".to_string(),
            at: now,
        });
        tracker.apply(ConversationEvent::RoomMessage {
            room: room.clone(),
            sender: alice.clone(),
            nickname: "alice".to_string(),
            at: now,
        });
        tracker.apply(ConversationEvent::NicknameChanged {
            room: room.clone(),
            user: alice.clone(),
            nickname: "ally".to_string(),
            at: now,
        });

        let conversation = tracker.conversation(&ConversationKey::room(&room)).unwrap();
        let participations = conversation.participations(&alice).unwrap();
        assert_eq!(participations.participations().len(), 2);
        assert_eq!(
            participations.current().unwrap().nickname.as_deref(),
            Some("ally")
        );
    }

    #[tokio::test]
    async fn test_worker_stops_when_feed_dropped() {
        let tracker = tracker();
        let (feed, rx) = ConversationFeed::channel();
        let handle = spawn_conversation_worker(tracker.clone(), rx, CancellationToken::new());

        feed.tx
            .send(ConversationEvent::PrivateMessage {
                from: "a@example.com/x".parse().unwrap(),
                to: "b@example.com/y".parse().unwrap(),
                at: Utc::now(),
            })
            .unwrap();
        drop(feed);
        handle.await.unwrap();

        assert_eq!(tracker.conversation_count(), 1);
    }
}
