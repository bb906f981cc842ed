//! Conversation tracking for archiving and monitoring.
//!
//! A conversation is either a pair of users talking 1:1 or a room. It opens
//! on its first message, records who took part and when, and ends after an
//! idle period, after a maximum duration, or when its room is destroyed.

mod archive;
mod feed;
mod tracker;

pub use archive::{ArchiveError, ArchiveRecord, ConversationArchiver, InMemoryArchiver, NoopArchiver};
pub use feed::{spawn_conversation_worker, ConversationEvent, ConversationFeed};
pub use tracker::ConversationTracker;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use tracing::warn;
use uuid::Uuid;

/// What a conversation is between.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    /// Two users, bare addresses in sorted order
    OneToOne(BareJid, BareJid),
    /// Everyone in a room
    Room(BareJid),
}

impl ConversationKey {
    /// Key for a 1:1 conversation; the order of `a` and `b` does not matter.
    pub fn one_to_one(a: &Jid, b: &Jid) -> Self {
        let (a, b) = (a.to_bare(), b.to_bare());
        if a.to_string() <= b.to_string() {
            Self::OneToOne(a, b)
        } else {
            Self::OneToOne(b, a)
        }
    }

    pub fn room(room: &BareJid) -> Self {
        Self::Room(room.clone())
    }

    /// Label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OneToOne(..) => "one_to_one",
            Self::Room(_) => "room",
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneToOne(a, b) => write!(f, "{a}|{b}"),
            Self::Room(room) => write!(f, "{room}"),
        }
    }
}

/// Lifecycle of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// At least one participation is open
    Open,
    /// Nobody is participating but the conversation has not expired
    IdlePending,
    /// Finalised; stats are frozen
    Ended,
}

/// One continuous stretch of a user's participation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationParticipation {
    pub joined: DateTime<Utc>,
    pub left: Option<DateTime<Utc>>,
    pub nickname: Option<String>,
}

impl ConversationParticipation {
    pub fn is_open(&self) -> bool {
        self.left.is_none()
    }
}

/// All participations of one user in one conversation, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserParticipations {
    participations: Vec<ConversationParticipation>,
}

impl UserParticipations {
    pub fn participations(&self) -> &[ConversationParticipation] {
        &self.participations
    }

    /// The participation without a leave time, if any.
    pub fn current(&self) -> Option<&ConversationParticipation> {
        self.participations.last().filter(|p| p.is_open())
    }

    fn current_mut(&mut self) -> Option<&mut ConversationParticipation> {
        self.participations.last_mut().filter(|p| p.is_open())
    }
}

/// A tracked conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: Uuid,
    key: ConversationKey,
    external: bool,
    start: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    message_count: u64,
    ended_at: Option<DateTime<Utc>>,
    participants: HashMap<Jid, UserParticipations>,
}

impl Conversation {
    pub fn new(key: ConversationKey, external: bool, start: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            external,
            start,
            last_activity: start,
            message_count: 0,
            ended_at: None,
            participants: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// The room, for group conversations.
    pub fn room(&self) -> Option<&BareJid> {
        match &self.key {
            ConversationKey::Room(room) => Some(room),
            ConversationKey::OneToOne(..) => None,
        }
    }

    /// Whether one side of a 1:1 conversation is on another server.
    pub fn is_external(&self) -> bool {
        self.external
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn state(&self) -> ConversationState {
        if self.ended_at.is_some() {
            ConversationState::Ended
        } else if self.participants.values().any(|p| p.current().is_some()) {
            ConversationState::Open
        } else {
            ConversationState::IdlePending
        }
    }

    pub fn participants(&self) -> impl Iterator<Item = &Jid> {
        self.participants.keys()
    }

    pub fn participations(&self, user: &Jid) -> Option<&UserParticipations> {
        self.participants.get(user)
    }

    /// Whether the conversation has been idle longer than `idle` or has
    /// lasted longer than `max`, as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, idle: Duration, max: Duration) -> bool {
        let since_activity = (now - self.last_activity).to_std().unwrap_or_default();
        let since_start = (now - self.start).to_std().unwrap_or_default();
        since_activity > idle || since_start > max
    }

    /// Record a message. Ignored once the conversation has ended.
    pub fn message_received(&mut self, at: DateTime<Utc>) {
        if self.ended_at.is_some() {
            return;
        }
        self.message_count += 1;
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    /// Open a participation for `user`, closing a stale open one first.
    /// Returns the new participation.
    pub fn participant_joined(
        &mut self,
        user: &Jid,
        nickname: Option<&str>,
        at: DateTime<Utc>,
    ) -> Option<ConversationParticipation> {
        if self.ended_at.is_some() {
            return None;
        }
        let participations = self.participants.entry(user.clone()).or_default();
        if let Some(stale) = participations.current_mut() {
            warn!(
                conversation = %self.key,
                user = %user,
                "Found user that never left a previous conversation"
            );
            stale.left = Some(at);
        }
        let participation = ConversationParticipation {
            joined: at,
            left: None,
            nickname: nickname.map(str::to_string),
        };
        participations.participations.push(participation.clone());
        Some(participation)
    }

    /// Close the open participation of `user`. Returns it, or `None` (with
    /// a warning) when there was none.
    pub fn participant_left(&mut self, user: &Jid, at: DateTime<Utc>) -> Option<ConversationParticipation> {
        if self.ended_at.is_some() {
            return None;
        }
        match self.participants.get_mut(user).and_then(|p| p.current_mut()) {
            Some(participation) => {
                participation.left = Some(at);
                Some(participation.clone())
            }
            None => {
                warn!(
                    conversation = %self.key,
                    user = %user,
                    "Participant left without an open participation"
                );
                None
            }
        }
    }

    /// Finalise the conversation, closing every open participation.
    /// Returns the participations it closed.
    pub fn conversation_ended(&mut self, at: DateTime<Utc>) -> Vec<(Jid, ConversationParticipation)> {
        if self.ended_at.is_some() {
            return Vec::new();
        }
        self.ended_at = Some(at);
        let mut closed = Vec::new();
        for (user, participations) in self.participants.iter_mut() {
            if let Some(participation) = participations.current_mut() {
                participation.left = Some(at);
                closed.push((user.clone(), participation.clone()));
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    fn room_conversation() -> Conversation {
        let room: BareJid = "lobby@muc.example.com".parse().unwrap();
        Conversation::new(ConversationKey::room(&room), false, Utc::now())
    }

    #[test]
    fn test_one_to_one_key_is_symmetric() {
        let a = jid("alice@example.com/home");
        let b = jid("bob@example.com/work");
        assert_eq!(ConversationKey::one_to_one(&a, &b), ConversationKey::one_to_one(&b, &a));
        assert_eq!(ConversationKey::one_to_one(&a, &b).kind(), "one_to_one");
    }

    #[test]
    fn test_double_join_closes_stale_participation() {
        let mut conversation = room_conversation();
        let alice = jid("alice@example.com/home");
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(5);

        conversation.participant_joined(&alice, Some("alice"), t1);
        conversation.participant_joined(&alice, Some("alice"), t2);

        let participations = conversation.participations(&alice).unwrap().participations();
        assert_eq!(participations.len(), 2);
        assert_eq!(participations[0].left, Some(t2));
        assert!(participations[1].is_open());
        assert_eq!(participations.iter().filter(|p| p.is_open()).count(), 1);
        assert_eq!(conversation.state(), ConversationState::Open);
    }

    #[test]
    fn test_leave_without_join_is_tolerated() {
        let mut conversation = room_conversation();
        assert!(conversation
            .participant_left(&jid("ghost@example.com/x"), Utc::now())
            .is_none());
        assert_eq!(conversation.state(), ConversationState::IdlePending);
    }

    #[test]
    fn test_end_closes_open_participations() {
        let mut conversation = room_conversation();
        let start = Utc::now();
        conversation.participant_joined(&jid("alice@example.com/home"), Some("alice"), start);
        conversation.participant_joined(&jid("bob@example.com/work"), Some("bob"), start);
        conversation.participant_left(&jid("bob@example.com/work"), start);

        let end = start + chrono::Duration::minutes(1);
        let closed = conversation.conversation_ended(end);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].1.left, Some(end));
        assert_eq!(conversation.state(), ConversationState::Ended);

        // frozen
        conversation.message_received(end);
        assert_eq!(conversation.message_count(), 0);
        assert!(conversation.conversation_ended(end).is_empty());
    }

    #[test]
    fn test_expiry() {
        let start = Utc::now();
        let mut conversation = room_conversation();
        conversation.message_received(start);

        let idle = Duration::from_secs(600);
        let max = Duration::from_secs(3600);
        assert!(!conversation.is_expired(start + chrono::Duration::seconds(60), idle, max));
        assert!(conversation.is_expired(start + chrono::Duration::seconds(601), idle, max));
    }
}
