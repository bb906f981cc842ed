//! Conversation state machine driver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::{BareJid, Jid};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ArchiveError, Conversation, ConversationArchiver, ConversationKey, NoopArchiver};
use crate::config::MucConfig;
use crate::error::MucError;
use crate::metrics;
use crate::tasks::spawn_periodic;

type SharedConversation = Arc<Mutex<Conversation>>;

/// Maps messages and room membership onto conversations.
///
/// Each conversation has its own lock; there is no tracker-wide lock.
/// Idle and max-duration expiry is enforced here, both lazily when a
/// message arrives and by [`Self::sweep_expired`].
pub struct ConversationTracker {
    idle_time: Duration,
    max_time: Duration,
    sweep_interval: Duration,
    local_domains: Vec<String>,
    archiver: Arc<dyn ConversationArchiver>,
    conversations: DashMap<ConversationKey, SharedConversation>,
    rosters: DashMap<BareJid, HashMap<Jid, String>>,
}

impl ConversationTracker {
    /// Create a tracker with the service's conversation windows. 1:1
    /// conversations are external when exactly one side is outside
    /// [`MucConfig::local_domains`].
    pub fn new(config: &MucConfig, archiver: Arc<dyn ConversationArchiver>) -> Self {
        let windows = &config.conversation;
        Self {
            idle_time: windows.idle_time(),
            max_time: windows.max_time(),
            sweep_interval: windows.sweep_interval(),
            local_domains: config.local_domains(),
            archiver,
            conversations: DashMap::new(),
            rosters: DashMap::new(),
        }
    }

    /// A tracker that archives nothing.
    pub fn without_archive(config: &MucConfig) -> Self {
        Self::new(config, Arc::new(NoopArchiver))
    }

    /// Snapshot of the live conversation for `key`.
    pub fn conversation(&self, key: &ConversationKey) -> Option<Conversation> {
        let shared = self.shared(key)?;
        let conversation = lock(&shared).clone();
        Some(conversation)
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    fn is_local(&self, jid: &Jid) -> bool {
        let domain = jid.domain().as_str().to_lowercase();
        self.local_domains.iter().any(|d| *d == domain)
    }

    /// Record a 1:1 message. Returns the id of the conversation it joined.
    pub fn process_message(&self, sender: &Jid, receiver: &Jid, at: DateTime<Utc>) -> Uuid {
        let key = ConversationKey::one_to_one(sender, receiver);
        let external = self.is_local(sender) != self.is_local(receiver);
        let participants = [sender.to_bare(), receiver.to_bare()];

        self.record_message(key, at, |start| {
            let mut conversation = Conversation::new(
                ConversationKey::one_to_one(sender, receiver),
                external,
                start,
            );
            for participant in &participants {
                conversation.participant_joined(&Jid::from(participant.clone()), None, start);
            }
            conversation
        })
    }

    /// Record a groupchat message. New room conversations start with the
    /// room's current occupants as participants.
    pub fn process_room_message(
        &self,
        room: &BareJid,
        sender: &Jid,
        nickname: &str,
        at: DateTime<Utc>,
    ) -> Uuid {
        let key = ConversationKey::room(room);
        let mut roster = self
            .rosters
            .get(room)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        roster
            .entry(sender.clone())
            .or_insert_with(|| nickname.to_string());

        self.record_message(key, at, |start| {
            let mut conversation = Conversation::new(ConversationKey::room(room), false, start);
            for (user, nick) in &roster {
                conversation.participant_joined(user, Some(nick), start);
            }
            conversation
        })
    }

    /// A user joined a room. Updates an ongoing room conversation, if any.
    pub fn joined_group_conversation(&self, room: &BareJid, user: &Jid, nickname: &str, at: DateTime<Utc>) {
        self.rosters
            .entry(room.clone())
            .or_default()
            .insert(user.clone(), nickname.to_string());

        let Some(shared) = self.shared(&ConversationKey::room(room)) else {
            return;
        };
        let mut conversation = lock(&shared);
        if let Some(participation) = conversation.participant_joined(user, Some(nickname), at) {
            self.archive("participant_joined", |a| {
                a.participant_joined(&conversation, user, &participation)
            });
        }
    }

    /// A user left a room. Updates an ongoing room conversation, if any.
    pub fn left_group_conversation(&self, room: &BareJid, user: &Jid, at: DateTime<Utc>) {
        if let Some(mut roster) = self.rosters.get_mut(room) {
            roster.remove(user);
        }
        self.rosters.remove_if(room, |_, roster| roster.is_empty());

        let Some(shared) = self.shared(&ConversationKey::room(room)) else {
            return;
        };
        let mut conversation = lock(&shared);
        if let Some(participation) = conversation.participant_left(user, at) {
            self.archive("participant_left", |a| {
                a.participant_left(&conversation, user, &participation)
            });
        }
    }

    /// The room was destroyed: end its conversation.
    pub fn room_conversation_ended(&self, room: &BareJid, at: DateTime<Utc>) {
        self.rosters.remove(room);
        let key = ConversationKey::room(room);
        if let Some(shared) = self.shared(&key) {
            self.end(&key, &shared, at);
        }
    }

    /// End every conversation expired as of `now`. Returns how many ended.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let snapshot: Vec<(ConversationKey, SharedConversation)> = self
            .conversations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut ended = 0;
        for (key, shared) in snapshot {
            let expired = lock(&shared).is_expired(now, self.idle_time, self.max_time);
            if expired && self.end(&key, &shared, now) {
                ended += 1;
            }
        }
        if ended > 0 {
            debug!(ended, "Expired idle conversations");
        }
        ended
    }

    /// Run [`Self::sweep_expired`] periodically until `shutdown`.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        spawn_periodic("conversation-expiry", self.sweep_interval, shutdown, move || {
            tracker.sweep_expired(Utc::now());
        })
    }

    fn shared(&self, key: &ConversationKey) -> Option<SharedConversation> {
        self.conversations.get(key).map(|entry| entry.value().clone())
    }

    /// Add a message to the live conversation for `key`, replacing it
    /// first if it expired. `create` receives the start time of a new
    /// conversation, one millisecond before the message.
    fn record_message(
        &self,
        key: ConversationKey,
        at: DateTime<Utc>,
        create: impl FnOnce(DateTime<Utc>) -> Conversation,
    ) -> Uuid {
        if let Some(shared) = self.shared(&key) {
            let mut conversation = lock(&shared);
            let live = conversation.ended_at().is_none()
                && !conversation.is_expired(at, self.idle_time, self.max_time);
            if live {
                conversation.message_received(at);
                self.archive("conversation_updated", |a| a.conversation_updated(&conversation));
                return conversation.id();
            }
            let last_activity = conversation.last_activity();
            drop(conversation);
            self.end(&key, &shared, last_activity);
        }

        let fresh = Arc::new(Mutex::new(create(at - chrono::Duration::milliseconds(1))));
        let shared = match self.conversations.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(vacant) => {
                vacant.insert(fresh.clone());
                self.started(&key, &fresh);
                fresh
            }
        };

        let mut conversation = lock(&shared);
        conversation.message_received(at);
        self.archive("conversation_updated", |a| a.conversation_updated(&conversation));
        conversation.id()
    }

    fn started(&self, key: &ConversationKey, shared: &SharedConversation) {
        let conversation = lock(shared);
        info!(conversation = %key, id = %conversation.id(), external = conversation.is_external(), "Conversation started");
        metrics::record_conversation("started", key.kind());

        self.archive("conversation_created", |a| a.conversation_created(&conversation));
        for user in conversation.participants() {
            if let Some(participation) = conversation
                .participations(user)
                .and_then(|p| p.current())
            {
                self.archive("participant_joined", |a| {
                    a.participant_joined(&conversation, user, participation)
                });
            }
        }
    }

    /// End and deregister `shared`. Returns false if it had already ended.
    fn end(&self, key: &ConversationKey, shared: &SharedConversation, at: DateTime<Utc>) -> bool {
        self.conversations
            .remove_if(key, |_, current| Arc::ptr_eq(current, shared));

        let mut conversation = lock(shared);
        if conversation.ended_at().is_some() {
            return false;
        }
        let closed = conversation.conversation_ended(at);
        for (user, participation) in &closed {
            self.archive("participant_left", |a| {
                a.participant_left(&conversation, user, participation)
            });
        }
        self.archive("conversation_ended", |a| a.conversation_ended(&conversation));

        info!(
            conversation = %key,
            id = %conversation.id(),
            messages = conversation.message_count(),
            "Conversation ended"
        );
        metrics::record_conversation("ended", key.kind());
        true
    }

    fn archive(
        &self,
        operation: &'static str,
        write: impl FnOnce(&dyn ConversationArchiver) -> Result<(), ArchiveError>,
    ) {
        if let Err(e) = write(self.archiver.as_ref()).map_err(MucError::from) {
            warn!(operation, error = %e, "Failed to archive conversation metadata");
        }
    }
}

fn lock(shared: &SharedConversation) -> MutexGuard<'_, Conversation> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
