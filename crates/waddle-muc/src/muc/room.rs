//! Chat room: occupant set, history and lifecycle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::BareJid;
use minidom::Element;
use tracing::{debug, info, instrument, warn};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::presence::Presence;

use crate::config::{AnnouncementConfig, RoomConfig};
use crate::error::{MucError, StanzaErrorCondition};
use crate::metrics;
use crate::muc::history::RoomHistory;
use crate::muc::occupant::{occupant_address, Occupant};
use crate::muc::presence::{leave_presence, mark_self_presence, nick_change_presence, room_message};
use crate::muc::server::ChatServer;
use crate::muc::user::ChatUser;
use crate::stanza::Stanza;
use crate::types::{Affiliation, Role};

/// Handles room-addressed IQs for one payload namespace.
pub trait RoomIqHandler: Send + Sync {
    /// Payload namespace this handler answers.
    fn namespace(&self) -> &str;

    /// Handle a get/set IQ from `sender`. `Ok(payload)` becomes a result
    /// IQ, `Err(condition)` an error reply.
    fn handle(
        &self,
        room: &ChatRoom,
        sender: &Occupant,
        iq: &Iq,
    ) -> Result<Option<Element>, StanzaErrorCondition>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoomState {
    Open,
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    state: RoomState,
    ended_at: Option<DateTime<Utc>>,
}

/// A multi-user chat room.
///
/// Membership changes (join, leave, nickname change) are serialised by the
/// membership lock. Outbound delivery is serialised by a separate delivery
/// lock so every occupant sees the room's stanzas in the same order. The
/// delivery lock is never held while taking the membership lock.
pub struct ChatRoom {
    name: String,
    address: BareJid,
    config: RoomConfig,
    announcements: AnnouncementConfig,
    created_at: DateTime<Utc>,
    occupants: DashMap<String, Arc<Occupant>>,
    membership: Mutex<Lifecycle>,
    delivery: Mutex<()>,
    history: RoomHistory,
    voice: Arc<Occupant>,
}

impl ChatRoom {
    pub(crate) fn new(
        name: &str,
        address: BareJid,
        config: RoomConfig,
        announcements: AnnouncementConfig,
        history: RoomHistory,
    ) -> Self {
        let voice = Arc::new(Occupant::room_voice(&address, name));
        Self {
            name: name.to_string(),
            address,
            config,
            announcements,
            created_at: Utc::now(),
            occupants: DashMap::new(),
            membership: Mutex::new(Lifecycle {
                state: RoomState::Open,
                ended_at: None,
            }),
            delivery: Mutex::new(()),
            history,
            voice,
        }
    }

    /// Lowercase room name (the node of the room address).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable name, falling back to the room name.
    pub fn display_name(&self) -> &str {
        if self.config.name.is_empty() {
            &self.name
        } else {
            &self.config.name
        }
    }

    pub fn address(&self) -> &BareJid {
        &self.address
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the last occupant left, if it has.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle().ended_at
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle().state == RoomState::Closed
    }

    /// Time between creation and close (or now, while open).
    pub fn chat_length(&self) -> Duration {
        let end = self.ended_at().unwrap_or_else(Utc::now);
        (end - self.created_at).to_std().unwrap_or_default()
    }

    pub fn history(&self) -> &RoomHistory {
        &self.history
    }

    /// The room's own voice.
    pub fn voice(&self) -> &Arc<Occupant> {
        &self.voice
    }

    pub fn occupant_count(&self) -> usize {
        self.occupants.len()
    }

    /// Look up an occupant by nickname (case-insensitive).
    pub fn occupant(&self, nickname: &str) -> Option<Arc<Occupant>> {
        self.occupants
            .get(&nickname.to_lowercase())
            .map(|entry| entry.value().clone())
    }

    /// Snapshot of the current occupants.
    pub fn occupants(&self) -> Vec<Arc<Occupant>> {
        self.occupants
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Add `user` to the room under `nickname`.
    ///
    /// The first occupant of a room becomes its owner. After registration
    /// the joiner receives every existing occupant's presence, everyone
    /// (joiner included) receives the joiner's presence, then the joiner
    /// receives the room history.
    #[instrument(skip(self, server, user, presence), fields(room = %self.address, nick = %nickname))]
    pub fn join_room(
        &self,
        server: &ChatServer,
        nickname: &str,
        user: &ChatUser,
        presence: Presence,
    ) -> Result<Arc<Occupant>, MucError> {
        occupant_address(&self.address, nickname)?;
        let key = nickname.to_lowercase();

        let occupant = {
            let lifecycle = self.lifecycle();
            if lifecycle.state == RoomState::Closed {
                return Err(MucError::RoomClosed(self.name.clone()));
            }
            if self.occupants.contains_key(&key) {
                return Err(MucError::nickname_conflict(&self.name, nickname));
            }
            let max = self.config.max_occupants as usize;
            if max > 0 && self.occupants.len() >= max {
                return Err(MucError::RoomFull(self.name.clone()));
            }

            let (affiliation, role) = if self.occupants.is_empty() {
                (Affiliation::Owner, Role::Moderator)
            } else {
                (Affiliation::None, Role::Participant)
            };

            let occupant = Arc::new(Occupant::new_user(
                &self.address,
                &self.name,
                nickname,
                user.address().clone(),
                affiliation,
                role,
                presence,
                self.config.non_anonymous,
            )?);
            self.occupants.insert(key, occupant.clone());
            occupant
        };

        let router = server.router();
        {
            let _delivery = self.delivery();

            for existing in self.occupants() {
                if !Arc::ptr_eq(&existing, &occupant) {
                    occupant.send(router, Stanza::Presence(existing.room_presence()));
                }
            }

            let joined = occupant.room_presence();
            for recipient in self.occupants() {
                let mut presence = joined.clone();
                if Arc::ptr_eq(&recipient, &occupant) {
                    mark_self_presence(&mut presence);
                }
                recipient.send(router, Stanza::Presence(presence));
            }

            for message in self.history.replay(&self.address) {
                occupant.send(router, Stanza::Message(message));
            }

            if let Some(text) = self.announcements.joined(nickname) {
                self.broadcast_from_room(server, &text);
            }
        }

        info!(
            affiliation = %occupant.affiliation(),
            role = %occupant.role(),
            occupants = self.occupants.len(),
            "Occupant joined room"
        );
        metrics::record_muc_presence("join", &self.name);
        metrics::record_muc_occupant_count(self.occupants.len() as i64, &self.name);

        server
            .events()
            .dispatch(|l| l.occupant_joined(self, user.address(), nickname));

        Ok(occupant)
    }

    /// Remove the occupant holding `nickname`. Unknown nicknames are
    /// logged and ignored.
    ///
    /// When the last occupant leaves the room closes, its length is
    /// finalised and it is removed from the server, exactly once.
    #[instrument(skip(self, server), fields(room = %self.address, nick = %nickname))]
    pub fn leave_room(&self, server: &ChatServer, nickname: &str) {
        let key = nickname.to_lowercase();

        let (occupant, closed) = {
            let mut lifecycle = self.lifecycle();
            let Some((_, occupant)) = self.occupants.remove(&key) else {
                warn!("Leave for unknown occupant");
                return;
            };

            let closed = self.occupants.is_empty() && lifecycle.state == RoomState::Open;
            if closed {
                let ended_at = Utc::now();
                lifecycle.state = RoomState::Closed;
                lifecycle.ended_at = Some(ended_at);
                let length = (ended_at - self.created_at).to_std().unwrap_or_default();
                server.remove_chat_room(self, length);
            }
            (occupant, closed)
        };

        if let Some(real) = occupant.real_address() {
            server.forget_occupancy(real, &self.name, &occupant);
        }

        let router = server.router();
        {
            let _delivery = self.delivery();

            let disclosed = self
                .config
                .non_anonymous
                .then(|| occupant.real_address())
                .flatten();
            let unavailable = leave_presence(&occupant.address(), occupant.affiliation(), disclosed);

            for recipient in self.occupants() {
                recipient.send(router, Stanza::Presence(unavailable.clone()));
            }
            let mut own = unavailable;
            mark_self_presence(&mut own);
            occupant.send(router, Stanza::Presence(own));

            if !closed {
                if let Some(text) = self.announcements.left(&occupant.nickname()) {
                    self.broadcast_from_room(server, &text);
                }
            }
        }

        occupant.kick();

        info!(occupants = self.occupants.len(), "Occupant left room");
        metrics::record_muc_presence("leave", &self.name);
        metrics::record_muc_occupant_count(self.occupants.len() as i64, &self.name);

        if let Some(real) = occupant.real_address() {
            let nick = occupant.nickname();
            server
                .events()
                .dispatch(|l| l.occupant_left(self, real, &nick));
        }
        if closed {
            info!(length_secs = self.chat_length().as_secs(), "Room closed");
            server.events().dispatch(|l| l.room_destroyed(self));
        }
    }

    /// Move `occupant` to a new nickname and announce it.
    ///
    /// The old nickname gets an unavailable presence carrying status 303
    /// and the new nickname, then the new nickname's presence follows.
    #[instrument(skip(self, server, occupant, presence), fields(room = %self.address, nick = %new_nickname))]
    pub fn change_nickname(
        &self,
        server: &ChatServer,
        occupant: &Arc<Occupant>,
        new_nickname: &str,
        presence: Presence,
    ) -> Result<(), MucError> {
        occupant_address(&self.address, new_nickname)?;
        let old_nickname = occupant.nickname();
        let old_address = occupant
            .address()
            .try_into_full()
            .map_err(|bare| MucError::invalid_address(bare.to_string()))?;
        let old_key = old_nickname.to_lowercase();
        let new_key = new_nickname.to_lowercase();

        {
            let lifecycle = self.lifecycle();
            if lifecycle.state == RoomState::Closed {
                return Err(MucError::RoomClosed(self.name.clone()));
            }
            let registered = self
                .occupants
                .get(&old_key)
                .map(|entry| Arc::ptr_eq(entry.value(), occupant))
                .unwrap_or(false);
            if !registered {
                return Err(MucError::invalid_address(format!(
                    "{} is not an occupant of {}",
                    old_nickname, self.name
                )));
            }
            if new_key != old_key && self.occupants.contains_key(&new_key) {
                return Err(MucError::nickname_conflict(&self.name, new_nickname));
            }

            occupant.rename(new_nickname)?;
            if new_key != old_key {
                self.occupants.remove(&old_key);
                self.occupants.insert(new_key, occupant.clone());
            }
        }

        let router = server.router();
        {
            let _delivery = self.delivery();

            let disclosed = self
                .config
                .non_anonymous
                .then(|| occupant.real_address())
                .flatten();
            let unavailable = nick_change_presence(
                &old_address,
                occupant.affiliation(),
                occupant.role(),
                disclosed,
                new_nickname,
            );

            occupant.set_presence(presence);
            let available = occupant.room_presence();

            for recipient in self.occupants() {
                let own = Arc::ptr_eq(&recipient, occupant);
                let mut first = unavailable.clone();
                let mut second = available.clone();
                if own {
                    mark_self_presence(&mut first);
                    mark_self_presence(&mut second);
                }
                recipient.send(router, Stanza::Presence(first));
                recipient.send(router, Stanza::Presence(second));
            }
        }

        info!(old = %old_nickname, "Occupant changed nickname");
        metrics::record_muc_presence("nick", &self.name);

        if let Some(real) = occupant.real_address() {
            server
                .events()
                .dispatch(|l| l.nickname_changed(self, real, &old_nickname, new_nickname));
        }
        Ok(())
    }

    /// Route a stanza sent by `sender`, whose `from` has already been
    /// rewritten to the sender's room address.
    pub fn send(&self, server: &ChatServer, sender: &Arc<Occupant>, stanza: Stanza) {
        match stanza {
            Stanza::Message(message) => self.send_message(server, sender, message),
            Stanza::Presence(mut presence) => {
                presence.from = Some(sender.address());
                self.broadcast(server, Stanza::Presence(presence));
            }
            Stanza::Iq(iq) => self.send_iq(server, sender, iq),
        }
    }

    /// Send a groupchat message from the room to every occupant and keep
    /// it in history.
    pub fn server_broadcast(&self, server: &ChatServer, text: &str) {
        let _delivery = self.delivery();
        self.broadcast_from_room(server, text);
    }

    fn send_message(&self, server: &ChatServer, sender: &Arc<Occupant>, mut message: Message) {
        let resource = message
            .to
            .as_ref()
            .and_then(|to| to.resource())
            .map(|r| r.as_str().to_string());

        match (message.type_.clone(), resource) {
            (MessageType::Groupchat, None) => {
                message.from = Some(sender.address());
                let nickname = sender.nickname();
                {
                    let _delivery = self.delivery();
                    self.history.add(message.clone(), Utc::now());
                    self.broadcast_locked(server, Stanza::Message(message.clone()));
                }
                metrics::record_muc_message("groupchat");

                if let Some(real) = sender.real_address() {
                    server
                        .events()
                        .dispatch(|l| l.message_received(self, real, &nickname, &message));
                }
            }
            (MessageType::Chat | MessageType::Normal, Some(nick)) => {
                let Some(target) = self.occupant(&nick) else {
                    debug!(room = %self.address, nick = %nick, "Private message to unknown occupant dropped");
                    return;
                };
                message.from = Some(sender.address());
                {
                    let _delivery = self.delivery();
                    target.send(server.router(), Stanza::Message(message.clone()));
                }
                metrics::record_muc_message("private");

                if let (Some(from), Some(to)) = (sender.real_address(), target.real_address()) {
                    server
                        .events()
                        .dispatch(|l| l.private_message_received(self, from, to, &message));
                }
            }
            _ => self.bounce(server, sender, Stanza::Message(message), StanzaErrorCondition::BadRequest),
        }
    }

    fn send_iq(&self, server: &ChatServer, sender: &Arc<Occupant>, iq: Iq) {
        let payload = match &iq.payload {
            IqType::Get(payload) | IqType::Set(payload) => payload,
            IqType::Result(_) | IqType::Error(_) => {
                debug!(room = %self.address, id = %iq.id, "Dropping IQ response addressed to room");
                return;
            }
        };

        let Some(handler) = server.iq_handler(&payload.ns()) else {
            self.bounce(server, sender, Stanza::Iq(iq), StanzaErrorCondition::BadRequest);
            return;
        };

        match handler.handle(self, sender, &iq) {
            Ok(result) => {
                let reply = Iq {
                    from: iq.to.clone(),
                    to: None,
                    id: iq.id.clone(),
                    payload: IqType::Result(result),
                };
                sender.send(server.router(), Stanza::Iq(reply));
            }
            Err(condition) => self.bounce(server, sender, Stanza::Iq(iq), condition),
        }
    }

    /// Reply to `sender` with an error, spoken by the room voice.
    fn bounce(&self, server: &ChatServer, sender: &Occupant, stanza: Stanza, condition: StanzaErrorCondition) {
        debug!(room = %self.address, kind = stanza.name(), condition = %condition, "Bouncing stanza");
        let mut bounce = stanza.into_bounce(condition);
        bounce.set_from(Some(self.voice.address()));
        sender.send(server.router(), bounce);
    }

    fn broadcast(&self, server: &ChatServer, stanza: Stanza) {
        let _delivery = self.delivery();
        self.broadcast_locked(server, stanza);
    }

    /// Deliver to every current occupant. Caller holds the delivery lock.
    fn broadcast_locked(&self, server: &ChatServer, stanza: Stanza) {
        let router = server.router();
        for occupant in self.occupants() {
            occupant.send(router, stanza.clone());
        }
    }

    /// Caller holds the delivery lock.
    fn broadcast_from_room(&self, server: &ChatServer, text: &str) {
        let message = room_message(&self.address, text);
        self.history.add(message.clone(), Utc::now());
        self.broadcast_locked(server, Stanza::Message(message));
        metrics::record_muc_message("room");
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.membership.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ChatRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRoom")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("occupants", &self.occupants.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Room address for `name` under the service domain.
pub(crate) fn room_address(name: &str, domain: &str) -> Result<BareJid, MucError> {
    format!("{name}@{domain}")
        .parse::<BareJid>()
        .map_err(|e| MucError::invalid_address(format!("{name}@{domain}: {e}")))
}
