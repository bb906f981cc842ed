//! Per-connection MUC state: which rooms a real address occupies.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use jid::Jid;
use tracing::{debug, warn};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::error::{MucError, StanzaErrorCondition};
use crate::muc::occupant::Occupant;
use crate::muc::server::ChatServer;
use crate::stanza::{is_available, Stanza};

/// How often a join is retried when it races the room closing.
const JOIN_ATTEMPTS: usize = 3;

/// One connected user, identified by real address, across all rooms.
#[derive(Debug)]
pub struct ChatUser {
    address: Jid,
    roles: DashMap<String, Arc<Occupant>>,
    last_packet: AtomicI64,
    removed: AtomicBool,
}

impl ChatUser {
    pub(crate) fn new(address: Jid) -> Self {
        Self {
            address,
            roles: DashMap::new(),
            last_packet: AtomicI64::new(Utc::now().timestamp_millis()),
            removed: AtomicBool::new(false),
        }
    }

    /// The user's real address.
    pub fn address(&self) -> &Jid {
        &self.address
    }

    /// The occupant this user holds in `room_name`, if any.
    pub fn occupant(&self, room_name: &str) -> Option<Arc<Occupant>> {
        self.roles
            .get(&room_name.to_lowercase())
            .map(|entry| entry.value().clone())
    }

    /// Names of the rooms this user occupies.
    pub fn rooms(&self) -> Vec<String> {
        self.roles.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn room_count(&self) -> usize {
        self.roles.len()
    }

    /// When the last stanza from this user was processed.
    pub fn last_packet_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_packet.load(Ordering::Relaxed))
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Whether no stanza arrived within `timeout` before `now`.
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let idle_ms = now.timestamp_millis() - self.last_packet.load(Ordering::Relaxed);
        idle_ms > timeout.as_millis() as i64
    }

    fn touch(&self) {
        self.last_packet
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Whether the server has dropped this user.
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Mark the user removed and take every occupancy. A join completing
    /// after this point sees the mark and undoes itself.
    pub(crate) fn take_occupancies(&self) -> Vec<(String, Arc<Occupant>)> {
        self.removed.store(true, Ordering::SeqCst);
        let names = self.rooms();
        names
            .into_iter()
            .filter_map(|name| self.roles.remove(&name))
            .collect()
    }

    /// Drop the occupancy for `room_name` if it is still `occupant`.
    /// Returns true if it was.
    pub(crate) fn forget(&self, room_name: &str, occupant: &Arc<Occupant>) -> bool {
        self.roles
            .remove_if(room_name, |_, current| Arc::ptr_eq(current, occupant))
            .is_some()
    }

    /// Dispatch an inbound stanza sent by this user.
    pub fn process(&self, server: &ChatServer, stanza: Stanza) {
        self.touch();
        match stanza {
            Stanza::Presence(presence) => self.process_presence(server, presence),
            addressed => self.process_addressed(server, addressed),
        }
    }

    /// Messages and IQs: forward to the room if this user occupies it.
    fn process_addressed(&self, server: &ChatServer, mut stanza: Stanza) {
        let Some(room_name) = stanza
            .to()
            .and_then(|to| to.node())
            .map(|node| node.as_str().to_lowercase())
        else {
            debug!(from = %self.address, kind = stanza.name(), "Stanza addressed to the service dropped");
            return;
        };

        let Some(occupant) = self.occupant(&room_name) else {
            if server.config().strict_addressing {
                let condition = if server.has_chat_room(&room_name) {
                    StanzaErrorCondition::NotAcceptable
                } else {
                    StanzaErrorCondition::ItemNotFound
                };
                self.bounce(server, stanza, condition);
            } else {
                debug!(from = %self.address, room = %room_name, kind = stanza.name(), "Stanza to unjoined room dropped");
            }
            return;
        };

        if occupant.real_address() != stanza.from() {
            self.bounce(server, stanza, StanzaErrorCondition::Conflict);
            return;
        }

        let Some(room) = server.chat_room(&room_name) else {
            debug!(room = %room_name, "Room vanished before delivery");
            return;
        };

        stanza.set_from(Some(occupant.address()));
        room.send(server, &occupant, stanza);
    }

    fn process_presence(&self, server: &ChatServer, presence: Presence) {
        let room_name = presence
            .to
            .as_ref()
            .and_then(|to| to.node())
            .map(|node| node.as_str().to_lowercase());

        let Some(room_name) = room_name else {
            if presence.type_ == PresenceType::Unavailable {
                debug!(user = %self.address, "Session unavailable, leaving all rooms");
                server.remove_user(&self.address);
            }
            return;
        };

        let nickname = presence
            .to
            .as_ref()
            .and_then(|to| to.resource())
            .map(|r| r.as_str().to_string());

        match self.occupant(&room_name) {
            None => match nickname {
                Some(nickname) if is_available(&presence) => {
                    self.join(server, &room_name, &nickname, presence)
                }
                _ => debug!(user = %self.address, room = %room_name, "Presence to unjoined room dropped"),
            },
            Some(occupant) => {
                if occupant.real_address() != presence.from.as_ref() {
                    self.bounce(server, Stanza::Presence(presence), StanzaErrorCondition::Conflict);
                    return;
                }
                let Some(room) = server.chat_room(&room_name) else {
                    debug!(room = %room_name, "Room vanished, dropping stale occupancy");
                    self.forget(&room_name, &occupant);
                    return;
                };

                if presence.type_ == PresenceType::Unavailable {
                    self.forget(&room_name, &occupant);
                    room.leave_room(server, &occupant.nickname());
                    return;
                }

                match nickname {
                    Some(nickname) if nickname != occupant.nickname() => {
                        if let Err(e) =
                            room.change_nickname(server, &occupant, &nickname, presence.clone())
                        {
                            self.reject(server, presence, e);
                        }
                    }
                    _ => {
                        occupant.set_presence(presence);
                        room.send(server, &occupant, Stanza::Presence(occupant.room_presence()));
                    }
                }
            }
        }
    }

    fn join(&self, server: &ChatServer, room_name: &str, nickname: &str, presence: Presence) {
        for _ in 0..JOIN_ATTEMPTS {
            let room = match server.get_chat_room(room_name) {
                Ok(room) => room,
                Err(e) => {
                    self.reject(server, presence, e);
                    return;
                }
            };

            match room.join_room(server, nickname, self, presence.clone()) {
                Ok(occupant) => {
                    self.roles.insert(room_name.to_string(), occupant.clone());
                    // removed while joining: whoever takes the role back out leaves
                    if self.is_removed() && self.forget(room_name, &occupant) {
                        debug!(user = %self.address, room = %room_name, "User removed during join, leaving");
                        room.leave_room(server, &occupant.nickname());
                    }
                    return;
                }
                Err(MucError::RoomClosed(_)) => {
                    debug!(room = %room_name, "Join raced room close, retrying");
                }
                Err(e) => {
                    self.reject(server, presence, e);
                    return;
                }
            }
        }
        warn!(user = %self.address, room = %room_name, "Giving up join after repeated room closes");
    }

    /// Conflicts are bounced; any other failure is only logged.
    fn reject(&self, server: &ChatServer, presence: Presence, error: MucError) {
        match error {
            MucError::NicknameConflict { .. } => {
                self.bounce(server, Stanza::Presence(presence), error.condition())
            }
            other => warn!(
                user = %self.address,
                error = %other,
                condition = %other.condition(),
                "Room presence rejected"
            ),
        }
    }

    fn bounce(&self, server: &ChatServer, stanza: Stanza, condition: StanzaErrorCondition) {
        if stanza.is_error() {
            return;
        }
        debug!(user = %self.address, kind = stanza.name(), condition = %condition, "Bouncing stanza");
        let mut bounce = stanza.into_bounce(condition);
        if bounce.to().is_none() {
            bounce.set_to(Some(self.address.clone()));
        }
        if let Err(e) = server.router().route(bounce).map_err(MucError::from) {
            warn!(to = %self.address, error = %e, "Failed to deliver bounce");
        }
    }
}
