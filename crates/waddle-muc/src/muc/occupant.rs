//! A single user's presence in a single room.

use std::sync::{PoisonError, RwLock};

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tracing::{debug, warn};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::error::MucError;
use crate::muc::presence::{disclosure, strip_muc_join, strip_muc_user};
use crate::router::PacketRouter;
use crate::stanza::Stanza;
use crate::types::{Affiliation, Role};

/// Who stands behind an occupant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OccupantKind {
    /// A connected user
    User {
        /// The user's real address
        real_address: Jid,
    },
    /// The room speaking for itself (announcements, bounces)
    RoomVoice,
}

#[derive(Debug)]
struct OccupantState {
    nickname: String,
    address: Jid,
    presence: Presence,
}

/// One user's occupancy of one room.
///
/// The (room, user) pair is fixed at creation. The nickname may change and
/// the presence snapshot is replaced on every presence update. The
/// `muc#user` disclosure is computed once, at join.
#[derive(Debug)]
pub struct Occupant {
    kind: OccupantKind,
    room_name: String,
    room_address: BareJid,
    affiliation: Affiliation,
    role: Role,
    disclosure: Element,
    state: RwLock<OccupantState>,
}

impl Occupant {
    /// Create a user occupant. Fails if `nickname` cannot be a resource.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_user(
        room_address: &BareJid,
        room_name: &str,
        nickname: &str,
        real_address: Jid,
        affiliation: Affiliation,
        role: Role,
        presence: Presence,
        non_anonymous: bool,
    ) -> Result<Self, MucError> {
        let address = occupant_address(room_address, nickname)?;
        let disclosed = non_anonymous.then_some(&real_address);
        let disclosure = disclosure(affiliation, role, disclosed);

        Ok(Self {
            kind: OccupantKind::User { real_address },
            room_name: room_name.to_string(),
            room_address: room_address.clone(),
            affiliation,
            role,
            disclosure,
            state: RwLock::new(OccupantState {
                nickname: nickname.to_string(),
                address: Jid::from(address),
                presence,
            }),
        })
    }

    /// Create the room's own voice.
    pub(crate) fn room_voice(room_address: &BareJid, room_name: &str) -> Self {
        Self {
            kind: OccupantKind::RoomVoice,
            room_name: room_name.to_string(),
            room_address: room_address.clone(),
            affiliation: Affiliation::Owner,
            role: Role::Moderator,
            disclosure: disclosure(Affiliation::Owner, Role::Moderator, None),
            state: RwLock::new(OccupantState {
                nickname: String::new(),
                address: Jid::from(room_address.clone()),
                presence: Presence::new(PresenceType::None),
            }),
        }
    }

    pub fn kind(&self) -> &OccupantKind {
        &self.kind
    }

    pub fn is_room_voice(&self) -> bool {
        matches!(self.kind, OccupantKind::RoomVoice)
    }

    /// The user's real address; `None` for the room voice.
    pub fn real_address(&self) -> Option<&Jid> {
        match &self.kind {
            OccupantKind::User { real_address } => Some(real_address),
            OccupantKind::RoomVoice => None,
        }
    }

    /// Lowercase name of the room this occupant belongs to.
    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn room_address(&self) -> &BareJid {
        &self.room_address
    }

    pub fn affiliation(&self) -> Affiliation {
        self.affiliation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn nickname(&self) -> String {
        self.read().nickname.clone()
    }

    /// `room@service/nick`, or the bare room address for the room voice.
    pub fn address(&self) -> Jid {
        self.read().address.clone()
    }

    /// The last presence the user sent to the room.
    pub fn presence(&self) -> Presence {
        self.read().presence.clone()
    }

    /// Replace the presence snapshot.
    pub fn set_presence(&self, presence: Presence) {
        self.write().presence = presence;
    }

    /// The presence the room shows for this occupant: the snapshot sent
    /// from the occupant's room address with the disclosure fragment.
    pub fn room_presence(&self) -> Presence {
        let state = self.read();
        let mut presence = state.presence.clone();
        presence.from = Some(state.address.clone());
        presence.to = None;
        strip_muc_user(&mut presence);
        strip_muc_join(&mut presence);
        presence.payloads.push(self.disclosure.clone());
        presence
    }

    /// Deliver a stanza to this occupant's real address. Delivery failures
    /// are logged, never returned.
    pub fn send(&self, router: &dyn PacketRouter, stanza: Stanza) {
        let Some(real) = self.real_address() else {
            debug!(room = %self.room_address, kind = stanza.name(), "Dropping stanza addressed to room voice");
            return;
        };

        let stanza = stanza.addressed_to(real.clone());
        if let Err(e) = router.route(stanza) {
            warn!(
                room = %self.room_address,
                to = %real,
                error = %e,
                "Failed to deliver stanza to occupant"
            );
        }
    }

    /// Hook run when the occupant is removed from its room.
    pub fn kick(&self) {}

    /// Switch to a new nickname. Only the room calls this, under its
    /// membership lock.
    pub(crate) fn rename(&self, nickname: &str) -> Result<(), MucError> {
        let address = occupant_address(&self.room_address, nickname)?;
        let mut state = self.write();
        state.nickname = nickname.to_string();
        state.address = Jid::from(address);
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, OccupantState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, OccupantState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Build `room@service/nick`.
pub fn occupant_address(room: &BareJid, nickname: &str) -> Result<FullJid, MucError> {
    if nickname.trim().is_empty() {
        return Err(MucError::InvalidNickname(nickname.to_string()));
    }
    room.with_resource_str(nickname)
        .map_err(|_| MucError::InvalidNickname(nickname.to_string()))
}
