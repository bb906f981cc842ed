//! MUC presence and message builders (XEP-0045).

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use xmpp_parsers::message::{Body, Message, MessageType};
use xmpp_parsers::muc::user::{Item, MucUser, Role as MucRole, Status};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::types::{Affiliation, Role};

/// Namespace for MUC user protocol.
pub const NS_MUC_USER: &str = "http://jabber.org/protocol/muc#user";

/// Namespace for MUC protocol (join request).
pub const NS_MUC: &str = "http://jabber.org/protocol/muc";

fn muc_user(item: Item, status: Vec<Status>) -> Element {
    MucUser {
        status,
        items: vec![item],
    }
    .into()
}

fn item(affiliation: Affiliation, role: MucRole, real: Option<&Jid>, nick: Option<&str>) -> Item {
    Item {
        affiliation: affiliation.into(),
        role,
        jid: real.and_then(|j| j.try_as_full().ok()).cloned(),
        nick: nick.map(str::to_string),
        actor: None,
        continue_: None,
        reason: None,
    }
}

/// The `muc#user` fragment describing an occupant to the room. `real` is
/// only given in non-anonymous rooms.
pub fn disclosure(affiliation: Affiliation, role: Role, real: Option<&Jid>) -> Element {
    muc_user(item(affiliation, role.into(), real, None), vec![])
}

/// Drop any client-supplied `muc#user` payloads.
pub fn strip_muc_user(presence: &mut Presence) {
    presence.payloads.retain(|p| !p.is("x", NS_MUC_USER));
}

/// Drop the join request `<x xmlns='…muc'/>` payloads.
pub fn strip_muc_join(presence: &mut Presence) {
    presence.payloads.retain(|p| !p.is("x", NS_MUC));
}

/// Add status code 110 to the `muc#user` payload, marking a presence as
/// the recipient's own.
pub fn mark_self_presence(presence: &mut Presence) {
    if let Some(x) = presence
        .payloads
        .iter_mut()
        .find(|p| p.is("x", NS_MUC_USER))
    {
        x.append_child(
            Element::builder("status", NS_MUC_USER)
                .attr("code", "110")
                .build(),
        );
    }
}

/// Unavailable presence for an occupant leaving the room.
pub fn leave_presence(from: &Jid, affiliation: Affiliation, real: Option<&Jid>) -> Presence {
    let mut presence = Presence::new(PresenceType::Unavailable);
    presence.from = Some(from.clone());
    presence
        .payloads
        .push(muc_user(item(affiliation, MucRole::None, real, None), vec![]));
    presence
}

/// Unavailable presence for the old nickname during a nickname change,
/// carrying status 303 and the new nickname.
pub fn nick_change_presence(
    from: &FullJid,
    affiliation: Affiliation,
    role: Role,
    real: Option<&Jid>,
    new_nick: &str,
) -> Presence {
    let mut presence = Presence::new(PresenceType::Unavailable);
    presence.from = Some(Jid::from(from.clone()));
    presence.payloads.push(muc_user(
        item(affiliation, role.into(), real, Some(new_nick)),
        vec![Status::NewNick],
    ));
    presence
}

/// A groupchat message from the room itself.
pub fn room_message(room: &BareJid, body: &str) -> Message {
    let mut message = Message::new(None::<Jid>);
    message.from = Some(Jid::from(room.clone()));
    message.type_ = MessageType::Groupchat;
    message.bodies.insert(String::new(), Body(body.to_string()));
    message
}
