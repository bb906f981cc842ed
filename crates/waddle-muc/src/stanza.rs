//! The three stanza kinds the MUC core routes, and the bounce rules.

use jid::Jid;
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::message::{Message, MessageType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::error::{stanza_error, stanza_error_element, StanzaErrorCondition};

/// An already-parsed XMPP stanza.
#[derive(Debug, Clone)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

impl Stanza {
    /// Get the stanza type name for tracing.
    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }

    /// Sender address.
    pub fn from(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.from.as_ref(),
            Stanza::Presence(p) => p.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
        }
    }

    /// Recipient address.
    pub fn to(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.to.as_ref(),
            Stanza::Presence(p) => p.to.as_ref(),
            Stanza::Iq(iq) => iq.to.as_ref(),
        }
    }

    /// Rewrite the sender address.
    pub fn set_from(&mut self, from: Option<Jid>) {
        match self {
            Stanza::Message(m) => m.from = from,
            Stanza::Presence(p) => p.from = from,
            Stanza::Iq(iq) => iq.from = from,
        }
    }

    /// Rewrite the recipient address.
    pub fn set_to(&mut self, to: Option<Jid>) {
        match self {
            Stanza::Message(m) => m.to = to,
            Stanza::Presence(p) => p.to = to,
            Stanza::Iq(iq) => iq.to = to,
        }
    }

    /// Same stanza with a different recipient.
    pub fn addressed_to(mut self, to: Jid) -> Self {
        self.set_to(Some(to));
        self
    }

    /// Whether this stanza already carries an error.
    pub fn is_error(&self) -> bool {
        match self {
            Stanza::Message(m) => m.type_ == MessageType::Error,
            Stanza::Presence(p) => p.type_ == PresenceType::Error,
            Stanza::Iq(iq) => matches!(iq.payload, IqType::Error(_)),
        }
    }

    /// Turn this stanza into an error reply: same kind, sender and
    /// recipient swapped, `type='error'` and an `<error/>` child attached.
    pub fn into_bounce(self, condition: StanzaErrorCondition) -> Self {
        match self {
            Stanza::Message(mut m) => {
                std::mem::swap(&mut m.from, &mut m.to);
                m.type_ = MessageType::Error;
                m.payloads.push(stanza_error_element(condition, None));
                Stanza::Message(m)
            }
            Stanza::Presence(mut p) => {
                std::mem::swap(&mut p.from, &mut p.to);
                p.type_ = PresenceType::Error;
                p.payloads.push(stanza_error_element(condition, None));
                Stanza::Presence(p)
            }
            Stanza::Iq(iq) => Stanza::Iq(Iq {
                from: iq.to,
                to: iq.from,
                id: iq.id,
                payload: IqType::Error(stanza_error(condition, None)),
            }),
        }
    }
}

impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        Stanza::Message(message)
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(presence)
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

/// Whether a presence makes its sender available in a room.
pub fn is_available(presence: &Presence) -> bool {
    presence.type_ == PresenceType::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use minidom::Element;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    #[test]
    fn test_message_bounce_swaps_addresses() {
        let mut msg = Message::new(Some(jid("lobby@muc.example.com/bob")));
        msg.from = Some(jid("alice@example.com/home"));
        msg.type_ = MessageType::Headline;

        let bounce = Stanza::Message(msg).into_bounce(StanzaErrorCondition::BadRequest);
        assert!(bounce.is_error());
        assert_eq!(bounce.from(), Some(&jid("lobby@muc.example.com/bob")));
        assert_eq!(bounce.to(), Some(&jid("alice@example.com/home")));

        let Stanza::Message(m) = bounce else {
            panic!("expected message");
        };
        let error = m.payloads.iter().find(|p| p.name() == "error").unwrap();
        assert!(error.children().any(|c| c.name() == "bad-request"));
    }

    #[test]
    fn test_presence_bounce() {
        let mut presence = Presence::new(PresenceType::None);
        presence.from = Some(jid("alice@example.com/home"));
        presence.to = Some(jid("lobby@muc.example.com/bob"));

        let bounce = Stanza::Presence(presence).into_bounce(StanzaErrorCondition::Conflict);
        assert_eq!(bounce.name(), "presence");
        assert!(bounce.is_error());
        assert_eq!(bounce.to(), Some(&jid("alice@example.com/home")));
    }

    #[test]
    fn test_iq_bounce_keeps_id() {
        let iq = Iq {
            from: Some(jid("alice@example.com/home")),
            to: Some(jid("lobby@muc.example.com")),
            id: "q1".to_string(),
            payload: IqType::Get(Element::builder("query", "urn:example:unknown").build()),
        };

        let Stanza::Iq(bounce) = Stanza::Iq(iq).into_bounce(StanzaErrorCondition::BadRequest) else {
            panic!("expected iq");
        };
        assert_eq!(bounce.id, "q1");
        assert_eq!(bounce.from, Some(jid("lobby@muc.example.com")));
        assert!(matches!(bounce.payload, IqType::Error(_)));
    }

    #[test]
    fn test_addressed_to() {
        let stanza = <Stanza as From<Presence>>::from(Presence::new(PresenceType::Unavailable))
            .addressed_to(jid("bob@example.com/work"));
        assert_eq!(stanza.to(), Some(&jid("bob@example.com/work")));
        assert!(!stanza.is_error());
    }
}
