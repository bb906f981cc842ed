//! Test utilities for MUC integration tests.
//!
//! Provides a router that records every outbound stanza, a presence
//! manager that records probes, an event listener that records room
//! callbacks, and stanza builders.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use jid::Jid;
use minidom::Element;
use xmpp_parsers::message::{Body, Message, MessageType};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use waddle_muc::muc::presence::{NS_MUC, NS_MUC_USER};
use waddle_muc::{
    ChatRoom, ChatServer, MucConfig, MucEventListener, PacketRouter, PresenceManager, RouteError,
    Stanza,
};

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

pub fn jid(s: &str) -> Jid {
    s.parse().expect("valid test JID")
}

/// Router that keeps everything it is asked to deliver.
#[derive(Default)]
pub struct RecordingRouter {
    sent: Mutex<Vec<Stanza>>,
}

impl RecordingRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Stanza> {
        self.sent.lock().unwrap().clone()
    }

    /// Everything delivered to `to`, in order.
    pub fn sent_to(&self, to: &Jid) -> Vec<Stanza> {
        self.sent()
            .into_iter()
            .filter(|s| s.to() == Some(to))
            .collect()
    }

    pub fn presences_to(&self, to: &Jid) -> Vec<Presence> {
        self.sent_to(to)
            .into_iter()
            .filter_map(|s| match s {
                Stanza::Presence(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn messages_to(&self, to: &Jid) -> Vec<Message> {
        self.sent_to(to)
            .into_iter()
            .filter_map(|s| match s {
                Stanza::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl PacketRouter for RecordingRouter {
    fn route(&self, stanza: Stanza) -> Result<(), RouteError> {
        self.sent.lock().unwrap().push(stanza);
        Ok(())
    }
}

/// Presence manager that keeps every probe.
#[derive(Default)]
pub struct RecordingPresence {
    probes: Mutex<Vec<(Jid, Jid)>>,
}

impl RecordingPresence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn probes(&self) -> Vec<(Jid, Jid)> {
        self.probes.lock().unwrap().clone()
    }
}

impl PresenceManager for RecordingPresence {
    fn probe(&self, from: &Jid, to: &Jid) {
        self.probes.lock().unwrap().push((from.clone(), to.clone()));
    }
}

/// A room lifecycle callback, as seen by [`RecordingListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    RoomCreated(String),
    RoomDestroyed(String),
    Joined(String, Jid, String),
    Left(String, Jid, String),
    NicknameChanged(String, Jid, String, String),
    Message(String, Jid, String),
    PrivateMessage(String, Jid, Jid),
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn destroyed(&self, room: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Recorded::RoomDestroyed(r) if r == room))
            .count()
    }

    fn push(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl MucEventListener for RecordingListener {
    fn room_created(&self, room: &ChatRoom) {
        self.push(Recorded::RoomCreated(room.name().to_string()));
    }

    fn room_destroyed(&self, room: &ChatRoom) {
        self.push(Recorded::RoomDestroyed(room.name().to_string()));
    }

    fn occupant_joined(&self, room: &ChatRoom, user: &Jid, nickname: &str) {
        self.push(Recorded::Joined(room.name().to_string(), user.clone(), nickname.to_string()));
    }

    fn occupant_left(&self, room: &ChatRoom, user: &Jid, nickname: &str) {
        self.push(Recorded::Left(room.name().to_string(), user.clone(), nickname.to_string()));
    }

    fn nickname_changed(&self, room: &ChatRoom, user: &Jid, old_nickname: &str, new_nickname: &str) {
        self.push(Recorded::NicknameChanged(
            room.name().to_string(),
            user.clone(),
            old_nickname.to_string(),
            new_nickname.to_string(),
        ));
    }

    fn message_received(&self, room: &ChatRoom, sender: &Jid, nickname: &str, _message: &Message) {
        self.push(Recorded::Message(room.name().to_string(), sender.clone(), nickname.to_string()));
    }

    fn private_message_received(&self, room: &ChatRoom, from: &Jid, to: &Jid, _message: &Message) {
        self.push(Recorded::PrivateMessage(room.name().to_string(), from.clone(), to.clone()));
    }
}

/// A service on `muc.example.com` with join/leave announcements disabled,
/// wired to recording doubles.
pub struct TestService {
    pub server: ChatServer,
    pub router: Arc<RecordingRouter>,
    pub presence: Arc<RecordingPresence>,
    pub listener: Arc<RecordingListener>,
}

impl TestService {
    pub fn new() -> Self {
        let mut config = MucConfig::with_domain("muc.example.com");
        config.announcements.join = String::new();
        config.announcements.leave = String::new();
        Self::with_config(config)
    }

    pub fn with_config(config: MucConfig) -> Self {
        init_tracing();
        let router = RecordingRouter::new();
        let presence = RecordingPresence::new();
        let listener = RecordingListener::new();
        let server = ChatServer::new(config, router.clone(), presence.clone()).expect("valid config");
        server.add_listener(listener.clone());
        Self {
            server,
            router,
            presence,
            listener,
        }
    }

    /// Send a join presence from `user` to `room@muc.example.com/nick`.
    pub fn join(&self, user: &str, room: &str, nick: &str) {
        self.server.process(Stanza::Presence(join_presence(user, room, nick)));
    }

    /// Send an unavailable presence from `user` to its occupant in `room`.
    pub fn leave(&self, user: &str, room: &str, nick: &str) {
        self.server.process(Stanza::Presence(leave_presence(user, room, nick)));
    }

    pub fn say(&self, user: &str, room: &str, body: &str) {
        self.server.process(Stanza::Message(groupchat(user, room, body)));
    }
}

pub fn room_jid(room: &str) -> Jid {
    jid(&format!("{room}@muc.example.com"))
}

pub fn occupant_jid(room: &str, nick: &str) -> Jid {
    jid(&format!("{room}@muc.example.com/{nick}"))
}

pub fn join_presence(user: &str, room: &str, nick: &str) -> Presence {
    let mut presence = Presence::new(PresenceType::None);
    presence.from = Some(jid(user));
    presence.to = Some(occupant_jid(room, nick));
    presence.payloads.push(Element::builder("x", NS_MUC).build());
    presence
}

pub fn leave_presence(user: &str, room: &str, nick: &str) -> Presence {
    let mut presence = Presence::new(PresenceType::Unavailable);
    presence.from = Some(jid(user));
    presence.to = Some(occupant_jid(room, nick));
    presence
}

pub fn groupchat(user: &str, room: &str, body: &str) -> Message {
    let mut message = Message::new(Some(room_jid(room)));
    message.from = Some(jid(user));
    message.type_ = MessageType::Groupchat;
    message.bodies.insert(String::new(), Body(body.to_string()));
    message
}

pub fn private_chat(user: &str, room: &str, nick: &str, body: &str) -> Message {
    let mut message = Message::new(Some(occupant_jid(room, nick)));
    message.from = Some(jid(user));
    message.type_ = MessageType::Chat;
    message.bodies.insert(String::new(), Body(body.to_string()));
    message
}

pub fn body(message: &Message) -> Option<&str> {
    message.bodies.get("").map(|b| b.0.as_str())
}

/// The `muc#user` status codes carried by a presence.
pub fn status_codes(presence: &Presence) -> Vec<String> {
    presence
        .payloads
        .iter()
        .filter(|p| p.is("x", NS_MUC_USER))
        .flat_map(|x| x.children().filter(|c| c.is("status", NS_MUC_USER)))
        .filter_map(|s| s.attr("code").map(str::to_string))
        .collect()
}

/// The condition element name of an error stanza, if it is one.
pub fn error_condition(stanza: &Stanza) -> Option<String> {
    let payloads = match stanza {
        Stanza::Message(m) => &m.payloads,
        Stanza::Presence(p) => &p.payloads,
        Stanza::Iq(_) => return None,
    };
    payloads
        .iter()
        .find(|p| p.name() == "error")
        .and_then(|e| e.children().next())
        .map(|c| c.name().to_string())
}
