//! The MUC service: registry of rooms and users.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jid::{BareJid, Jid};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::MucConfig;
use crate::error::MucError;
use crate::events::{EventDispatcher, MucEventListener};
use crate::metrics;
use crate::muc::history::HistoryStrategy;
use crate::muc::occupant::Occupant;
use crate::muc::room::{room_address, ChatRoom, RoomIqHandler};
use crate::muc::user::ChatUser;
use crate::router::{PacketRouter, PresenceManager};
use crate::stanza::Stanza;
use crate::tasks::spawn_periodic;

struct ServerInner {
    config: MucConfig,
    service: Jid,
    router: Arc<dyn PacketRouter>,
    presence: Arc<dyn PresenceManager>,
    history: HistoryStrategy,
    events: EventDispatcher,
    iq_handlers: DashMap<String, Arc<dyn RoomIqHandler>>,
    rooms: DashMap<String, Arc<ChatRoom>>,
    users: DashMap<Jid, Arc<ChatUser>>,
    total_chat_time_ms: AtomicU64,
}

/// The multi-user chat service.
///
/// Cheap to clone; clones share the same registries. Rooms are created on
/// first join and removed when their last occupant leaves. Users are
/// created on their first stanza and removed when their session ends.
#[derive(Clone)]
pub struct ChatServer {
    inner: Arc<ServerInner>,
}

impl ChatServer {
    /// Create a service. Fails if the configured domain is not a valid
    /// address.
    pub fn new(
        config: MucConfig,
        router: Arc<dyn PacketRouter>,
        presence: Arc<dyn PresenceManager>,
    ) -> Result<Self, MucError> {
        let history = HistoryStrategy::from_config(&config);
        Self::with_history(config, router, presence, history)
    }

    /// Create a service with an explicit history strategy.
    pub fn with_history(
        config: MucConfig,
        router: Arc<dyn PacketRouter>,
        presence: Arc<dyn PresenceManager>,
        history: HistoryStrategy,
    ) -> Result<Self, MucError> {
        let service = Jid::from(config.domain_jid()?);
        info!(domain = %service, history = ?history.policy(), "Creating MUC service");

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                service,
                router,
                presence,
                history,
                events: EventDispatcher::new(),
                iq_handlers: DashMap::new(),
                rooms: DashMap::new(),
                users: DashMap::new(),
                total_chat_time_ms: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &MucConfig {
        &self.inner.config
    }

    /// The service's own address.
    pub fn service_address(&self) -> &Jid {
        &self.inner.service
    }

    pub(crate) fn router(&self) -> &dyn PacketRouter {
        self.inner.router.as_ref()
    }

    pub(crate) fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    /// Register a lifecycle listener.
    pub fn add_listener(&self, listener: Arc<dyn MucEventListener>) {
        self.inner.events.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MucEventListener>) {
        self.inner.events.remove_listener(listener);
    }

    /// Register a handler for room IQs in the handler's namespace,
    /// replacing any previous one.
    pub fn register_iq_handler(&self, handler: Arc<dyn RoomIqHandler>) {
        let namespace = handler.namespace().to_string();
        debug!(namespace = %namespace, "Registered room IQ handler");
        self.inner.iq_handlers.insert(namespace, handler);
    }

    pub(crate) fn iq_handler(&self, namespace: &str) -> Option<Arc<dyn RoomIqHandler>> {
        self.inner
            .iq_handlers
            .get(namespace)
            .map(|entry| entry.value().clone())
    }

    /// Entry point for stanzas addressed to the service or its rooms.
    /// Stanzas without a sender are dropped.
    pub fn process(&self, stanza: Stanza) {
        let Some(from) = stanza.from().cloned() else {
            debug!(kind = stanza.name(), "Dropping stanza without sender");
            return;
        };
        let user = self.get_chat_user(&from);
        user.process(self, stanza);
    }

    /// Get a room by name, creating it if it does not exist.
    #[instrument(skip(self))]
    pub fn get_chat_room(&self, name: &str) -> Result<Arc<ChatRoom>, MucError> {
        let key = name.to_lowercase();
        if let Some(room) = self.chat_room(&key) {
            return Ok(room);
        }

        let address = room_address(&key, &self.inner.config.domain)?;
        let mut created = false;
        let room = self
            .inner
            .rooms
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(ChatRoom::new(
                    &key,
                    address,
                    self.inner.config.room.clone(),
                    self.inner.config.announcements.clone(),
                    self.inner.history.create_history(),
                ))
            })
            .value()
            .clone();

        if created {
            info!(room = %room.address(), "Created room");
            metrics::record_room_count(self.inner.rooms.len() as i64);
            self.inner.events.dispatch(|l| l.room_created(&room));
        }
        Ok(room)
    }

    /// Get an existing room by name.
    pub fn chat_room(&self, name: &str) -> Option<Arc<ChatRoom>> {
        self.inner
            .rooms
            .get(&name.to_lowercase())
            .map(|entry| entry.value().clone())
    }

    pub fn has_chat_room(&self, name: &str) -> bool {
        self.inner.rooms.contains_key(&name.to_lowercase())
    }

    /// Snapshot of the active rooms.
    pub fn chat_rooms(&self) -> Vec<Arc<ChatRoom>> {
        self.inner
            .rooms
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Deregister a room that just closed. Called once per room, by the
    /// room, under its membership lock.
    pub(crate) fn remove_chat_room(&self, room: &ChatRoom, length: Duration) -> bool {
        self.inner
            .total_chat_time_ms
            .fetch_add(length.as_millis() as u64, Ordering::Relaxed);

        let removed = self
            .inner
            .rooms
            .remove_if(room.name(), |_, current| std::ptr::eq(current.as_ref(), room))
            .is_some();

        debug!(room = %room.address(), removed, "Deregistered room");
        metrics::record_room_count(self.inner.rooms.len() as i64);
        removed
    }

    /// Get the user for a real address, creating it if needed.
    pub fn get_chat_user(&self, address: &Jid) -> Arc<ChatUser> {
        if let Some(user) = self.chat_user(address) {
            return user;
        }
        self.inner
            .users
            .entry(address.clone())
            .or_insert_with(|| Arc::new(ChatUser::new(address.clone())))
            .value()
            .clone()
    }

    /// Get an existing user.
    pub fn chat_user(&self, address: &Jid) -> Option<Arc<ChatUser>> {
        self.inner
            .users
            .get(address)
            .map(|entry| entry.value().clone())
    }

    /// Remove a user and make it leave every room it occupies.
    #[instrument(skip(self), fields(user = %address))]
    pub fn remove_user(&self, address: &Jid) {
        let Some((_, user)) = self.inner.users.remove(address) else {
            debug!("User not registered");
            return;
        };

        for (room_name, occupant) in user.take_occupancies() {
            match self.chat_room(&room_name) {
                Some(room) => room.leave_room(self, &occupant.nickname()),
                None => debug!(room = %room_name, "Room already gone"),
            }
        }
        info!("Removed user");
    }

    pub(crate) fn forget_occupancy(&self, user: &Jid, room_name: &str, occupant: &Arc<Occupant>) {
        if let Some(user) = self.chat_user(user) {
            user.forget(room_name, occupant);
        }
    }

    /// Probe every user idle for longer than the configured timeout.
    /// Users are never removed here. Returns the number of probes sent.
    pub fn sweep_idle_users(&self, now: DateTime<Utc>) -> usize {
        let timeout = self.inner.config.user_timeout();
        let users: Vec<Arc<ChatUser>> = self
            .inner
            .users
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut probed = 0;
        for user in users {
            if user.is_idle(now, timeout) {
                self.inner.presence.probe(&self.inner.service, user.address());
                probed += 1;
            }
        }

        if probed > 0 {
            debug!(probed, "Probed idle users");
            metrics::record_idle_probes(probed as u64);
        }
        probed
    }

    /// Run [`Self::sweep_idle_users`] every sweep interval until `shutdown`.
    pub fn spawn_idle_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let server = self.clone();
        spawn_periodic(
            "muc-idle-sweep",
            self.inner.config.sweep_interval(),
            shutdown,
            move || {
                server.sweep_idle_users(Utc::now());
            },
        )
    }

    /// Send a groupchat message from every room to its occupants.
    pub fn server_broadcast(&self, text: &str) {
        for room in self.chat_rooms() {
            room.server_broadcast(self, text);
        }
    }

    /// Sum of the lengths of every room closed so far.
    pub fn total_chat_time(&self) -> Duration {
        Duration::from_millis(self.inner.total_chat_time_ms.load(Ordering::Relaxed))
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn user_count(&self) -> usize {
        self.inner.users.len()
    }

    /// Occupants across all rooms.
    pub fn occupant_count(&self) -> usize {
        self.chat_rooms()
            .iter()
            .map(|room| room.occupant_count())
            .sum()
    }

    /// Room address for a name, without creating the room.
    pub fn room_address(&self, name: &str) -> Result<BareJid, MucError> {
        room_address(&name.to_lowercase(), &self.inner.config.domain)
    }
}

impl std::fmt::Debug for ChatServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatServer")
            .field("service", &self.inner.service)
            .field("rooms", &self.inner.rooms.len())
            .field("users", &self.inner.users.len())
            .finish()
    }
}
