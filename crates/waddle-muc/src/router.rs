//! Outbound delivery seams: packet routing and presence probing.
//!
//! The MUC core never touches sockets. It hands fully addressed stanzas to
//! a [`PacketRouter`] and asks a [`PresenceManager`] to probe idle users.

use std::sync::Arc;

use dashmap::DashMap;
use jid::Jid;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use xmpp_parsers::presence::{Presence, Type as PresenceType};

use crate::stanza::Stanza;

/// Delivery failure for a single recipient.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Stanza has no recipient address
    #[error("Stanza has no recipient")]
    NoRecipient,

    /// The recipient is not currently connected
    #[error("Recipient {0} is not connected")]
    NotConnected(String),

    /// The channel to the recipient is full (backpressure)
    #[error("Outbound channel to {0} is full")]
    ChannelFull(String),

    /// The channel to the recipient is closed
    #[error("Outbound channel to {0} is closed")]
    ChannelClosed(String),
}

/// Delivers a stanza to the address in its `to` attribute.
///
/// Implementations must not block: a full queue is reported as an error,
/// not waited on.
pub trait PacketRouter: Send + Sync {
    fn route(&self, stanza: Stanza) -> Result<(), RouteError>;
}

/// Sends presence probes on behalf of the service.
pub trait PresenceManager: Send + Sync {
    fn probe(&self, from: &Jid, to: &Jid);
}

/// A stanza to be sent to a connection.
#[derive(Debug, Clone)]
pub struct OutboundStanza {
    /// The stanza to send
    pub stanza: Stanza,
}

impl OutboundStanza {
    /// Create a new outbound stanza.
    pub fn new(stanza: Stanza) -> Self {
        Self { stanza }
    }
}

/// [`PacketRouter`] over per-address bounded `mpsc` channels.
///
/// Stanzas addressed to a full address go to that connection. Stanzas to
/// a bare address go to every connection registered for it.
#[derive(Debug, Default)]
pub struct ChannelRouter {
    connections: DashMap<Jid, mpsc::Sender<OutboundStanza>>,
}

impl ChannelRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        info!("Creating channel router");
        Self::default()
    }

    /// Register a connection with its outbound channel, replacing any
    /// previous registration for the same address.
    #[instrument(skip(self, sender), fields(jid = %jid))]
    pub fn register(&self, jid: Jid, sender: mpsc::Sender<OutboundStanza>) {
        if self.connections.insert(jid, sender).is_some() {
            debug!("Replaced existing connection registration");
        } else {
            debug!("Registered new connection");
        }
    }

    /// Unregister a connection. Returns true if it was registered.
    #[instrument(skip(self), fields(jid = %jid))]
    pub fn unregister(&self, jid: &Jid) -> bool {
        self.connections.remove(jid).is_some()
    }

    /// Get the number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn send_one(&self, jid: &Jid, stanza: Stanza) -> Result<(), RouteError> {
        let sender = match self.connections.get(jid) {
            Some(entry) => entry.value().clone(),
            None => return Err(RouteError::NotConnected(jid.to_string())),
        };

        match sender.try_send(OutboundStanza::new(stanza)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(to = %jid, "Outbound channel full, applying backpressure");
                Err(RouteError::ChannelFull(jid.to_string()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(to = %jid, "Outbound channel closed, dropping registration");
                self.connections.remove(jid);
                Err(RouteError::ChannelClosed(jid.to_string()))
            }
        }
    }
}

impl PacketRouter for ChannelRouter {
    fn route(&self, stanza: Stanza) -> Result<(), RouteError> {
        let to = stanza.to().cloned().ok_or(RouteError::NoRecipient)?;

        if to.resource().is_some() {
            return self.send_one(&to, stanza);
        }

        let targets: Vec<Jid> = self
            .connections
            .iter()
            .filter(|entry| entry.key().to_bare() == to.to_bare())
            .map(|entry| entry.key().clone())
            .collect();

        if targets.is_empty() {
            return Err(RouteError::NotConnected(to.to_string()));
        }

        let mut result = Ok(());
        for target in targets {
            if let Err(e) = self.send_one(&target, stanza.clone()) {
                result = Err(e);
            }
        }
        result
    }
}

impl<T: PacketRouter + ?Sized> PacketRouter for Arc<T> {
    fn route(&self, stanza: Stanza) -> Result<(), RouteError> {
        (**self).route(stanza)
    }
}

/// [`PresenceManager`] that routes `<presence type='probe'/>` stanzas.
pub struct RoutingPresenceManager {
    router: Arc<dyn PacketRouter>,
}

impl RoutingPresenceManager {
    /// Create a presence manager that probes through a router.
    pub fn new(router: Arc<dyn PacketRouter>) -> Self {
        Self { router }
    }
}

impl PresenceManager for RoutingPresenceManager {
    fn probe(&self, from: &Jid, to: &Jid) {
        let mut probe = Presence::new(PresenceType::Probe);
        probe.from = Some(from.clone());
        probe.to = Some(to.clone());
        if let Err(e) = self.router.route(Stanza::Presence(probe)) {
            debug!(to = %to, error = %e, "Presence probe not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xmpp_parsers::message::Message;

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_route_to_full_address() {
        let router = ChannelRouter::new();
        let (tx, mut rx) = mpsc::channel(4);
        router.register(jid("alice@example.com/home"), tx);

        let msg = Message::new(Some(jid("alice@example.com/home")));
        router.route(Stanza::Message(msg)).unwrap();

        let out = rx.recv().await.unwrap();
        assert_eq!(out.stanza.to(), Some(&jid("alice@example.com/home")));
    }

    #[tokio::test]
    async fn test_route_bare_fans_out() {
        let router = ChannelRouter::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        router.register(jid("alice@example.com/home"), tx1);
        router.register(jid("alice@example.com/work"), tx2);

        let msg = Message::new(Some(jid("alice@example.com")));
        router.route(Stanza::Message(msg)).unwrap();

        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[test]
    fn test_route_errors() {
        let router = ChannelRouter::new();

        let msg = Message::new(None::<Jid>);
        assert_eq!(router.route(Stanza::Message(msg)), Err(RouteError::NoRecipient));

        let msg = Message::new(Some(jid("bob@example.com/work")));
        assert!(matches!(
            router.route(Stanza::Message(msg)),
            Err(RouteError::NotConnected(_))
        ));

        let (tx, rx) = mpsc::channel(1);
        router.register(jid("carol@example.com/x"), tx);
        drop(rx);
        let msg = Message::new(Some(jid("carol@example.com/x")));
        assert!(matches!(
            router.route(Stanza::Message(msg)),
            Err(RouteError::ChannelClosed(_))
        ));
        assert_eq!(router.connection_count(), 0);
    }

    #[test]
    fn test_route_full_channel() {
        let router = ChannelRouter::new();
        let (tx, _rx) = mpsc::channel(1);
        router.register(jid("dave@example.com/x"), tx);

        let first = Message::new(Some(jid("dave@example.com/x")));
        router.route(Stanza::Message(first)).unwrap();
        let second = Message::new(Some(jid("dave@example.com/x")));
        assert!(matches!(
            router.route(Stanza::Message(second)),
            Err(RouteError::ChannelFull(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_is_routed() {
        let router = Arc::new(ChannelRouter::new());
        let (tx, mut rx) = mpsc::channel(4);
        router.register(jid("alice@example.com/home"), tx);

        let presence = RoutingPresenceManager::new(router.clone());
        presence.probe(&jid("muc.example.com"), &jid("alice@example.com/home"));

        let out = rx.recv().await.unwrap();
        let Stanza::Presence(p) = out.stanza else {
            panic!("expected presence");
        };
        assert_eq!(p.type_, PresenceType::Probe);
    }
}
