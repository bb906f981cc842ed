//! Room message history.
//!
//! A [`HistoryStrategy`] is configured once per service and creates one
//! [`RoomHistory`] per room. Messages are stored with the time the room
//! received them and replayed to joiners with a XEP-0203 delay stamp.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use jid::BareJid;
use minidom::Element;
use xmpp_parsers::message::Message;

use crate::config::{HistoryType, MucConfig};

/// Namespace for XEP-0203 delayed delivery.
pub const NS_DELAY: &str = "urn:xmpp:delay";

/// History retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryPolicy {
    /// Keep nothing
    None,
    /// Keep everything
    All,
    /// Keep the most recent `n` messages
    Number(usize),
}

/// Creates room histories that share one retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryStrategy {
    policy: HistoryPolicy,
}

impl Default for HistoryStrategy {
    fn default() -> Self {
        Self::new(HistoryPolicy::Number(25))
    }
}

impl HistoryStrategy {
    pub fn new(policy: HistoryPolicy) -> Self {
        Self { policy }
    }

    /// Build the strategy described by the service configuration.
    pub fn from_config(config: &MucConfig) -> Self {
        let policy = match config.history_type {
            HistoryType::None => HistoryPolicy::None,
            HistoryType::All => HistoryPolicy::All,
            HistoryType::Number => HistoryPolicy::Number(config.history_max),
        };
        Self::new(policy)
    }

    pub fn policy(&self) -> HistoryPolicy {
        self.policy
    }

    /// Create an empty history buffer for a new room.
    pub fn create_history(&self) -> RoomHistory {
        RoomHistory {
            policy: self.policy,
            messages: Mutex::new(VecDeque::new()),
        }
    }
}

/// A message kept in room history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// The message as broadcast (sender is the occupant's room address)
    pub message: Message,
    /// When the room received it
    pub received_at: DateTime<Utc>,
}

/// Bounded per-room message buffer.
#[derive(Debug)]
pub struct RoomHistory {
    policy: HistoryPolicy,
    messages: Mutex<VecDeque<HistoryEntry>>,
}

impl RoomHistory {
    /// Append a message, evicting the oldest ones beyond the policy bound.
    pub fn add(&self, message: Message, received_at: DateTime<Utc>) {
        let max = match self.policy {
            HistoryPolicy::None | HistoryPolicy::Number(0) => return,
            HistoryPolicy::All => usize::MAX,
            HistoryPolicy::Number(n) => n,
        };

        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        messages.push_back(HistoryEntry {
            message,
            received_at,
        });
        while messages.len() > max {
            messages.pop_front();
        }
    }

    /// Copy of the stored entries, oldest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Stored messages ready for replay: each carries a delay stamp
    /// attributed to the room.
    pub fn replay(&self, room: &BareJid) -> Vec<Message> {
        self.entries()
            .into_iter()
            .map(|entry| {
                let mut message = entry.message;
                message.payloads.push(delay_element(room, entry.received_at));
                message
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn delay_element(room: &BareJid, stamp: DateTime<Utc>) -> Element {
    Element::builder("delay", NS_DELAY)
        .attr("from", room.to_string())
        .attr("stamp", stamp.to_rfc3339_opts(SecondsFormat::Millis, true))
        .build()
}
