//! Error types for the MUC core.

use minidom::Element;
use thiserror::Error;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

/// MUC core errors.
///
/// None of these cross the subsystem boundary as panics: callers turn them
/// into a bounce stanza or a log line.
#[derive(Debug, Error)]
pub enum MucError {
    /// The requested nickname is already used in the room
    #[error("Nickname '{nick}' already in use in room {room}")]
    NicknameConflict {
        /// Room name
        room: String,
        /// Requested nickname
        nick: String,
    },

    /// The nickname cannot be used as a resource part
    #[error("Invalid nickname: {0}")]
    InvalidNickname(String),

    /// The room reached its occupant limit
    #[error("Room {0} is full")]
    RoomFull(String),

    /// The room was closed while the request was in flight
    #[error("Room {0} is closed")]
    RoomClosed(String),

    /// An address could not be built or parsed
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Delivery failure reported by the router
    #[error("Routing error: {0}")]
    Route(#[from] crate::router::RouteError),

    /// Conversation metadata could not be archived
    #[error("Archive error: {0}")]
    Archive(#[from] crate::conversation::ArchiveError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MucError {
    /// Create a nickname conflict error.
    pub fn nickname_conflict(room: impl Into<String>, nick: impl Into<String>) -> Self {
        Self::NicknameConflict {
            room: room.into(),
            nick: nick.into(),
        }
    }

    /// Create a new invalid address error.
    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The stanza error condition a sender should see for this error.
    pub fn condition(&self) -> StanzaErrorCondition {
        match self {
            Self::NicknameConflict { .. } => StanzaErrorCondition::Conflict,
            Self::InvalidNickname(_) | Self::InvalidAddress(_) => StanzaErrorCondition::JidMalformed,
            Self::RoomFull(_) => StanzaErrorCondition::NotAllowed,
            Self::RoomClosed(_) => StanzaErrorCondition::ItemNotFound,
            Self::Route(_) | Self::Archive(_) | Self::Config(_) => {
                StanzaErrorCondition::InternalServerError
            }
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3) used by the MUC core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (unsupported stanza shape)
    BadRequest,
    /// Conflict (nickname in use, or bound to another address)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Item not found (room does not exist)
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable (sender is not an occupant)
    NotAcceptable,
    /// Not allowed (room is full)
    NotAllowed,
    /// Service unavailable
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::ServiceUnavailable => "service-unavailable",
        }
    }

    /// The error type RFC 6120 associates with this condition.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest | Self::JidMalformed | Self::NotAcceptable => StanzaErrorType::Modify,
            Self::Conflict
            | Self::FeatureNotImplemented
            | Self::ItemNotFound
            | Self::NotAllowed
            | Self::ServiceUnavailable => StanzaErrorType::Cancel,
            Self::Forbidden => StanzaErrorType::Auth,
            Self::InternalServerError => StanzaErrorType::Wait,
        }
    }

    fn defined_condition(&self) -> DefinedCondition {
        match self {
            Self::BadRequest => DefinedCondition::BadRequest,
            Self::Conflict => DefinedCondition::Conflict,
            Self::FeatureNotImplemented => DefinedCondition::FeatureNotImplemented,
            Self::Forbidden => DefinedCondition::Forbidden,
            Self::InternalServerError => DefinedCondition::InternalServerError,
            Self::ItemNotFound => DefinedCondition::ItemNotFound,
            Self::JidMalformed => DefinedCondition::JidMalformed,
            Self::NotAcceptable => DefinedCondition::NotAcceptable,
            Self::NotAllowed => DefinedCondition::NotAllowed,
            Self::ServiceUnavailable => DefinedCondition::ServiceUnavailable,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }

    fn error_type(&self) -> ErrorType {
        match self {
            Self::Auth => ErrorType::Auth,
            Self::Cancel => ErrorType::Cancel,
            Self::Modify => ErrorType::Modify,
            Self::Wait => ErrorType::Wait,
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the `xmpp_parsers` stanza error for a condition.
pub fn stanza_error(condition: StanzaErrorCondition, text: Option<&str>) -> StanzaError {
    StanzaError::new(
        condition.default_type().error_type(),
        condition.defined_condition(),
        "en",
        text.unwrap_or_default(),
    )
}

/// Build the `<error/>` child appended to bounced messages and presences.
pub fn stanza_error_element(condition: StanzaErrorCondition, text: Option<&str>) -> Element {
    stanza_error(condition, text).into()
}
