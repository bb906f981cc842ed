//! Privilege levels shared by rooms and occupants.

use serde::{Deserialize, Serialize};
use xmpp_parsers::muc::user::{Affiliation as WireAffiliation, Role as WireRole};

/// MUC room affiliation levels, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Affiliation {
    /// Banned from the room
    Outcast,
    /// No affiliation
    None,
    /// Room member
    Member,
    /// Room administrator
    Admin,
    /// Room owner
    Owner,
}

impl std::fmt::Display for Affiliation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Affiliation::Outcast => write!(f, "outcast"),
            Affiliation::None => write!(f, "none"),
            Affiliation::Member => write!(f, "member"),
            Affiliation::Admin => write!(f, "admin"),
            Affiliation::Owner => write!(f, "owner"),
        }
    }
}

impl From<Affiliation> for WireAffiliation {
    fn from(affiliation: Affiliation) -> Self {
        match affiliation {
            Affiliation::Outcast => WireAffiliation::Outcast,
            Affiliation::None => WireAffiliation::None,
            Affiliation::Member => WireAffiliation::Member,
            Affiliation::Admin => WireAffiliation::Admin,
            Affiliation::Owner => WireAffiliation::Owner,
        }
    }
}

/// MUC room role (session-based), lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// No role (not in room)
    None,
    /// Visitor (can read, limited send)
    Visitor,
    /// Participant (normal user)
    Participant,
    /// Moderator (can kick, manage)
    Moderator,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::None => write!(f, "none"),
            Role::Visitor => write!(f, "visitor"),
            Role::Participant => write!(f, "participant"),
            Role::Moderator => write!(f, "moderator"),
        }
    }
}

impl From<Role> for WireRole {
    fn from(role: Role) -> Self {
        match role {
            Role::None => WireRole::None,
            Role::Visitor => WireRole::Visitor,
            Role::Participant => WireRole::Participant,
            Role::Moderator => WireRole::Moderator,
        }
    }
}
