//! MUC service configuration.
//!
//! Configuration can be built three ways: `MucConfig::default()`, a TOML
//! document through [`MucConfig::from_toml_str`], or environment variables
//! through [`MucConfig::from_env`].
//!
//! # Environment Variables
//!
//! - `WADDLE_MUC_DOMAIN`: Service domain rooms live under. Default: `muc.localhost`
//! - `WADDLE_MUC_USER_TIMEOUT_SECS`: Idle time before a user is probed. Default: `300`
//! - `WADDLE_MUC_SWEEP_INTERVAL_SECS`: Idle sweep period. Default: `300`
//! - `WADDLE_MUC_HISTORY_MAX`: `all`, `none` or a message count. Default: `25`
//! - `WADDLE_MUC_NON_ANONYMOUS`: Disclose real addresses to occupants. Default: `false`
//! - `WADDLE_MUC_STRICT_ADDRESSING`: Bounce stanzas to rooms the sender is not in. Default: `false`
//! - `WADDLE_CONVERSATION_IDLE_SECS`: Conversation idle timeout. Default: `600`
//! - `WADDLE_CONVERSATION_MAX_SECS`: Conversation maximum duration. Default: `3600`

use std::time::Duration;

use jid::BareJid;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::MucError;

/// How much room history is kept and replayed to joiners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryType {
    /// Keep nothing
    None,
    /// Keep every message for the lifetime of the room
    All,
    /// Keep the most recent `history_max` messages
    #[default]
    Number,
}

/// Room defaults applied to every room the service creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Room name (human-readable); empty means the room's address name
    pub name: String,
    /// Room description
    pub description: Option<String>,
    /// Maximum number of occupants (0 = unlimited)
    pub max_occupants: u32,
    /// Whether room messages are fed to conversation tracking
    pub enable_logging: bool,
    /// Whether occupants see each other's real addresses
    pub non_anonymous: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            max_occupants: 0,
            enable_logging: true,
            non_anonymous: false,
        }
    }
}

/// Localised announcement templates. `{nick}` is replaced by the nickname.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnouncementConfig {
    /// Sent to the room when an occupant joins; empty disables it
    pub join: String,
    /// Sent to the room when an occupant leaves; empty disables it
    pub leave: String,
}

impl Default for AnnouncementConfig {
    fn default() -> Self {
        Self {
            join: "{nick} has joined the room".to_string(),
            leave: "{nick} has left the room".to_string(),
        }
    }
}

impl AnnouncementConfig {
    /// Render the join announcement, if enabled.
    pub fn joined(&self, nick: &str) -> Option<String> {
        render(&self.join, nick)
    }

    /// Render the leave announcement, if enabled.
    pub fn left(&self, nick: &str) -> Option<String> {
        render(&self.leave, nick)
    }
}

fn render(template: &str, nick: &str) -> Option<String> {
    if template.is_empty() {
        None
    } else {
        Some(template.replace("{nick}", nick))
    }
}

/// Conversation tracking windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// A conversation with no message for this long is ended
    pub idle_secs: u64,
    /// A conversation older than this is ended
    pub max_secs: u64,
    /// Expiry sweep period
    pub sweep_interval_secs: u64,
    /// Domains considered local when flagging 1:1 conversations as external.
    /// The service domain's parent is always local.
    pub local_domains: Vec<String>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            idle_secs: 10 * 60,
            max_secs: 60 * 60,
            sweep_interval_secs: 5 * 60,
            local_domains: Vec::new(),
        }
    }
}

impl ConversationConfig {
    /// Idle timeout as a duration.
    pub fn idle_time(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    /// Maximum conversation length as a duration.
    pub fn max_time(&self) -> Duration {
        Duration::from_secs(self.max_secs)
    }

    /// Expiry sweep period as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Configuration for the MUC service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MucConfig {
    /// Service domain (rooms are `name@domain`)
    pub domain: String,
    /// Idle time in seconds after which a user is probed
    pub user_timeout_secs: u64,
    /// Idle sweep period in seconds
    pub sweep_interval_secs: u64,
    /// History policy
    pub history_type: HistoryType,
    /// Message count kept under [`HistoryType::Number`]
    pub history_max: usize,
    /// Bounce stanzas addressed to rooms the sender does not occupy
    pub strict_addressing: bool,
    /// Defaults for new rooms
    pub room: RoomConfig,
    /// Join/leave announcement templates
    pub announcements: AnnouncementConfig,
    /// Conversation tracking windows
    pub conversation: ConversationConfig,
}

impl Default for MucConfig {
    fn default() -> Self {
        Self {
            domain: "muc.localhost".to_string(),
            user_timeout_secs: 300,
            sweep_interval_secs: 300,
            history_type: HistoryType::default(),
            history_max: 25,
            strict_addressing: false,
            room: RoomConfig::default(),
            announcements: AnnouncementConfig::default(),
            conversation: ConversationConfig::default(),
        }
    }
}

impl MucConfig {
    /// Create a default configuration for a service domain.
    pub fn with_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables, starting from defaults.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(domain) = std::env::var("WADDLE_MUC_DOMAIN") {
            config.domain = domain;
        }
        if let Some(secs) = env_parse::<u64>("WADDLE_MUC_USER_TIMEOUT_SECS") {
            config.user_timeout_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("WADDLE_MUC_SWEEP_INTERVAL_SECS") {
            config.sweep_interval_secs = secs;
        }
        if let Ok(history) = std::env::var("WADDLE_MUC_HISTORY_MAX") {
            match history.trim().to_lowercase().as_str() {
                "all" => config.history_type = HistoryType::All,
                "none" | "0" => config.history_type = HistoryType::None,
                other => match other.parse::<usize>() {
                    Ok(max) => {
                        config.history_type = HistoryType::Number;
                        config.history_max = max;
                    }
                    Err(_) => warn!(value = %history, "Ignoring invalid WADDLE_MUC_HISTORY_MAX"),
                },
            }
        }
        if let Some(flag) = env_bool("WADDLE_MUC_NON_ANONYMOUS") {
            config.room.non_anonymous = flag;
        }
        if let Some(flag) = env_bool("WADDLE_MUC_STRICT_ADDRESSING") {
            config.strict_addressing = flag;
        }
        if let Some(secs) = env_parse::<u64>("WADDLE_CONVERSATION_IDLE_SECS") {
            config.conversation.idle_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("WADDLE_CONVERSATION_MAX_SECS") {
            config.conversation.max_secs = secs;
        }

        config
    }

    /// Parse configuration from a TOML document. Missing keys take defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, MucError> {
        let config: Self = toml::from_str(input).map_err(|e| MucError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the service domain is a usable address.
    pub fn validate(&self) -> Result<(), MucError> {
        self.domain_jid().map(|_| ())
    }

    /// The service address.
    pub fn domain_jid(&self) -> Result<BareJid, MucError> {
        self.domain
            .parse::<BareJid>()
            .ok()
            .filter(|jid| jid.node().is_none())
            .ok_or_else(|| MucError::config(format!("invalid service domain '{}'", self.domain)))
    }

    /// Idle time after which a user is probed.
    pub fn user_timeout(&self) -> Duration {
        Duration::from_secs(self.user_timeout_secs)
    }

    /// Idle sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Domains considered local for conversation tracking.
    pub fn local_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .conversation
            .local_domains
            .iter()
            .map(|d| d.to_lowercase())
            .collect();
        let service = self.domain.to_lowercase();
        if let Some((_, parent)) = service.split_once('.') {
            domains.push(parent.to_string());
        }
        domains.push(service);
        domains.sort();
        domains.dedup();
        domains
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(variable = name, value = %value, "Ignoring unparseable environment variable");
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!(variable = name, value = %value, "Ignoring unparseable environment variable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MucConfig::default();
        assert_eq!(config.user_timeout(), Duration::from_secs(300));
        assert_eq!(config.history_type, HistoryType::Number);
        assert_eq!(config.history_max, 25);
        assert!(!config.strict_addressing);
        assert_eq!(config.conversation.idle_time(), Duration::from_secs(600));
        assert_eq!(config.conversation.max_time(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = MucConfig::from_toml_str(
            r#"
            domain = "conference.example.com"
            history_type = "all"
            strict_addressing = true

            [room]
            max_occupants = 10
            non_anonymous = true

            [conversation]
            idle_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.domain, "conference.example.com");
        assert_eq!(config.history_type, HistoryType::All);
        assert!(config.strict_addressing);
        assert_eq!(config.room.max_occupants, 10);
        assert!(config.room.non_anonymous);
        assert!(config.room.enable_logging);
        assert_eq!(config.conversation.idle_secs, 60);
        assert_eq!(config.conversation.max_secs, 3600);
    }

    #[test]
    fn test_from_toml_rejects_bad_domain() {
        let err = MucConfig::from_toml_str(r#"domain = "room@conference.example.com""#)
            .unwrap_err();
        assert!(matches!(err, MucError::Config(_)));

        assert!(MucConfig::from_toml_str("user_timeout_secs = \"soon\"").is_err());
    }

    #[test]
    fn test_announcements() {
        let announcements = AnnouncementConfig::default();
        assert_eq!(
            announcements.joined("alice").as_deref(),
            Some("alice has joined the room")
        );
        assert_eq!(
            announcements.left("bob").as_deref(),
            Some("bob has left the room")
        );

        let silent = AnnouncementConfig {
            join: String::new(),
            leave: String::new(),
        };
        assert!(silent.joined("alice").is_none());
    }

    #[test]
    fn test_local_domains_include_parent() {
        let config = MucConfig::with_domain("conference.example.com");
        let domains = config.local_domains();
        assert!(domains.contains(&"example.com".to_string()));
        assert!(domains.contains(&"conference.example.com".to_string()));
    }
}
