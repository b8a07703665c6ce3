//! Daemon configuration.
//!
//! Loaded from a TOML file. Every section is optional and falls back to the
//! defaults below.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use hearth_xmpp::roster::{InMemoryRoster, RosterItem, Subscription};
use hearth_xmpp::sm::StaticAccounts;
use hearth_xmpp::{ConnectorConfig, SessionManagerConfig};
use jid::{BareJid, Jid};
use serde::Deserialize;
use tracing::info;

/// Client connector settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host part of derived connection identities
    pub host: String,
    /// Address to accept clients on
    pub listen: SocketAddr,
    /// Housekeeping tick in milliseconds
    pub tick_ms: u64,
    /// Frames buffered per connection before it counts as stalled
    pub write_queue: usize,
    /// Largest stanza accepted from a client
    pub max_stanza_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = ConnectorConfig::default();
        Self {
            host: defaults.host,
            listen: defaults.listen,
            tick_ms: defaults.tick.as_millis() as u64,
            write_queue: defaults.write_queue,
            max_stanza_bytes: defaults.max_stanza_bytes,
        }
    }
}

/// Session manager settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmConfig {
    /// Domain users log in to
    pub host: String,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            host: SessionManagerConfig::default().host,
        }
    }
}

/// Presence settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Addresses copied on every presence broadcast
    pub bcc: Vec<String>,
}

/// A static account
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
}

/// A static roster entry
#[derive(Debug, Clone, Deserialize)]
pub struct RosterEntry {
    /// Bare JID of the roster's owner
    pub owner: String,
    /// Bare JID of the contact
    pub contact: String,
    #[serde(default)]
    pub subscription: Subscription,
    pub name: Option<String>,
}

/// Main configuration struct
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub sm: SmConfig,
    pub presence: PresenceConfig,
    pub accounts: Vec<AccountConfig>,
    pub roster: Vec<RosterEntry>,
}

impl Config {
    /// Load from `path`, or use defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn connector(&self) -> ConnectorConfig {
        ConnectorConfig {
            host: self.server.host.clone(),
            listen: self.server.listen,
            tick: Duration::from_millis(self.server.tick_ms.max(1)),
            write_queue: self.server.write_queue,
            max_stanza_bytes: self.server.max_stanza_bytes,
        }
    }

    /// Session manager settings, with the bcc list parsed.
    pub fn session_manager(&self) -> Result<SessionManagerConfig> {
        let bcc = self
            .presence
            .bcc
            .iter()
            .map(|s| s.parse::<Jid>().with_context(|| format!("Invalid bcc address: {}", s)))
            .collect::<Result<Vec<_>>>()?;

        Ok(SessionManagerConfig {
            host: self.sm.host.clone(),
            bcc,
        })
    }

    /// Account store seeded from `[[accounts]]`.
    pub fn accounts(&self) -> Result<StaticAccounts> {
        let accounts = StaticAccounts::new();
        for account in &self.accounts {
            let user: BareJid = format!("{}@{}", account.username, self.sm.host)
                .parse()
                .with_context(|| format!("Invalid account username: {}", account.username))?;
            accounts.insert(user, account.password.clone());
        }
        Ok(accounts)
    }

    /// Roster store seeded from `[[roster]]`.
    pub fn roster(&self) -> Result<InMemoryRoster> {
        let roster = InMemoryRoster::new();
        for entry in &self.roster {
            let owner: BareJid = entry
                .owner
                .parse()
                .with_context(|| format!("Invalid roster owner: {}", entry.owner))?;
            let contact: BareJid = entry
                .contact
                .parse()
                .with_context(|| format!("Invalid roster contact: {}", entry.contact))?;

            let mut item = RosterItem::new(contact).set_subscription(entry.subscription);
            if let Some(name) = &entry.name {
                item = item.set_name(name.clone());
            }
            roster.set_item(owner, item);
        }
        Ok(roster)
    }
}
