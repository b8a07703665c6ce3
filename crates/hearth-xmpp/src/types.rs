//! Common types for the connector.

use minidom::Element;

/// Protocol state of a client connection.
///
/// States only move forward: `Unknown` may become `Authenticated` or
/// `Closing`, `Authenticated` may become `Closing`, and `Closing` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Accepted, not yet authenticated
    #[default]
    Unknown,
    /// Authentication result delivered to the client
    Authenticated,
    /// Shutting down; no further stanzas are accepted
    Closing,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Unknown, ConnectionState::Authenticated)
                | (ConnectionState::Unknown, ConnectionState::Closing)
                | (ConnectionState::Authenticated, ConnectionState::Closing)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Unknown => write!(f, "unknown"),
            ConnectionState::Authenticated => write!(f, "authenticated"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// Stable identifier of a connection in the connector's table.
///
/// Identifiers are never reused while the connector runs, so a stale
/// address can never reach a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ConnId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(ConnId)
    }
}

/// Stanza type for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaType {
    /// Message stanza
    Message,
    /// Presence stanza
    Presence,
    /// IQ (info/query) stanza
    Iq,
    /// Anything else
    Other,
}

impl StanzaType {
    /// Classify an element by its name.
    pub fn of(element: &Element) -> Self {
        match element.name() {
            "message" => StanzaType::Message,
            "presence" => StanzaType::Presence,
            "iq" => StanzaType::Iq,
            _ => StanzaType::Other,
        }
    }
}

impl std::fmt::Display for StanzaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StanzaType::Message => write!(f, "message"),
            StanzaType::Presence => write!(f, "presence"),
            StanzaType::Iq => write!(f, "iq"),
            StanzaType::Other => write!(f, "other"),
        }
    }
}
