//! Error types for the connector and session manager.

use thiserror::Error;

use crate::parser::ns;

/// Connector and session manager errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// XML parsing or serialization error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Malformed address
    #[error("Invalid JID: {0}")]
    Jid(#[from] jid::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stanza error (for IQ error responses)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a stanza error for 'conflict'.
    pub fn conflict(text: Option<String>) -> Self {
        Self::Stanza {
            condition: StanzaErrorCondition::Conflict,
            error_type: StanzaErrorType::Cancel,
            text,
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Conflict (e.g., account already exists)
    Conflict,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
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
    /// Do not retry (unrecoverable error)
    Cancel,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Generate a stream error frame.
///
/// The frame does not close the stream; the connector writes the closing
/// tag itself when the connection is torn down.
pub fn generate_stream_error(condition: &str, text: Option<&str>) -> String {
    let mut error = format!("<stream:error><{} xmlns='{}'/>", condition, ns::STREAMS);

    if let Some(t) = text {
        error.push_str(&format!(
            "<text xmlns='{}' xml:lang='en'>{}</text>",
            ns::STREAMS,
            t
        ));
    }

    error.push_str("</stream:error>");
    error
}

/// Stream error conditions used by the connector.
pub mod stream_errors {
    /// Stream error: not well-formed
    pub const NOT_WELL_FORMED: &str = "not-well-formed";
    /// Stream error: not authorized
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    /// Stream error: host unknown
    pub const HOST_UNKNOWN: &str = "host-unknown";
    /// Stream error: undefined condition
    pub const UNDEFINED_CONDITION: &str = "undefined-condition";
}
