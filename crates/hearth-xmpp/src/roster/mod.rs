//! Roster items and subscription state.
//!
//! Rosters are read-only here: the presence handlers only ever ask who a user
//! is subscribed to and who is subscribed to them. Storage and trust sit
//! behind the [`RosterStore`] and [`TrustCheck`] seams.
//!
//! Roster get:
//! ```xml
//! <iq type='get' id='roster-1'>
//!   <query xmlns='jabber:iq:roster'/>
//! </iq>
//! ```

pub mod storage;
pub mod trust;

pub use storage::{InMemoryRoster, RosterStore};
pub use trust::{RosterTrust, TrustCheck};

use std::fmt;

use jid::BareJid;
use minidom::Element;
use serde::{Deserialize, Serialize};

use crate::parser::ns;
use crate::stanza;

/// A contact in a user's roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterItem {
    /// The contact's JID (bare JID without resource).
    pub jid: BareJid,
    /// Optional human-readable name for the contact.
    pub name: Option<String>,
    /// Current subscription state.
    pub subscription: Subscription,
}

impl RosterItem {
    /// Create a new roster item with no subscription.
    pub fn new(jid: BareJid) -> Self {
        Self {
            jid,
            name: None,
            subscription: Subscription::None,
        }
    }

    /// Set the subscription state.
    pub fn set_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = subscription;
        self
    }

    /// Set the display name.
    pub fn set_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Convert this roster item to an XML element.
    pub fn to_element(&self) -> Element {
        let mut builder = Element::builder("item", ns::ROSTER)
            .attr("jid", self.jid.to_string())
            .attr("subscription", self.subscription.as_str());

        if let Some(ref name) = self.name {
            builder = builder.attr("name", name);
        }

        builder.build()
    }
}

/// Subscription state for a roster item.
///
/// - `to`: the user receives the contact's presence
/// - `from`: the contact receives the user's presence
/// - `both`: both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    /// No subscription exists between user and contact.
    #[default]
    None,
    /// User is subscribed to contact's presence.
    To,
    /// Contact is subscribed to user's presence.
    From,
    /// Mutual subscription.
    Both,
}

impl Subscription {
    /// Get the XML attribute value for this subscription state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
        }
    }

    /// The user receives this contact's presence.
    pub fn receives(&self) -> bool {
        matches!(self, Subscription::To | Subscription::Both)
    }

    /// This contact receives the user's presence.
    pub fn sends(&self) -> bool {
        matches!(self, Subscription::From | Subscription::Both)
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the result for a roster get request.
pub fn build_roster_result(request: &Element, items: &[RosterItem]) -> Element {
    let mut result = stanza::iq_result(request);
    let mut query = Element::builder("query", ns::ROSTER).build();
    for item in items {
        query.append_child(item.to_element());
    }
    result.append_child(query);
    result
}
