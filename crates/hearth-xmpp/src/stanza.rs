//! Stanza helpers shared by the connector and the session manager.
//!
//! Stanzas are plain [`minidom::Element`]s. Routing information that must never
//! reach a client travels next to the element in a [`Packet`], not inside it.

use chrono::Utc;
use jid::Jid;
use minidom::Element;

use crate::parser::ns;

/// Priority of a session that is not available.
///
/// Never broadcast as a value; it only marks "not available".
pub const UNAVAILABLE_PRIORITY: i16 = -129;

/// Internal routing envelope of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    /// Identity the packet came from (a connection or a session)
    pub source: Jid,
    /// Host or identity the packet is headed for
    pub destination: Jid,
}

/// A stanza in flight on the delivery bus.
#[derive(Debug, Clone)]
pub struct Packet {
    /// The stanza as it would appear on the wire
    pub element: Element,
    /// Internal routing, present between the connector and the session manager
    pub routing: Option<Routing>,
}

impl Packet {
    /// Create a packet routed by its `to` attribute.
    pub fn new(element: Element) -> Self {
        Self {
            element,
            routing: None,
        }
    }

    /// Create a packet with an internal routing envelope.
    pub fn routed(element: Element, routing: Routing) -> Self {
        Self {
            element,
            routing: Some(routing),
        }
    }

    /// Parsed `to` attribute of the stanza.
    pub fn to(&self) -> Option<Jid> {
        address(&self.element, "to")
    }

    /// Parsed `from` attribute of the stanza.
    pub fn from(&self) -> Option<Jid> {
        address(&self.element, "from")
    }
}

/// Parse an address attribute, ignoring malformed values.
pub fn address(element: &Element, attr: &str) -> Option<Jid> {
    element.attr(attr).and_then(|s| s.parse::<Jid>().ok())
}

/// Legacy numeric error carried on bounced stanzas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyError {
    /// Numeric code
    pub code: u16,
    /// Human readable text
    pub text: &'static str,
}

impl LegacyError {
    /// The recipient's connection is gone
    pub const DISCONNECTED: LegacyError = LegacyError { code: 510, text: "Disconnected" };
    /// No such user
    pub const NOT_FOUND: LegacyError = LegacyError { code: 404, text: "Not Found" };
    /// Credentials rejected
    pub const UNAUTHORIZED: LegacyError = LegacyError { code: 401, text: "Unauthorized" };
    /// Service unavailable
    pub const UNAVAILABLE: LegacyError = LegacyError { code: 503, text: "Service Unavailable" };
    /// Resource already in use
    pub const CONFLICT: LegacyError = LegacyError { code: 409, text: "Conflict" };
    /// Missing or malformed request fields
    pub const BAD_REQUEST: LegacyError = LegacyError { code: 400, text: "Bad Request" };
}

/// Presence subtypes, derived from the `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSubtype {
    /// No `type` attribute
    Available,
    Unavailable,
    Probe,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Invisible,
    Error,
    /// Any value we do not recognise
    Unknown,
}

impl PresenceSubtype {
    /// Classify a presence stanza.
    pub fn of(element: &Element) -> Self {
        match element.attr("type") {
            None => Self::Available,
            Some("unavailable") => Self::Unavailable,
            Some("probe") => Self::Probe,
            Some("subscribe") => Self::Subscribe,
            Some("subscribed") => Self::Subscribed,
            Some("unsubscribe") => Self::Unsubscribe,
            Some("unsubscribed") => Self::Unsubscribed,
            Some("invisible") => Self::Invisible,
            Some("error") => Self::Error,
            Some(_) => Self::Unknown,
        }
    }

    /// The `type` attribute value, `None` for plain available presence.
    pub fn as_type(&self) -> Option<&'static str> {
        match self {
            Self::Available | Self::Unknown => None,
            Self::Unavailable => Some("unavailable"),
            Self::Probe => Some("probe"),
            Self::Subscribe => Some("subscribe"),
            Self::Subscribed => Some("subscribed"),
            Self::Unsubscribe => Some("unsubscribe"),
            Self::Unsubscribed => Some("unsubscribed"),
            Self::Invisible => Some("invisible"),
            Self::Error => Some("error"),
        }
    }
}

/// Build a new presence stanza.
pub fn new_presence(subtype: PresenceSubtype, to: Option<&Jid>, status: Option<&str>) -> Element {
    let mut builder = Element::builder("presence", ns::JABBER_CLIENT);
    if let Some(t) = subtype.as_type() {
        builder = builder.attr("type", t);
    }
    if let Some(to) = to {
        builder = builder.attr("to", to.to_string());
    }
    if let Some(status) = status {
        builder = builder.append(Element::builder("status", ns::JABBER_CLIENT).append(status));
    }
    builder.build()
}

/// Copy of `element` with the given attributes replaced or removed.
///
/// minidom cannot remove an attribute in place, so the element is rebuilt.
pub fn with_attrs(element: &Element, changes: &[(&str, Option<&str>)]) -> Element {
    let mut builder = Element::builder(element.name(), element.ns());
    for (name, value) in element.attrs() {
        if changes.iter().any(|(changed, _)| *changed == name) {
            continue;
        }
        builder = builder.attr(name, value);
    }
    for (name, value) in changes {
        if let Some(value) = value {
            builder = builder.attr(*name, *value);
        }
    }
    builder.append_all(element.nodes().cloned()).build()
}

/// Copy of `element` with `to` and `from` exchanged.
pub fn swap_addresses(element: &Element) -> Element {
    let to = element.attr("to");
    let from = element.attr("from");
    with_attrs(element, &[("to", from), ("from", to)])
}

/// Turn an iq request into its empty result.
pub fn iq_result(element: &Element) -> Element {
    let to = element.attr("to");
    let from = element.attr("from");
    let mut builder = Element::builder("iq", element.ns()).attr("type", "result");
    if let Some(id) = element.attr("id") {
        builder = builder.attr("id", id);
    }
    if let Some(from) = from {
        builder = builder.attr("to", from);
    }
    if let Some(to) = to {
        builder = builder.attr("from", to);
    }
    builder.build()
}

fn error_child(err: LegacyError, ns: String, prior_type: Option<&str>) -> Element {
    let mut builder = Element::builder("error", ns).attr("code", err.code.to_string());
    if let Some(t) = prior_type {
        builder = builder.attr("type", t);
    }
    builder.append(err.text).build()
}

/// Turn a stanza into the error reply for itself.
pub fn error(element: &Element, err: LegacyError) -> Element {
    let mut reply = swap_addresses(element);
    reply = with_attrs(&reply, &[("type", Some("error"))]);
    reply.append_child(error_child(err, element.ns(), None));
    reply
}

/// Like [`error`], but the stanza's previous `type` is kept on the
/// `<error/>` child so the original kind of the bounced stanza survives.
pub fn bounce(element: &Element, err: LegacyError) -> Element {
    let mut reply = swap_addresses(element);
    reply = with_attrs(&reply, &[("type", Some("error"))]);
    reply.append_child(error_child(err, element.ns(), element.attr("type")));
    reply
}

/// Legacy error code carried by an error stanza.
pub fn error_code(element: &Element) -> Option<u16> {
    if element.attr("type") != Some("error") {
        return None;
    }
    element
        .get_child("error", element.ns().as_str())
        .and_then(|e| e.attr("code"))
        .and_then(|code| code.parse().ok())
}

/// Whether this is the message used to signal a lost or forced-off connection.
pub fn is_disconnect_signal(element: &Element) -> bool {
    element.name() == "message" && error_code(element) == Some(LegacyError::DISCONNECTED.code)
}

/// The message a connector sends upstream when a connection goes away.
pub fn disconnect_notification() -> Element {
    error(&Element::builder("message", ns::JABBER_CLIENT).build(), LegacyError::DISCONNECTED)
}

/// Priority announced by a presence stanza.
///
/// Typed presence (anything but plain available) and a missing stanza give
/// [`UNAVAILABLE_PRIORITY`]. A missing or non-numeric `<priority/>` gives 0.
/// Numbers are clamped to `-128..=127`.
pub fn priority(element: Option<&Element>) -> i16 {
    let Some(element) = element else {
        return UNAVAILABLE_PRIORITY;
    };
    if element.attr("type").is_some() {
        return UNAVAILABLE_PRIORITY;
    }

    let Some(child) = element.get_child("priority", element.ns().as_str()) else {
        return 0;
    };

    leading_integer(&child.text()).clamp(-128, 127) as i16
}

/// Parse the leading integer of `s`, the way C's `atoi` reads it.
fn leading_integer(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let mut value: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        // Saturate well outside the clamp range
        value = (value * 10 + i64::from(b - b'0')).min(i64::from(i32::MAX));
    }

    if negative {
        -value
    } else {
        value
    }
}

/// Current time in the legacy `CCYYMMDDTHH:MM:SS` UTC form.
pub fn timestamp() -> String {
    Utc::now().format("%Y%m%dT%H:%M:%S").to_string()
}

/// Attach a legacy delay stamp, replacing any previous one.
pub fn stamp_delay(element: &mut Element, from: &str) {
    while element.remove_child("x", ns::DELAY).is_some() {}
    element.append_child(
        Element::builder("x", ns::DELAY)
            .attr("from", from)
            .attr("stamp", timestamp())
            .build(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence_with_priority(value: &str) -> Element {
        Element::builder("presence", ns::JABBER_CLIENT)
            .append(Element::builder("priority", ns::JABBER_CLIENT).append(value))
            .build()
    }

    #[test]
    fn test_priority_clamps_to_range() {
        assert_eq!(priority(Some(&presence_with_priority("150"))), 127);
        assert_eq!(priority(Some(&presence_with_priority("-200"))), -128);
        assert_eq!(priority(Some(&presence_with_priority("5"))), 5);
    }

    #[test]
    fn test_priority_defaults_to_zero() {
        let bare = new_presence(PresenceSubtype::Available, None, None);
        assert_eq!(priority(Some(&bare)), 0);
        assert_eq!(priority(Some(&presence_with_priority("high"))), 0);
        assert_eq!(priority(Some(&presence_with_priority(" 12abc"))), 12);
    }

    #[test]
    fn test_priority_of_typed_or_missing_presence() {
        let unavailable = new_presence(PresenceSubtype::Unavailable, None, None);
        assert_eq!(priority(Some(&unavailable)), UNAVAILABLE_PRIORITY);

        let mut typed = presence_with_priority("10");
        typed.set_attr("type", "invisible");
        assert_eq!(priority(Some(&typed)), UNAVAILABLE_PRIORITY);

        assert_eq!(priority(None), UNAVAILABLE_PRIORITY);
    }

    #[test]
    fn test_swap_addresses() {
        let msg = Element::builder("message", ns::JABBER_CLIENT)
            .attr("to", "bob@localhost")
            .attr("from", "alice@localhost/home")
            .attr("id", "m1")
            .append(Element::builder("body", ns::JABBER_CLIENT).append("hi"))
            .build();

        let swapped = swap_addresses(&msg);
        assert_eq!(swapped.attr("to"), Some("alice@localhost/home"));
        assert_eq!(swapped.attr("from"), Some("bob@localhost"));
        assert_eq!(swapped.attr("id"), Some("m1"));
        assert!(swapped.get_child("body", ns::JABBER_CLIENT).is_some());
    }

    #[test]
    fn test_swap_addresses_removes_missing_side() {
        let msg = Element::builder("message", ns::JABBER_CLIENT)
            .attr("to", "bob@localhost")
            .build();

        let swapped = swap_addresses(&msg);
        assert_eq!(swapped.attr("to"), None);
        assert_eq!(swapped.attr("from"), Some("bob@localhost"));
    }

    #[test]
    fn test_bounce_keeps_previous_type() {
        let msg = Element::builder("message", ns::JABBER_CLIENT)
            .attr("type", "chat")
            .attr("to", "1@c2s.localhost/abc")
            .append(Element::builder("body", ns::JABBER_CLIENT).append("hi"))
            .build();
        let bounced = bounce(&msg, LegacyError::DISCONNECTED);

        assert_eq!(bounced.attr("type"), Some("error"));
        assert_eq!(bounced.attr("from"), Some("1@c2s.localhost/abc"));
        let err = bounced.get_child("error", ns::JABBER_CLIENT).unwrap();
        assert_eq!(err.attr("code"), Some("510"));
        assert_eq!(err.attr("type"), Some("chat"));
        assert_eq!(err.text(), "Disconnected");
        assert!(is_disconnect_signal(&bounced));
    }

    #[test]
    fn test_disconnect_signal_detection() {
        assert!(is_disconnect_signal(&disconnect_notification()));

        let not_found = error(&Element::builder("message", ns::JABBER_CLIENT).build(), LegacyError::NOT_FOUND);
        assert!(!is_disconnect_signal(&not_found));

        let presence_510 = error(&new_presence(PresenceSubtype::Available, None, None), LegacyError::DISCONNECTED);
        assert!(!is_disconnect_signal(&presence_510));
    }

    #[test]
    fn test_iq_result_drops_children() {
        let mut iq = Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "set")
            .append(Element::builder("query", ns::AUTH).build())
            .build();
        iq.set_attr("id", "auth1");
        iq.set_attr("from", "alice@localhost/home");

        let result = iq_result(&iq);
        assert_eq!(result.attr("type"), Some("result"));
        assert_eq!(result.attr("id"), Some("auth1"));
        assert_eq!(result.attr("to"), Some("alice@localhost/home"));
        assert_eq!(result.children().count(), 0);
    }

    #[test]
    fn test_presence_subtypes() {
        let probe = new_presence(PresenceSubtype::Probe, None, None);
        assert_eq!(PresenceSubtype::of(&probe), PresenceSubtype::Probe);
        assert_eq!(
            PresenceSubtype::of(&new_presence(PresenceSubtype::Available, None, Some("here"))),
            PresenceSubtype::Available
        );
    }

    #[test]
    fn test_timestamp_format() {
        let stamp = timestamp();
        assert_eq!(stamp.len(), 17);
        assert_eq!(&stamp[8..9], "T");
        assert_eq!(&stamp[11..12], ":");
    }

    #[test]
    fn test_stamp_delay_replaces_previous() {
        let mut pres = new_presence(PresenceSubtype::Available, None, None);
        stamp_delay(&mut pres, "alice@localhost/home");
        stamp_delay(&mut pres, "alice@localhost/work");

        let stamps: Vec<_> = pres.children().filter(|c| c.is("x", ns::DELAY)).collect();
        assert_eq!(stamps.len(), 1);
        assert_eq!(stamps[0].attr("from"), Some("alice@localhost/work"));
    }
}
