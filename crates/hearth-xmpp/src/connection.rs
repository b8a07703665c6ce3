//! Per-connection protocol state machine.
//!
//! A [`Connection`] owns the decoder for one socket and turns decoder events
//! into frames for the client and packets for the delivery bus. It never
//! touches the socket itself; the connector writes the returned frames.

use jid::{FullJid, Jid};
use minidom::Element;
use tracing::{debug, info, warn};

use crate::delivery::Delivery;
use crate::error::{generate_stream_error, stream_errors};
use crate::parser::{escape_xml, ns, StreamDecoder, StreamEvent, StreamHeader};
use crate::stanza::{self, Packet, Routing};
use crate::types::{ConnId, ConnectionState, StanzaType};
use crate::XmppError;

/// Client connection state.
pub struct Connection {
    id: ConnId,
    /// Derived identity, `<id>@<connector host>/<resource>`
    address: FullJid,
    state: ConnectionState,
    /// Host the client asked for in its stream header
    host: Option<Jid>,
    /// Where accepted stanzas are routed; the session once authenticated
    route: Option<Jid>,
    session_id: Option<String>,
    /// Id of the pending auth request
    auth_id: Option<String>,
    decoder: StreamDecoder,
    /// Set once the disconnect notification has gone out
    notified: bool,
}

impl Connection {
    /// Create the state for a freshly accepted socket.
    pub fn new(id: ConnId, connector_host: &str, max_stanza_bytes: usize) -> Result<Self, XmppError> {
        let resource = uuid::Uuid::new_v4().simple().to_string();
        let address: FullJid = format!("{}@{}/{}", id, connector_host, &resource[..8]).parse()?;

        Ok(Self {
            id,
            address,
            state: ConnectionState::Unknown,
            host: None,
            route: None,
            session_id: None,
            auth_id: None,
            decoder: StreamDecoder::with_limit(max_stanza_bytes),
            notified: false,
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Derived identity used to address this connection.
    pub fn address(&self) -> &FullJid {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Id of the auth request still waiting for its result.
    pub fn auth_id(&self) -> Option<&str> {
        self.auth_id.as_deref()
    }

    /// Confirmed routing address of the session, once authenticated.
    pub fn route(&self) -> Option<&Jid> {
        self.route.as_ref()
    }

    /// Move to `next`, ignoring transitions that would go backwards.
    fn advance(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        debug!(conn = %self.id, from = %self.state, to = %next, "Connection state change");
        self.state = next;
        true
    }

    /// Feed bytes read from the socket.
    ///
    /// Returns the frames to write back, in order. When the connection is
    /// `Closing` afterwards the connector tears it down.
    pub fn ingest(&mut self, data: &[u8], bus: &dyn Delivery) -> Vec<String> {
        let mut frames = Vec::new();

        for event in self.decoder.feed(data) {
            if self.state == ConnectionState::Closing {
                break;
            }
            match event {
                StreamEvent::Open(header) => self.open(header, &mut frames),
                StreamEvent::Node(element) => self.node(element, bus, &mut frames),
                StreamEvent::Error(reason) => {
                    debug!(conn = %self.id, %reason, "Malformed XML from client");
                    frames.push(generate_stream_error(
                        stream_errors::NOT_WELL_FORMED,
                        Some("You sent malformed XML"),
                    ));
                    self.close(bus);
                }
                StreamEvent::Close => {
                    debug!(conn = %self.id, "Client closed stream");
                    self.close(bus);
                }
            }
        }

        frames
    }

    fn open(&mut self, header: StreamHeader, frames: &mut Vec<String>) {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let host = header.to.as_deref().and_then(|to| to.parse::<Jid>().ok());

        // Only a parsed host is echoed back
        let from = host.as_ref().map(Jid::to_string).unwrap_or_default();
        frames.push(stream_header(&session_id, &from));
        self.session_id = Some(session_id);

        match host {
            Some(host) => {
                debug!(conn = %self.id, host = %host, "Stream opened");
                self.route = Some(host.clone());
                self.host = Some(host);
            }
            None => {
                debug!(conn = %self.id, to = ?header.to, "Stream header without a usable host");
                frames.push(generate_stream_error(stream_errors::HOST_UNKNOWN, None));
                self.advance(ConnectionState::Closing);
            }
        }
    }

    fn node(&mut self, mut element: Element, bus: &dyn Delivery, frames: &mut Vec<String>) {
        if self.state == ConnectionState::Unknown && !self.accept_pre_auth(&mut element) {
            debug!(
                conn = %self.id,
                stanza_type = %StanzaType::of(&element),
                "Rejecting stanza before authentication"
            );
            frames.push(generate_stream_error(stream_errors::NOT_AUTHORIZED, None));
            self.advance(ConnectionState::Closing);
            return;
        }

        let Some(destination) = self.route.clone() else {
            return;
        };

        bus.deliver(Packet::routed(
            element,
            Routing {
                source: Jid::from(self.address.clone()),
                destination,
            },
        ));
    }

    /// Gate traffic before authentication.
    ///
    /// Only iq stanzas carrying an auth or registration query get through.
    /// A digest gets this stream's id attached. Only an auth `set` has its
    /// request id recorded, since only its result means the client logged in.
    fn accept_pre_auth(&mut self, element: &mut Element) -> bool {
        if element.name() != "iq" {
            return false;
        }
        if element.get_child("query", ns::REGISTER).is_some() {
            return true;
        }
        if element.get_child("query", ns::AUTH).is_none() {
            return false;
        }

        if let (Some(sid), Some(query)) = (self.session_id.as_deref(), element.get_child_mut("query", ns::AUTH)) {
            if let Some(digest) = query.get_child_mut("digest", ns::AUTH) {
                digest.set_attr("sid", sid);
            }
        }

        let auth_id = match element.attr("id") {
            Some(id) => id.to_string(),
            None => {
                let id = format!("auth{}", self.id);
                element.set_attr("id", id.clone());
                id
            }
        };
        if element.attr("type") == Some("set") {
            self.auth_id = Some(auth_id);
        }
        true
    }

    /// Mark the connection authenticated; `route` is the session's address.
    pub fn authenticate(&mut self, route: Jid) {
        if self.advance(ConnectionState::Authenticated) {
            info!(conn = %self.id, route = %route, "Connection authenticated");
            self.route = Some(route);
            self.auth_id = None;
        }
    }

    /// Close on our own initiative (client close, parse error, lost socket).
    ///
    /// An authenticated connection tells the session manager exactly once.
    pub fn close(&mut self, bus: &dyn Delivery) {
        if self.state == ConnectionState::Authenticated && !self.notified {
            self.notified = true;
            match (&self.route, &self.host) {
                (Some(route), _) | (None, Some(route)) => {
                    debug!(conn = %self.id, "Notifying session manager of disconnect");
                    bus.deliver(Packet::routed(
                        stanza::disconnect_notification(),
                        Routing {
                            source: Jid::from(self.address.clone()),
                            destination: route.clone(),
                        },
                    ));
                }
                (None, None) => warn!(conn = %self.id, "Authenticated connection without a route"),
            }
        }
        self.advance(ConnectionState::Closing);
    }

    /// Close because upstream told us to. Upstream already knows, so no
    /// notification is sent.
    pub fn force_closing(&mut self) {
        self.notified = true;
        self.advance(ConnectionState::Closing);
    }
}

/// Stream header sent in reply to the client's.
pub fn stream_header(session_id: &str, host: &str) -> String {
    format!(
        "<?xml version='1.0'?>\
        <stream:stream xmlns='{}' \
        xmlns:stream='{}' \
        id='{}' from='{}'>",
        ns::JABBER_CLIENT,
        ns::STREAM,
        escape_xml(session_id),
        escape_xml(host)
    )
}
