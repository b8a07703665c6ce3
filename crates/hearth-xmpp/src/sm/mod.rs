//! Session manager.
//!
//! Owns every user and session of the served domain. It consumes the
//! delivery bus on a single task, so sessions are plain owned data and
//! handlers run without locks. Stanzas reach it from client connections
//! (wrapped in a routing envelope by the connector) and from its own
//! handlers, which put broadcasts and probes back on the bus.

pub mod auth;
pub mod handler;
pub mod session;

pub use auth::{auth_digest, Authenticator, StaticAccounts};
pub use handler::{Disposition, HandlerContext, HandlerTable, SessionEvent, SessionHandler};
pub use session::{Session, User};

use std::collections::HashMap;
use std::sync::Arc;

use jid::{BareJid, FullJid, Jid};
use minidom::Element;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::delivery::Delivery;
use crate::parser::ns;
use crate::presence;
use crate::roster::{build_roster_result, RosterStore, TrustCheck};
use crate::server::ConnectorHandle;
use crate::stanza::{self, LegacyError, Packet, PresenceSubtype, Routing, UNAVAILABLE_PRIORITY};
use crate::XmppError;

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Domain served (e.g. "localhost")
    pub host: String,
    /// Addresses copied on every presence broadcast
    pub bcc: Vec<Jid>,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            bcc: Vec::new(),
        }
    }
}

struct Services {
    bus: Arc<dyn Delivery>,
    roster: Arc<dyn RosterStore>,
    trust: Arc<dyn TrustCheck>,
}

impl Services {
    fn ctx(&self) -> HandlerContext<'_> {
        HandlerContext {
            bus: self.bus.as_ref(),
            roster: self.roster.as_ref(),
            trust: self.trust.as_ref(),
        }
    }
}

/// The session manager for one domain.
pub struct SessionManager {
    host: String,
    host_jid: Jid,
    bcc: Arc<[Jid]>,
    users: HashMap<BareJid, User>,
    /// Connection address to the session it serves
    routes: HashMap<Jid, FullJid>,
    handlers: HandlerTable,
    services: Services,
    accounts: Arc<dyn Authenticator>,
    connector: ConnectorHandle,
}

impl SessionManager {
    /// Create a session manager with the presence handlers registered.
    ///
    /// `bus` must feed back into [`SessionManager::run`]; handlers use it for
    /// everything they send.
    pub fn new(
        config: SessionManagerConfig,
        bus: Arc<dyn Delivery>,
        connector: ConnectorHandle,
        accounts: Arc<dyn Authenticator>,
        roster: Arc<dyn RosterStore>,
        trust: Arc<dyn TrustCheck>,
    ) -> Result<Self, XmppError> {
        let host_jid: Jid = config.host.parse()?;
        if host_jid.node().is_some() || host_jid.resource().is_some() {
            return Err(XmppError::config(format!("session manager host must be a domain: {}", config.host)));
        }

        let mut handlers = HandlerTable::new();
        presence::register(&mut handlers);

        Ok(Self {
            host: config.host,
            host_jid,
            bcc: Arc::from(config.bcc),
            users: HashMap::new(),
            routes: HashMap::new(),
            handlers,
            services: Services { bus, roster, trust },
            accounts,
            connector,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Handler table, for registering extra handlers before running.
    pub fn handlers_mut(&mut self) -> &mut HandlerTable {
        &mut self.handlers
    }

    pub fn user(&self, id: &BareJid) -> Option<&User> {
        self.users.get(id)
    }

    /// Number of live sessions across all users.
    pub fn session_count(&self) -> usize {
        self.users.values().map(|u| u.sessions.len()).sum()
    }

    /// Consume the delivery bus until every sender is gone.
    #[instrument(skip_all, name = "xmpp.sm", fields(host = %self.host))]
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Packet>) {
        info!("Session manager started");
        while let Some(packet) = rx.recv().await {
            self.process(packet);
        }
        info!(sessions = self.session_count(), "Delivery bus closed, session manager stopping");
    }

    /// Handle one packet from the bus.
    pub fn process(&mut self, packet: Packet) {
        let from_client = packet
            .routing
            .as_ref()
            .is_some_and(|r| self.connector.owns(&r.source));

        if from_client {
            self.from_connection(packet);
        } else {
            self.route(packet.element);
        }
    }

    fn from_connection(&mut self, packet: Packet) {
        let Packet { element, routing } = packet;
        let Some(Routing { source, .. }) = routing else {
            return;
        };
        let session = self.routes.get(&source).cloned();

        if stanza::error_code(&element) == Some(LegacyError::DISCONNECTED.code) {
            match session {
                Some(id) => self.end_session(&id, "Disconnected"),
                None => debug!(conn = %source, "Disconnect for a connection without a session"),
            }
            return;
        }

        match session {
            Some(id) => self.outbound(&id, element),
            None => self.pre_auth(source, element),
        }
    }

    /// Traffic from a connection that has no session yet.
    fn pre_auth(&mut self, conn: Jid, element: Element) {
        if element.name() != "iq" {
            debug!(conn = %conn, name = %element.name(), "Dropping stanza from unauthenticated connection");
            return;
        }

        if element.get_child("query", ns::AUTH).is_some() {
            self.auth(conn, &element);
        } else if element.get_child("query", ns::REGISTER).is_some() {
            let reply = self.register(&element);
            self.reply(conn, reply);
        } else {
            debug!(conn = %conn, "Dropping iq from unauthenticated connection");
        }
    }

    /// Reply to a connection from the host itself.
    fn reply(&self, conn: Jid, element: Element) {
        self.connector.deliver(Packet::routed(
            element,
            Routing {
                source: self.host_jid.clone(),
                destination: conn,
            },
        ));
    }

    fn auth(&mut self, conn: Jid, request: &Element) {
        match request.attr("type") {
            Some("get") => {
                let username = request
                    .get_child("query", ns::AUTH)
                    .and_then(|q| q.get_child("username", ns::AUTH))
                    .map(Element::text);

                let mut query = Element::builder("query", ns::AUTH).build();
                let mut field = Element::builder("username", ns::AUTH).build();
                if let Some(username) = username {
                    field.append_text_node(username);
                }
                query.append_child(field);
                for name in ["password", "digest", "resource"] {
                    query.append_child(Element::builder(name, ns::AUTH).build());
                }

                let mut reply = stanza::iq_result(request);
                reply.append_child(query);
                self.reply(conn, reply);
            }
            Some("set") => match self.check_credentials(request) {
                Ok(id) => self.start_session(id, conn, request),
                Err(err) => {
                    debug!(conn = %conn, code = err.code, "Authentication rejected");
                    self.reply(conn, stanza::error(request, err));
                }
            },
            _ => debug!(conn = %conn, "Ignoring auth iq that is neither get nor set"),
        }
    }

    fn check_credentials(&self, request: &Element) -> Result<FullJid, LegacyError> {
        let query = request
            .get_child("query", ns::AUTH)
            .ok_or(LegacyError::BAD_REQUEST)?;
        let field = |name: &str| {
            query
                .get_child(name, ns::AUTH)
                .map(Element::text)
                .filter(|text| !text.is_empty())
        };

        let (Some(username), Some(resource)) = (field("username"), field("resource")) else {
            return Err(LegacyError::BAD_REQUEST);
        };
        let id: FullJid = format!("{}@{}/{}", username, self.host, resource)
            .parse()
            .map_err(|_| LegacyError::BAD_REQUEST)?;
        let user = id.to_bare();

        let digest = query
            .get_child("digest", ns::AUTH)
            .filter(|d| !d.text().is_empty());
        let accepted = match (digest, field("password")) {
            (Some(digest), _) => {
                self.accounts
                    .check_digest(&user, digest.attr("sid").unwrap_or_default(), &digest.text())
            }
            (None, Some(password)) => self.accounts.check_password(&user, &password),
            (None, None) => false,
        };

        if accepted {
            Ok(id)
        } else {
            Err(LegacyError::UNAUTHORIZED)
        }
    }

    fn register(&self, request: &Element) -> Element {
        match request.attr("type") {
            Some("get") => {
                let mut query = Element::builder("query", ns::REGISTER).build();
                query.append_child(
                    Element::builder("instructions", ns::REGISTER)
                        .append("Choose a username and password to register with this server.")
                        .build(),
                );
                query.append_child(Element::builder("username", ns::REGISTER).build());
                query.append_child(Element::builder("password", ns::REGISTER).build());

                let mut reply = stanza::iq_result(request);
                reply.append_child(query);
                reply
            }
            Some("set") => {
                let field = |name: &str| {
                    request
                        .get_child("query", ns::REGISTER)
                        .and_then(|q| q.get_child(name, ns::REGISTER))
                        .map(Element::text)
                        .filter(|text| !text.is_empty())
                };
                let (Some(username), Some(password)) = (field("username"), field("password")) else {
                    return stanza::error(request, LegacyError::BAD_REQUEST);
                };
                let Ok(user) = format!("{}@{}", username, self.host).parse::<BareJid>() else {
                    return stanza::error(request, LegacyError::BAD_REQUEST);
                };

                match self.accounts.register(&user, &password) {
                    Ok(()) => {
                        info!(user = %user, "Account registered");
                        stanza::iq_result(request)
                    }
                    Err(e) => {
                        debug!(user = %user, error = %e, "Registration refused");
                        stanza::error(request, LegacyError::CONFLICT)
                    }
                }
            }
            _ => stanza::error(request, LegacyError::BAD_REQUEST),
        }
    }

    /// Bind a new session to `conn`, replacing any session with the same
    /// address.
    fn start_session(&mut self, id: FullJid, conn: Jid, request: &Element) {
        let user_id = id.to_bare();

        if let Some(old_route) = self
            .users
            .get(&user_id)
            .and_then(|u| u.session(&id))
            .map(|s| s.route().clone())
        {
            info!(session = %id, old = %old_route, "Replacing existing session");
            self.connector.deliver(Packet::routed(
                stanza::disconnect_notification(),
                Routing {
                    source: Jid::from(id.clone()),
                    destination: old_route,
                },
            ));
            self.end_session(&id, "Replaced by new connection");
        }

        let session = Session::new(id.clone(), conn.clone(), self.bcc.clone());
        self.users
            .entry(user_id.clone())
            .or_insert_with(|| User::new(user_id))
            .sessions
            .push(session);
        self.routes.insert(conn.clone(), id.clone());
        info!(session = %id, conn = %conn, "Session started");

        self.connector.deliver(Packet::routed(
            stanza::iq_result(request),
            Routing {
                source: Jid::from(id),
                destination: conn,
            },
        ));
    }

    fn end_session(&mut self, id: &FullJid, reason: &str) {
        let user_id = id.to_bare();
        let Some(user) = self.users.get_mut(&user_id) else {
            return;
        };
        let Some(mut session) = user.take_session(id) else {
            return;
        };
        if user.sessions.is_empty() {
            self.users.remove(&user_id);
        }
        self.routes.remove(session.route());

        session.presence = Some(stanza::new_presence(PresenceSubtype::Unavailable, None, Some(reason)));
        session.priority = UNAVAILABLE_PRIORITY;
        self.handlers.run_end(&mut session, self.services.ctx());

        info!(
            session = %id,
            reason,
            c_in = session.c_in,
            c_out = session.c_out,
            "Session ended"
        );
    }

    /// A stanza sent by a session's client.
    fn outbound(&mut self, id: &FullJid, mut element: Element) {
        element.set_attr("from", id.to_string());

        let Some(session) = self.users.get_mut(&id.to_bare()).and_then(|u| u.session_mut(id)) else {
            return;
        };
        session.c_out += 1;
        if self.handlers.run_outbound(session, &element, self.services.ctx()) == Disposition::Handled {
            return;
        }

        if element.name() == "iq" {
            let to = stanza::address(&element, "to");
            let for_server = match &to {
                None => true,
                Some(to) => *to == self.host_jid || *to == Jid::from(id.to_bare()),
            };
            if for_server {
                self.server_iq(id, &element);
                return;
            }
        }

        self.route(element);
    }

    /// An iq the server answers on the session's behalf.
    fn server_iq(&mut self, id: &FullJid, request: &Element) {
        let iq_type = request.attr("type");
        let reply = if iq_type == Some("get") && request.get_child("query", ns::ROSTER).is_some() {
            match self.services.roster.roster(&id.to_bare()) {
                Ok(items) => build_roster_result(request, &items),
                Err(e) => {
                    warn!(session = %id, error = %e, "Failed to fetch roster");
                    stanza::error(request, LegacyError::UNAVAILABLE)
                }
            }
        } else if matches!(iq_type, Some("get") | Some("set")) {
            stanza::error(request, LegacyError::UNAVAILABLE)
        } else {
            return;
        };

        self.to_session(id, reply);
    }

    /// Route a stanza by its `to` attribute.
    fn route(&mut self, element: Element) {
        let Some(to) = stanza::address(&element, "to") else {
            trace!(name = %element.name(), "Dropping stanza without a destination");
            return;
        };
        if to.domain().as_str() != self.host {
            debug!(to = %to, "No route to remote host, dropping");
            return;
        }
        if to.node().is_none() {
            if matches!(element.attr("type"), Some("get") | Some("set")) && element.name() == "iq" {
                self.bounce(&element, LegacyError::UNAVAILABLE);
            } else {
                trace!(name = %element.name(), "Dropping stanza for the host");
            }
            return;
        }

        let user_id = to.to_bare();
        if self.users.contains_key(&user_id) {
            self.deliver(&user_id, &to, element);
        } else {
            self.offline(&user_id, &element);
        }
    }

    /// Stanza for a user with no sessions.
    fn offline(&self, user_id: &BareJid, element: &Element) {
        if !self.accounts.exists(user_id) {
            match element.name() {
                "iq" if !matches!(element.attr("type"), Some("get") | Some("set")) => {}
                _ => self.bounce(element, LegacyError::NOT_FOUND),
            }
            return;
        }

        match element.name() {
            "message" => self.bounce(element, LegacyError::UNAVAILABLE),
            "iq" if matches!(element.attr("type"), Some("get") | Some("set")) => {
                self.bounce(element, LegacyError::UNAVAILABLE)
            }
            _ => trace!(user = %user_id, "Dropping stanza for offline user"),
        }
    }

    /// Send the error form of `element` back to its sender. Errors are never
    /// bounced.
    fn bounce(&self, element: &Element, err: LegacyError) {
        if element.attr("type") == Some("error") {
            trace!("Not bouncing an error");
            return;
        }
        debug!(to = ?element.attr("to"), from = ?element.attr("from"), code = err.code, "Bouncing stanza");
        self.services.bus.deliver(Packet::new(stanza::error(element, err)));
    }

    /// Deliver to a local user with at least one session.
    fn deliver(&mut self, user_id: &BareJid, to: &Jid, element: Element) {
        let Some(user) = self.users.get(user_id) else {
            return;
        };

        let mut fanout = Vec::new();
        let disposition = self
            .handlers
            .run_deliver(user, &element, &mut fanout, self.services.ctx());

        let target = to
            .clone()
            .try_into_full()
            .ok()
            .filter(|full| user.session(full).is_some());
        let primary = user.primary().map(|s| s.id().clone());

        for id in &fanout {
            self.to_session(id, element.clone());
        }
        if disposition == Disposition::Handled {
            return;
        }

        match (element.name(), target) {
            (_, Some(id)) => self.to_session(&id, element),
            ("message", None) => match primary {
                Some(id) => self.to_session(&id, element),
                None => self.bounce(&element, LegacyError::UNAVAILABLE),
            },
            ("iq", None) => self.bounce(&element, LegacyError::UNAVAILABLE),
            _ => trace!(to = %to, "No session for stanza, dropping"),
        }
    }

    /// Hand a stanza to a session: inbound handlers, then its connection.
    fn to_session(&mut self, id: &FullJid, element: Element) {
        let Some(session) = self.users.get_mut(&id.to_bare()).and_then(|u| u.session_mut(id)) else {
            trace!(session = %id, "Session vanished before delivery");
            return;
        };
        if self.handlers.run_inbound(session, &element, self.services.ctx()) == Disposition::Handled {
            return;
        }

        session.c_in += 1;
        let routing = Routing {
            source: Jid::from(id.clone()),
            destination: session.route().clone(),
        };
        self.connector.deliver(Packet::routed(element, routing));
    }
}
