//! Users and their sessions.

use std::sync::Arc;

use jid::{BareJid, FullJid, Jid};
use minidom::Element;

use crate::presence::PresenceRegistry;
use crate::stanza::UNAVAILABLE_PRIORITY;

/// One logged-in resource of a user.
#[derive(Debug)]
pub struct Session {
    id: FullJid,
    /// Derived identity of the connection serving this session
    route: Jid,
    /// Priority announced by the last presence, or the unavailable sentinel
    pub priority: i16,
    /// Last presence the client announced, stamped
    pub presence: Option<Element>,
    pub registry: PresenceRegistry,
    /// Stanzas delivered to the client
    pub c_in: u64,
    /// Stanzas sent on behalf of the client
    pub c_out: u64,
}

impl Session {
    pub fn new(id: FullJid, route: Jid, bcc: Arc<[Jid]>) -> Self {
        let registry = PresenceRegistry::new(id.to_bare(), bcc);
        Self {
            id,
            route,
            priority: UNAVAILABLE_PRIORITY,
            presence: None,
            registry,
            c_in: 0,
            c_out: 0,
        }
    }

    /// Canonical address of the session.
    pub fn id(&self) -> &FullJid {
        &self.id
    }

    pub fn route(&self) -> &Jid {
        &self.route
    }

    pub fn is_available(&self) -> bool {
        self.priority >= 0
    }
}

/// A local user with its live sessions.
#[derive(Debug)]
pub struct User {
    id: BareJid,
    pub sessions: Vec<Session>,
}

impl User {
    pub fn new(id: BareJid) -> Self {
        Self {
            id,
            sessions: Vec::new(),
        }
    }

    pub fn id(&self) -> &BareJid {
        &self.id
    }

    /// Highest-priority available session; the earliest wins ties.
    pub fn primary(&self) -> Option<&Session> {
        self.sessions
            .iter()
            .filter(|s| s.is_available())
            .fold(None, |best: Option<&Session>, s| match best {
                Some(b) if b.priority >= s.priority => Some(b),
                _ => Some(s),
            })
    }

    pub fn session(&self, id: &FullJid) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    pub fn session_mut(&mut self, id: &FullJid) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id() == id)
    }

    /// Remove and return the session with the given address.
    pub fn take_session(&mut self, id: &FullJid) -> Option<Session> {
        let index = self.sessions.iter().position(|s| s.id() == id)?;
        Some(self.sessions.remove(index))
    }
}
