//! Typed handler dispatch for session events.
//!
//! Handlers are registered once, at setup, for the events they care about.
//! Each event kind runs its handlers in registration order until one of them
//! claims the stanza.

use std::sync::Arc;

use jid::FullJid;
use minidom::Element;

use super::session::{Session, User};
use crate::delivery::Delivery;
use crate::roster::{RosterStore, TrustCheck};

/// Outcome of running one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not interested in this stanza
    Ignore,
    /// Looked at it; later handlers and default routing still apply
    Pass,
    /// Consumed; nothing else happens to the stanza
    Handled,
}

/// Per-session events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// A stanza on its way to the session's client
    Inbound,
    /// A stanza sent by the session's client
    Outbound,
    /// The session is ending
    End,
}

/// Shared services available to handlers.
#[derive(Clone, Copy)]
pub struct HandlerContext<'a> {
    pub bus: &'a dyn Delivery,
    pub roster: &'a dyn RosterStore,
    pub trust: &'a dyn TrustCheck,
}

/// A handler for session events and the user-level deliver phase.
///
/// Every method defaults to ignoring the event.
pub trait SessionHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    fn on_outbound(&self, _session: &mut Session, _stanza: &Element, _ctx: HandlerContext<'_>) -> Disposition {
        Disposition::Ignore
    }

    fn on_inbound(&self, _session: &mut Session, _stanza: &Element, _ctx: HandlerContext<'_>) -> Disposition {
        Disposition::Ignore
    }

    fn on_end(&self, _session: &mut Session, _ctx: HandlerContext<'_>) {}

    /// Deliver phase for a stanza addressed to a local user.
    ///
    /// Sessions pushed onto `fanout` each get their own copy through the
    /// inbound chain.
    fn on_deliver(
        &self,
        _user: &User,
        _stanza: &Element,
        _fanout: &mut Vec<FullJid>,
        _ctx: HandlerContext<'_>,
    ) -> Disposition {
        Disposition::Ignore
    }
}

/// Handlers registered per event kind.
#[derive(Default, Clone)]
pub struct HandlerTable {
    inbound: Vec<Arc<dyn SessionHandler>>,
    outbound: Vec<Arc<dyn SessionHandler>>,
    end: Vec<Arc<dyn SessionHandler>>,
    deliver: Vec<Arc<dyn SessionHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for a session event.
    pub fn register(&mut self, event: SessionEvent, handler: Arc<dyn SessionHandler>) {
        match event {
            SessionEvent::Inbound => self.inbound.push(handler),
            SessionEvent::Outbound => self.outbound.push(handler),
            SessionEvent::End => self.end.push(handler),
        }
    }

    /// Register `handler` for the deliver phase.
    pub fn register_deliver(&mut self, handler: Arc<dyn SessionHandler>) {
        self.deliver.push(handler);
    }

    pub fn run_outbound(&self, session: &mut Session, stanza: &Element, ctx: HandlerContext<'_>) -> Disposition {
        chain(&self.outbound, |h| h.on_outbound(session, stanza, ctx))
    }

    pub fn run_inbound(&self, session: &mut Session, stanza: &Element, ctx: HandlerContext<'_>) -> Disposition {
        chain(&self.inbound, |h| h.on_inbound(session, stanza, ctx))
    }

    pub fn run_end(&self, session: &mut Session, ctx: HandlerContext<'_>) {
        for handler in &self.end {
            handler.on_end(session, ctx);
        }
    }

    pub fn run_deliver(
        &self,
        user: &User,
        stanza: &Element,
        fanout: &mut Vec<FullJid>,
        ctx: HandlerContext<'_>,
    ) -> Disposition {
        chain(&self.deliver, |h| h.on_deliver(user, stanza, fanout, ctx))
    }
}

fn chain(
    handlers: &[Arc<dyn SessionHandler>],
    mut run: impl FnMut(&dyn SessionHandler) -> Disposition,
) -> Disposition {
    let mut outcome = Disposition::Ignore;
    for handler in handlers {
        match run(handler.as_ref()) {
            Disposition::Handled => {
                tracing::trace!(handler = handler.name(), "Stanza handled");
                return Disposition::Handled;
            }
            Disposition::Pass => outcome = Disposition::Pass,
            Disposition::Ignore => {}
        }
    }
    outcome
}
