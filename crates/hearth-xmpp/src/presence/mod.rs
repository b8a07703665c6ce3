//! Presence handling for sessions.
//!
//! Decides who hears about a session's availability and when:
//!
//! - Outbound presence without a destination updates the session's cached
//!   presence and priority, then broadcasts. Logging in probes the user's own
//!   address and every contact the user is subscribed to, and collects every
//!   contact subscribed to the user into avails.
//! - Outbound directed presence is tracked in avails.
//! - Inbound probes are answered from the cache for trusted or already
//!   notified requesters. Echoes of the session's own presence are dropped and
//!   error bounces take the bouncing address out of avails.
//! - Ending a session broadcasts the final unavailable presence.
//! - Presence to a bare user address is copied to each available session.

pub mod registry;

pub use registry::{broadcast, PresenceRegistry};

use std::sync::Arc;

use jid::{FullJid, Jid};
use minidom::Element;
use tracing::{debug, warn};

use crate::sm::handler::{Disposition, HandlerContext, HandlerTable, SessionEvent, SessionHandler};
use crate::sm::session::{Session, User};
use crate::stanza::{self, new_presence, Packet, PresenceSubtype};

/// Register the presence handlers.
///
/// The avails tracker runs before the outbound presence handler, which
/// consumes undirected presence.
pub fn register(table: &mut HandlerTable) {
    let presence = Arc::new(PresenceHandler);
    table.register(SessionEvent::Outbound, Arc::new(AvailsTracker));
    table.register(SessionEvent::Outbound, presence.clone());
    table.register(SessionEvent::Inbound, presence.clone());
    table.register(SessionEvent::End, presence.clone());
    table.register_deliver(presence);
}

/// Tracks directed presence in avails.
pub struct AvailsTracker;

impl SessionHandler for AvailsTracker {
    fn name(&self) -> &'static str {
        "presence.avails"
    }

    fn on_outbound(&self, session: &mut Session, stanza: &Element, _ctx: HandlerContext<'_>) -> Disposition {
        if stanza.name() != "presence" {
            return Disposition::Ignore;
        }
        let Some(to) = stanza::address(stanza, "to") else {
            return Disposition::Pass;
        };

        match PresenceSubtype::of(stanza) {
            PresenceSubtype::Available => {
                debug!(session = %session.id(), to = %to, "Tracking directed presence");
                session.registry.append(to);
            }
            PresenceSubtype::Unavailable => {
                session.registry.remove_first(&to);
            }
            _ => {}
        }

        Disposition::Pass
    }
}

/// Presence broadcast, probe replies and session-end notification.
pub struct PresenceHandler;

impl PresenceHandler {
    /// First available presence of the session.
    fn login(&self, session: &mut Session, stanza: &Element, ctx: HandlerContext<'_>) {
        let owner = Jid::from(session.registry.owner().clone());
        let owner_str = owner.to_string();

        // Presence about ourselves, from our other resources
        let mut probe = new_presence(PresenceSubtype::Probe, Some(&owner), None);
        probe.set_attr("from", owner_str.clone());
        ctx.bus.deliver(Packet::new(probe));

        match ctx.roster.roster(session.registry.owner()) {
            Ok(items) => {
                for item in items {
                    let contact = Jid::from(item.jid);
                    if item.subscription.receives() {
                        debug!(session = %session.id(), contact = %contact, "Probing contact");
                        let mut probe = new_presence(PresenceSubtype::Probe, Some(&contact), None);
                        probe.set_attr("from", owner_str.clone());
                        ctx.bus.deliver(Packet::new(probe));
                    }
                    if item.subscription.sends() {
                        session.registry.append(contact);
                    }
                }
            }
            Err(e) => warn!(session = %session.id(), error = %e, "Failed to fetch roster"),
        }

        session.c_out += session.registry.broadcast_all(stanza, ctx.bus) as u64;
    }
}

impl SessionHandler for PresenceHandler {
    fn name(&self) -> &'static str {
        "presence"
    }

    fn on_outbound(&self, session: &mut Session, stanza: &Element, ctx: HandlerContext<'_>) -> Disposition {
        if stanza.name() != "presence" {
            return Disposition::Ignore;
        }
        if stanza.attr("to").is_some() || PresenceSubtype::of(stanza) == PresenceSubtype::Probe {
            return Disposition::Pass;
        }

        let old_priority = session.priority;
        let mut cached = stanza.clone();
        stanza::stamp_delay(&mut cached, &session.id().to_string());
        session.presence = Some(cached);
        session.priority = stanza::priority(Some(stanza));

        debug!(
            session = %session.id(),
            old_priority,
            new_priority = session.priority,
            "Presence update"
        );

        if old_priority >= 0 {
            if session.priority < 0 {
                session.c_out += session.registry.broadcast_all(stanza, ctx.bus) as u64;
                session.registry.clear();
            } else {
                let trustees = ctx.trust.trustees(session.registry.owner());
                let owner = [Jid::from(session.registry.owner().clone())];
                let sent = broadcast(stanza, &trustees, Some(session.registry.avails()), ctx.bus)
                    + broadcast(stanza, &owner, None, ctx.bus);
                session.c_out += sent as u64;
            }
            return Disposition::Handled;
        }

        // Nobody was told we were available, so nobody needs to hear otherwise
        if session.priority < 0 {
            return Disposition::Handled;
        }

        self.login(session, stanza, ctx);
        Disposition::Handled
    }

    fn on_inbound(&self, session: &mut Session, stanza: &Element, ctx: HandlerContext<'_>) -> Disposition {
        if stanza.name() != "presence" {
            return Disposition::Ignore;
        }
        let from = stanza::address(stanza, "from");
        let subtype = PresenceSubtype::of(stanza);

        if subtype == PresenceSubtype::Probe {
            match (&session.presence, from.as_ref()) {
                (None, from) => {
                    debug!(session = %session.id(), from = ?from, "Probe but no presence to return");
                }
                (Some(presence), Some(from))
                    if ctx.trust.is_trusted(session.registry.owner(), from)
                        || session.registry.contains(from) =>
                {
                    debug!(session = %session.id(), to = %from, "Answering probe");
                    let mut reply = presence.clone();
                    reply.set_attr("to", from.to_string());
                    ctx.bus.deliver(Packet::new(reply));
                }
                (Some(_), from) => {
                    debug!(session = %session.id(), from = ?from, "Probe from someone not qualified");
                }
            }
            return Disposition::Handled;
        }

        if from.as_ref() == Some(&Jid::from(session.id().clone())) {
            return Disposition::Handled;
        }

        if subtype == PresenceSubtype::Error {
            if let Some(from) = from {
                if session.registry.remove_first(&from) {
                    debug!(session = %session.id(), bounced = %from, "Presence bounced, no longer notifying");
                }
            }
        }

        Disposition::Pass
    }

    fn on_end(&self, session: &mut Session, ctx: HandlerContext<'_>) {
        let mut presence = session
            .presence
            .take()
            .unwrap_or_else(|| new_presence(PresenceSubtype::Unavailable, None, None));
        presence.set_attr("from", session.id().to_string());

        session.c_out += session.registry.broadcast_all(&presence, ctx.bus) as u64;
        session.presence = Some(presence);
    }

    fn on_deliver(
        &self,
        user: &User,
        stanza: &Element,
        fanout: &mut Vec<FullJid>,
        _ctx: HandlerContext<'_>,
    ) -> Disposition {
        if stanza.name() != "presence" {
            return Disposition::Ignore;
        }
        let to_bare_user = stanza::address(stanza, "to").is_some_and(|to| to.resource().is_none());
        if !to_bare_user || user.primary().is_none() {
            return Disposition::Pass;
        }

        debug!(user = %user.id(), "Copying presence to available sessions");
        fanout.extend(
            user.sessions
                .iter()
                .filter(|s| s.is_available())
                .map(|s| s.id().clone()),
        );

        // Probes may still be of interest further down the line
        if PresenceSubtype::of(stanza) == PresenceSubtype::Probe {
            Disposition::Pass
        } else {
            Disposition::Handled
        }
    }
}
