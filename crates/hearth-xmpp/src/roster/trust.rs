//! Presence authorization.

use std::sync::Arc;

use jid::{BareJid, Jid};
use tracing::warn;

use super::RosterStore;

/// Decides who may see a user's presence.
pub trait TrustCheck: Send + Sync + 'static {
    /// Whether `requester` may see `owner`'s presence.
    fn is_trusted(&self, owner: &BareJid, requester: &Jid) -> bool;

    /// Everyone `owner` trusts, as bare addresses.
    fn trustees(&self, owner: &BareJid) -> Vec<Jid>;
}

/// Trust derived from the roster: contacts subscribed to the owner's
/// presence (`from` or `both`) are trusted, and so is the owner.
pub struct RosterTrust {
    roster: Arc<dyn RosterStore>,
}

impl RosterTrust {
    pub fn new(roster: Arc<dyn RosterStore>) -> Self {
        Self { roster }
    }
}

impl TrustCheck for RosterTrust {
    fn is_trusted(&self, owner: &BareJid, requester: &Jid) -> bool {
        let requester = requester.to_bare();
        if requester == *owner {
            return true;
        }

        match self.roster.item(owner, &requester) {
            Ok(item) => item.is_some_and(|item| item.subscription.sends()),
            Err(e) => {
                warn!(owner = %owner, error = %e, "Roster lookup failed during trust check");
                false
            }
        }
    }

    fn trustees(&self, owner: &BareJid) -> Vec<Jid> {
        match self.roster.roster(owner) {
            Ok(items) => items
                .into_iter()
                .filter(|item| item.subscription.sends())
                .map(|item| Jid::from(item.jid))
                .collect(),
            Err(e) => {
                warn!(owner = %owner, error = %e, "Roster lookup failed while listing trustees");
                Vec::new()
            }
        }
    }
}
