//! Roster storage abstraction.

use dashmap::DashMap;
use jid::BareJid;

use super::{RosterItem, Subscription};
use crate::XmppError;

/// Read access to user rosters.
///
/// Fetches are synchronous; the presence handlers call them inline.
pub trait RosterStore: Send + Sync + 'static {
    /// Get all roster items for a user.
    fn roster(&self, user: &BareJid) -> Result<Vec<RosterItem>, XmppError>;

    /// Get a single roster item, if the contact is on the user's roster.
    fn item(&self, user: &BareJid, contact: &BareJid) -> Result<Option<RosterItem>, XmppError> {
        Ok(self.roster(user)?.into_iter().find(|item| item.jid == *contact))
    }
}

/// Roster store held in memory, seeded from configuration.
#[derive(Debug, Default)]
pub struct InMemoryRoster {
    rosters: DashMap<BareJid, Vec<RosterItem>>,
}

impl InMemoryRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a contact on a user's roster.
    pub fn set_item(&self, user: BareJid, item: RosterItem) {
        let mut items = self.rosters.entry(user).or_default();
        match items.iter_mut().find(|existing| existing.jid == item.jid) {
            Some(existing) => *existing = item,
            None => items.push(item),
        }
    }

    /// Convenience for seeding: add `contact` with `subscription`.
    pub fn add(&self, user: BareJid, contact: BareJid, subscription: Subscription) {
        self.set_item(user, RosterItem::new(contact).set_subscription(subscription));
    }
}

impl RosterStore for InMemoryRoster {
    fn roster(&self, user: &BareJid) -> Result<Vec<RosterItem>, XmppError> {
        Ok(self
            .rosters
            .get(user)
            .map(|items| items.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare(s: &str) -> BareJid {
        s.parse().unwrap()
    }

    #[test]
    fn test_unknown_user_has_empty_roster() {
        let store = InMemoryRoster::new();
        assert!(store.roster(&bare("nobody@localhost")).unwrap().is_empty());
    }

    #[test]
    fn test_set_item_replaces_existing() {
        let store = InMemoryRoster::new();
        store.add(bare("alice@localhost"), bare("bob@localhost"), Subscription::To);
        store.add(bare("alice@localhost"), bare("bob@localhost"), Subscription::Both);
        store.add(bare("alice@localhost"), bare("carol@localhost"), Subscription::From);

        let roster = store.roster(&bare("alice@localhost")).unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].subscription, Subscription::Both);

        let carol = store
            .item(&bare("alice@localhost"), &bare("carol@localhost"))
            .unwrap()
            .unwrap();
        assert_eq!(carol.subscription, Subscription::From);
    }
}
