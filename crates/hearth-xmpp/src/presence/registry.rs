//! Per-session presence notification targets.

use std::sync::Arc;

use jid::{BareJid, Jid};
use minidom::Element;
use tracing::trace;

use crate::delivery::Delivery;
use crate::stanza::Packet;

/// Who learns about one session's presence.
///
/// `bcc` is fixed at startup and shared by every session. `avails` is built
/// up while the session is available and is deliberately not deduplicated:
/// announcing availability twice against the same roster lists the same
/// contacts twice. The owner's bare address is kept separately and is never
/// an element of `avails`.
#[derive(Debug, Clone)]
pub struct PresenceRegistry {
    owner: BareJid,
    avails: Vec<Jid>,
    bcc: Arc<[Jid]>,
}

impl PresenceRegistry {
    pub fn new(owner: BareJid, bcc: Arc<[Jid]>) -> Self {
        Self {
            owner,
            avails: Vec::new(),
            bcc,
        }
    }

    /// Bare address of the session's user.
    pub fn owner(&self) -> &BareJid {
        &self.owner
    }

    pub fn avails(&self) -> &[Jid] {
        &self.avails
    }

    pub fn bcc(&self) -> &[Jid] {
        &self.bcc
    }

    /// Append to avails, duplicates included.
    pub fn append(&mut self, jid: Jid) {
        self.avails.push(jid);
    }

    /// Exact-address membership in avails.
    pub fn contains(&self, jid: &Jid) -> bool {
        self.avails.iter().any(|j| j == jid)
    }

    /// Remove the first exact match from avails. Later duplicates stay.
    pub fn remove_first(&mut self, jid: &Jid) -> bool {
        match self.avails.iter().position(|j| j == jid) {
            Some(index) => {
                self.avails.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.avails.clear();
    }

    /// Unconditional broadcast to bcc, the owner's other resources, then
    /// avails. Returns how many copies went out.
    pub fn broadcast_all(&self, source: &Element, bus: &dyn Delivery) -> usize {
        let owner = [Jid::from(self.owner.clone())];
        broadcast(source, &self.bcc, None, bus)
            + broadcast(source, &owner, None, bus)
            + broadcast(source, &self.avails, None, bus)
    }
}

/// Send a copy of `source` to each target.
///
/// With a `filter`, targets not in it (exact address match) are skipped.
/// Fire-and-forget: failures come back later as error-typed bounces.
pub fn broadcast(source: &Element, targets: &[Jid], filter: Option<&[Jid]>, bus: &dyn Delivery) -> usize {
    let mut sent = 0;
    for target in targets {
        if let Some(filter) = filter {
            if !filter.contains(target) {
                continue;
            }
        }

        let mut copy = source.clone();
        copy.set_attr("to", target.to_string());
        trace!(to = %target, "Broadcasting presence");
        bus.deliver(Packet::new(copy));
        sent += 1;
    }
    sent
}
