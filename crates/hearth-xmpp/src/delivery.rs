//! Delivery bus seams.
//!
//! Delivery is fire-and-forget: callers hand a packet over and never learn
//! whether it arrived. Failures come back later as bounced error stanzas.

use jid::FullJid;
use tokio::sync::mpsc;
use tracing::warn;

use crate::stanza::Packet;

/// Something packets can be handed to.
pub trait Delivery: Send + Sync {
    /// Submit a packet. Never blocks and never reports failure.
    fn deliver(&self, packet: Packet);
}

/// Delivery onto an unbounded channel, consumed by a single task.
#[derive(Debug, Clone)]
pub struct ChannelDelivery {
    tx: mpsc::UnboundedSender<Packet>,
}

impl ChannelDelivery {
    /// Create the bus and the receiving end for its consumer.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Delivery for ChannelDelivery {
    fn deliver(&self, packet: Packet) {
        if self.tx.send(packet).is_err() {
            warn!("Delivery bus consumer is gone, dropping packet");
        }
    }
}

/// A stanza queued for one client connection.
///
/// Ownership passes to the connector once enqueued.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    /// Derived identity of the destination connection
    pub to: FullJid,
    /// The packet to write
    pub packet: Packet,
}
