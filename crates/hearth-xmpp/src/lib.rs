//! # hearth-xmpp
//!
//! Client connector and presence engine for a Jabber session router.
//!
//! ## Architecture
//!
//! - **Connector**: one task owns the listener and every client socket,
//!   driven by readiness plus a coarse tick. Each connection is a small state
//!   machine (`Unknown`, `Authenticated`, `Closing`) that only lets auth and
//!   registration through before login.
//! - **Write dispatch**: packets queued for a connection are checked for the
//!   auth result and the forced-disconnect signal before they are serialized.
//! - **Session manager**: a single task consuming the delivery bus. It owns
//!   users and sessions and runs per-event handler chains.
//! - **Presence**: handlers that maintain each session's notification list,
//!   answer probes and fan presence out to available resources.
//!
//! Everything between the connector and the session manager travels as a
//! [`stanza::Packet`]: the wire element plus an internal routing envelope
//! that never reaches a client.

pub mod connection;
pub mod delivery;
pub mod dispatch;
pub mod parser;
pub mod presence;
pub mod roster;
pub mod server;
pub mod sm;
pub mod stanza;

mod error;
mod types;

pub use delivery::{ChannelDelivery, Delivery, PendingWrite};
pub use error::{generate_stream_error, stream_errors, StanzaErrorCondition, StanzaErrorType, XmppError};
pub use parser::{ns, StreamHeader};
pub use server::{BoundConnector, Connector, ConnectorConfig, ConnectorHandle};
pub use sm::{SessionManager, SessionManagerConfig};
pub use stanza::{Packet, Routing};
pub use types::*;
