//! Client connector.
//!
//! One task owns the listening socket and every client connection. It waits
//! on accept readiness, socket reads, the message port carrying
//! [`PendingWrite`]s from the rest of the system, writer failures and a
//! coarse housekeeping tick. All connection state is mutated inside that
//! task, so the connection table needs no locking.
//!
//! Socket writes happen on one small task per connection fed by a bounded
//! queue, so a stalled peer never blocks the loop. A full queue counts as a
//! failed write.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use futures::StreamExt;
use jid::{FullJid, Jid};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::StreamMap;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, info, info_span, instrument, trace, warn, Instrument};

use crate::connection::Connection;
use crate::delivery::{Delivery, PendingWrite};
use crate::dispatch::{dispatch, Dispatch};
use crate::parser::{DEFAULT_MAX_STANZA_BYTES, STREAM_CLOSE};
use crate::stanza::{self, LegacyError, Packet, Routing};
use crate::types::{ConnId, ConnectionState};
use crate::XmppError;

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Host part of derived connection identities (e.g. "c2s.localhost")
    pub host: String,
    /// Address to accept client connections on (default: 0.0.0.0:5222)
    pub listen: SocketAddr,
    /// Housekeeping tick (default: 20ms)
    pub tick: Duration,
    /// Frames buffered per connection before it counts as stalled
    pub write_queue: usize,
    /// Largest stanza accepted from a client
    pub max_stanza_bytes: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            host: "c2s.localhost".to_string(),
            listen: SocketAddr::from(([0, 0, 0, 0], 5222)),
            tick: Duration::from_millis(20),
            write_queue: 256,
            max_stanza_bytes: DEFAULT_MAX_STANZA_BYTES,
        }
    }
}

/// Cloneable handle for queueing packets to the connector.
///
/// This is the producer side of the message port; any task may hold one.
#[derive(Debug, Clone)]
pub struct ConnectorHandle {
    host: Arc<str>,
    tx: mpsc::UnboundedSender<PendingWrite>,
}

impl ConnectorHandle {
    /// Create a handle and the receiving end of its message port.
    pub fn channel(host: &str) -> (Self, mpsc::UnboundedReceiver<PendingWrite>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                host: Arc::from(host),
                tx,
            },
            rx,
        )
    }

    /// Host part of the identities this connector hands out.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether `jid` is one of this connector's connection identities.
    pub fn owns(&self, jid: &Jid) -> bool {
        jid.domain().as_str() == &*self.host
    }

    /// Queue a write. Dropped if the connector is gone.
    pub fn send(&self, write: PendingWrite) {
        if self.tx.send(write).is_err() {
            debug!("Connector is not running, dropping write");
        }
    }
}

impl Delivery for ConnectorHandle {
    fn deliver(&self, packet: Packet) {
        let target = packet
            .routing
            .as_ref()
            .map(|r| r.destination.clone())
            .or_else(|| packet.to());

        match target.map(Jid::try_into_full) {
            Some(Ok(to)) => self.send(PendingWrite { to, packet }),
            _ => debug!("Dropping packet without a connection address"),
        }
    }
}

/// Client connector, not yet listening.
pub struct Connector {
    config: ConnectorConfig,
    bus: Arc<dyn Delivery>,
    handle: ConnectorHandle,
    port_rx: mpsc::UnboundedReceiver<PendingWrite>,
}

impl Connector {
    /// Create a connector that hands client traffic to `bus`.
    pub fn new(config: ConnectorConfig, bus: Arc<dyn Delivery>) -> Self {
        let (handle, port_rx) = ConnectorHandle::channel(&config.host);
        Self {
            config,
            bus,
            handle,
            port_rx,
        }
    }

    /// Handle for queueing writes. Valid before and after the connector runs.
    pub fn handle(&self) -> ConnectorHandle {
        self.handle.clone()
    }

    /// Bind the listening socket.
    #[instrument(skip(self), fields(listen = %self.config.listen))]
    pub async fn bind(self) -> Result<BoundConnector, XmppError> {
        let listener = TcpListener::bind(self.config.listen).await?;
        info!(addr = %self.config.listen, host = %self.config.host, "Client connector listening");

        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Ok(BoundConnector {
            listener,
            config: self.config,
            bus: self.bus,
            port_rx: self.port_rx,
            failures_tx,
            failures_rx,
        })
    }
}

/// Client connector with a bound listening socket.
pub struct BoundConnector {
    listener: TcpListener,
    config: ConnectorConfig,
    bus: Arc<dyn Delivery>,
    port_rx: mpsc::UnboundedReceiver<PendingWrite>,
    failures_tx: mpsc::UnboundedSender<ConnId>,
    failures_rx: mpsc::UnboundedReceiver<ConnId>,
}

impl BoundConnector {
    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, XmppError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the event loop.
    pub async fn serve(self) {
        let BoundConnector {
            listener,
            config,
            bus,
            mut port_rx,
            failures_tx,
            mut failures_rx,
        } = self;

        let span = info_span!("xmpp.connector", host = %config.host);
        let mut table = ConnectionTable {
            config,
            bus,
            conns: HashMap::new(),
            reads: StreamMap::new(),
            failures_tx,
            next_id: 1,
        };

        async move {
            let mut tick = tokio::time::interval(table.config.tick);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut port_open = true;

            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => table.accept(stream, peer),
                        Err(e) => warn!(error = %e, "Failed to accept client connection"),
                    },
                    Some((id, event)) = table.reads.next(), if !table.reads.is_empty() => {
                        table.read(id, event);
                    }
                    write = port_rx.recv(), if port_open => match write {
                        Some(write) => {
                            table.route(write);
                            // Drain whatever else is already queued
                            while let Ok(write) = port_rx.try_recv() {
                                table.route(write);
                            }
                        }
                        None => port_open = false,
                    },
                    Some(id) = failures_rx.recv() => {
                        table.teardown(id, false);
                    }
                    _ = tick.tick() => {
                        trace!(connections = table.conns.len(), "Connector tick");
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

enum ReadEvent {
    Data(BytesMut),
    Failed(io::Error),
    Eof,
}

type ReadStream = Pin<Box<dyn Stream<Item = ReadEvent> + Send>>;

fn read_stream(read: OwnedReadHalf) -> ReadStream {
    let frames = FramedRead::new(read, BytesCodec::new()).map(|result| match result {
        Ok(bytes) => ReadEvent::Data(bytes),
        Err(e) => ReadEvent::Failed(e),
    });
    Box::pin(frames.chain(stream::once(async { ReadEvent::Eof })))
}

/// Write frames to the socket until the sender is dropped, then shut it down.
fn spawn_writer(
    id: ConnId,
    mut write: OwnedWriteHalf,
    depth: usize,
    failures: mpsc::UnboundedSender<ConnId>,
) -> mpsc::Sender<Bytes> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(depth.max(1));

    tokio::spawn(
        async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = write.write_all(&frame).await {
                    debug!(error = %e, "Write failed");
                    let _ = failures.send(id);
                    return;
                }
            }
            let _ = write.shutdown().await;
        }
        .instrument(info_span!("xmpp.connection.writer", conn = %id)),
    );

    tx
}

struct Slot {
    conn: Connection,
    peer: SocketAddr,
    writer: mpsc::Sender<Bytes>,
}

/// Everything the event loop owns besides its wake sources.
struct ConnectionTable {
    config: ConnectorConfig,
    bus: Arc<dyn Delivery>,
    conns: HashMap<ConnId, Slot>,
    reads: StreamMap<ConnId, ReadStream>,
    failures_tx: mpsc::UnboundedSender<ConnId>,
    next_id: u64,
}

impl ConnectionTable {
    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = ConnId(self.next_id);
        self.next_id += 1;

        let conn = match Connection::new(id, &self.config.host, self.config.max_stanza_bytes) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, %peer, "Cannot derive connection identity");
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (read, write) = stream.into_split();
        let writer = spawn_writer(id, write, self.config.write_queue, self.failures_tx.clone());

        info!(conn = %id, %peer, address = %conn.address(), "New client connection");
        self.reads.insert(id, read_stream(read));
        self.conns.insert(id, Slot { conn, peer, writer });
    }

    fn read(&mut self, id: ConnId, event: ReadEvent) {
        match event {
            ReadEvent::Data(bytes) => {
                let Some(slot) = self.conns.get_mut(&id) else {
                    return;
                };
                trace!(conn = %id, len = bytes.len(), "Read from client");
                let frames = slot.conn.ingest(&bytes, self.bus.as_ref());
                let closing = slot.conn.state() == ConnectionState::Closing;

                for frame in frames {
                    if !self.write(id, frame) {
                        return;
                    }
                }
                if closing {
                    self.teardown(id, true);
                }
            }
            ReadEvent::Failed(e) => {
                debug!(conn = %id, error = %e, "Error reading from client");
                self.teardown(id, false);
            }
            ReadEvent::Eof => {
                debug!(conn = %id, "Client hung up");
                self.teardown(id, false);
            }
        }
    }

    /// Queue a frame for the socket; a full or closed queue tears the
    /// connection down. Returns whether the connection is still alive.
    fn write(&mut self, id: ConnId, frame: String) -> bool {
        let Some(slot) = self.conns.get(&id) else {
            return false;
        };
        trace!(conn = %id, frame = %frame, "Write to client");
        match slot.writer.try_send(Bytes::from(frame)) {
            Ok(()) => true,
            Err(e) => {
                debug!(conn = %id, error = %e, "Client write queue unavailable");
                self.teardown(id, false);
                false
            }
        }
    }

    /// Resolve a queued write to its connection and dispatch it.
    fn route(&mut self, write: PendingWrite) {
        let PendingWrite { to, packet } = write;

        let Some(node) = to.node() else {
            debug!(to = %to, "Write for an address without a connection number");
            return;
        };
        let id = match node.as_str().parse::<ConnId>() {
            Ok(id) if id.0 != 0 => id,
            _ => {
                debug!(to = %to, "Write for a non-numeric connection address");
                return;
            }
        };

        let Some(slot) = self.conns.get_mut(&id).filter(|slot| slot.conn.address() == &to) else {
            self.bounce(to, packet);
            return;
        };

        match dispatch(&mut slot.conn, packet) {
            Ok(Dispatch::Write(frame)) => {
                self.write(id, frame);
            }
            Ok(Dispatch::Disconnect(frame)) => {
                if self.write(id, frame) {
                    self.teardown(id, true);
                }
            }
            Err(e) => warn!(conn = %id, error = %e, "Failed to serialize stanza"),
        }
    }

    /// Return an undeliverable packet to its sender as a 510 error.
    fn bounce(&self, to: FullJid, packet: Packet) {
        if stanza::is_disconnect_signal(&packet.element) {
            trace!(to = %to, "Dropping disconnect signal for a gone connection");
            return;
        }

        debug!(to = %to, "Connection not found, bouncing");
        let element = stanza::bounce(&packet.element, LegacyError::DISCONNECTED);
        let source = Jid::from(to);
        let routing = packet.routing.map(|r| Routing {
            source,
            destination: r.source,
        });

        self.bus.deliver(Packet { element, routing });
    }

    /// Remove a connection. `orderly` means the socket is still usable and
    /// gets the closing stream tag.
    fn teardown(&mut self, id: ConnId, orderly: bool) {
        let Some(mut slot) = self.conns.remove(&id) else {
            return;
        };
        self.reads.remove(&id);

        if orderly && slot.conn.state() == ConnectionState::Closing {
            let _ = slot.writer.try_send(Bytes::from_static(STREAM_CLOSE.as_bytes()));
        }

        slot.conn.close(self.bus.as_ref());
        info!(conn = %id, peer = %slot.peer, "Client connection closed");
        // Dropping the writer lets the writer task flush and shut the socket
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use minidom::Element;

    use super::*;
    use crate::parser::ns;

    #[derive(Default)]
    struct RecordingBus {
        packets: Mutex<Vec<Packet>>,
    }

    impl RecordingBus {
        fn take(&self) -> Vec<Packet> {
            std::mem::take(&mut *self.packets.lock().unwrap())
        }
    }

    impl Delivery for RecordingBus {
        fn deliver(&self, packet: Packet) {
            self.packets.lock().unwrap().push(packet);
        }
    }

    fn table() -> (ConnectionTable, Arc<RecordingBus>) {
        let bus = Arc::new(RecordingBus::default());
        let (failures_tx, _failures_rx) = mpsc::unbounded_channel();
        let table = ConnectionTable {
            config: ConnectorConfig::default(),
            bus: bus.clone(),
            conns: HashMap::new(),
            reads: StreamMap::new(),
            failures_tx,
            next_id: 1,
        };
        (table, bus)
    }

    /// Put a connection in the table with a writer queue of `depth`.
    fn insert(table: &mut ConnectionTable, id: u64, depth: usize) -> (FullJid, mpsc::Receiver<Bytes>) {
        let conn = Connection::new(ConnId(id), "c2s.localhost", 4096).unwrap();
        let address = conn.address().clone();
        let (writer, rx) = mpsc::channel(depth);
        table.conns.insert(
            ConnId(id),
            Slot {
                conn,
                peer: "127.0.0.1:40000".parse().unwrap(),
                writer,
            },
        );
        (address, rx)
    }

    fn session() -> Jid {
        "alice@localhost/home".parse().unwrap()
    }

    fn chat(to: &FullJid) -> PendingWrite {
        let element = Element::builder("message", ns::JABBER_CLIENT)
            .attr("type", "chat")
            .attr("to", to.to_string())
            .attr("from", "alice@localhost/home")
            .append(Element::builder("body", ns::JABBER_CLIENT).append("hi"))
            .build();
        PendingWrite {
            to: to.clone(),
            packet: Packet::routed(
                element,
                Routing {
                    source: session(),
                    destination: Jid::from(to.clone()),
                },
            ),
        }
    }

    fn frame(rx: &mut mpsc::Receiver<Bytes>) -> Option<String> {
        rx.try_recv().ok().map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    #[test]
    fn test_write_reaches_live_connection() {
        let (mut table, bus) = table();
        let (address, mut rx) = insert(&mut table, 1, 8);

        table.route(chat(&address));

        let written = frame(&mut rx).unwrap();
        assert!(written.contains("hi"));
        assert!(table.conns.contains_key(&ConnId(1)));
        assert!(bus.take().is_empty());
    }

    #[test]
    fn test_write_to_missing_connection_bounces() {
        let (mut table, bus) = table();
        let gone: FullJid = "7@c2s.localhost/abcdefgh".parse().unwrap();

        table.route(chat(&gone));

        let packets = bus.take();
        assert_eq!(packets.len(), 1);
        let bounced = &packets[0];
        assert_eq!(stanza::error_code(&bounced.element), Some(510));
        assert_eq!(bounced.element.attr("from"), Some("7@c2s.localhost/abcdefgh"));
        assert_eq!(bounced.element.attr("to"), Some("alice@localhost/home"));

        let routing = bounced.routing.as_ref().unwrap();
        assert_eq!(routing.source, Jid::from(gone));
        assert_eq!(routing.destination, session());
    }

    #[test]
    fn test_write_to_stale_resource_bounces() {
        let (mut table, bus) = table();
        let (_address, mut rx) = insert(&mut table, 1, 8);
        let stale: FullJid = "1@c2s.localhost/00000000".parse().unwrap();

        table.route(chat(&stale));

        assert!(frame(&mut rx).is_none());
        assert!(table.conns.contains_key(&ConnId(1)));
        let packets = bus.take();
        assert_eq!(packets.len(), 1);
        assert_eq!(stanza::error_code(&packets[0].element), Some(510));
    }

    #[test]
    fn test_disconnect_signal_is_never_bounced() {
        let (mut table, bus) = table();
        let gone: FullJid = "7@c2s.localhost/abcdefgh".parse().unwrap();

        table.route(PendingWrite {
            to: gone,
            packet: Packet::new(stanza::disconnect_notification()),
        });

        assert!(bus.take().is_empty());
    }

    #[test]
    fn test_non_numeric_and_zero_addresses_are_dropped() {
        let (mut table, bus) = table();
        let (_address, mut rx) = insert(&mut table, 1, 8);

        for to in ["abc@c2s.localhost/abcdefgh", "0@c2s.localhost/abcdefgh"] {
            table.route(chat(&to.parse().unwrap()));
        }

        assert!(bus.take().is_empty());
        assert!(frame(&mut rx).is_none());
    }

    #[test]
    fn test_forced_disconnect_closes_without_notification() {
        let (mut table, bus) = table();
        let (address, mut rx) = insert(&mut table, 1, 8);
        table.conns.get_mut(&ConnId(1)).unwrap().conn.authenticate(session());

        table.route(PendingWrite {
            to: address,
            packet: Packet::new(stanza::disconnect_notification()),
        });

        assert!(frame(&mut rx).unwrap().contains("undefined-condition"));
        assert_eq!(frame(&mut rx).as_deref(), Some(STREAM_CLOSE));
        assert!(table.conns.is_empty());
        assert!(bus.take().is_empty());
    }

    #[test]
    fn test_full_write_queue_tears_down() {
        let (mut table, bus) = table();
        let (address, _rx) = insert(&mut table, 1, 1);
        let slot = table.conns.get_mut(&ConnId(1)).unwrap();
        slot.conn.authenticate(session());
        slot.writer.try_send(Bytes::from_static(b"<presence/>")).unwrap();

        table.route(chat(&address));

        assert!(table.conns.is_empty());
        let packets = bus.take();
        assert_eq!(packets.len(), 1);
        assert!(stanza::is_disconnect_signal(&packets[0].element));
        assert_eq!(packets[0].routing.as_ref().unwrap().destination, session());
    }

    #[test]
    fn test_closed_write_queue_tears_down() {
        let (mut table, bus) = table();
        let (address, rx) = insert(&mut table, 1, 8);
        drop(rx);

        table.route(chat(&address));

        assert!(table.conns.is_empty());
        // Never authenticated, so upstream is not told
        assert!(bus.take().is_empty());
    }

    #[test]
    fn test_handle_addresses_by_routing_then_to() {
        let (handle, mut rx) = ConnectorHandle::channel("c2s.localhost");
        let conn: FullJid = "3@c2s.localhost/abcdefgh".parse().unwrap();

        handle.deliver(chat(&conn).packet);
        assert_eq!(rx.try_recv().unwrap().to, conn);

        let addressed = Element::builder("message", ns::JABBER_CLIENT)
            .attr("to", conn.to_string())
            .build();
        handle.deliver(Packet::new(addressed));
        assert_eq!(rx.try_recv().unwrap().to, conn);

        let bare = Element::builder("message", ns::JABBER_CLIENT)
            .attr("to", "alice@localhost")
            .build();
        handle.deliver(Packet::new(bare));
        assert!(rx.try_recv().is_err());

        assert!(handle.owns(&Jid::from(conn)));
        assert!(!handle.owns(&session()));
    }
}
