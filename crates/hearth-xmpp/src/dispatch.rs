//! Outbound write dispatch.
//!
//! Decides what a queued packet means for its connection before anything
//! reaches the wire.

use jid::Jid;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{generate_stream_error, stream_errors};
use crate::parser::element_to_string;
use crate::stanza::{self, Packet};
use crate::types::ConnectionState;
use crate::XmppError;

/// What to do with the socket for one dispatched packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Write the frame and carry on.
    Write(String),
    /// Write the frame, then tear the connection down.
    Disconnect(String),
}

/// Turn a packet for `conn` into a frame.
///
/// Upstream asks for a forced disconnect with a 510 error message; that
/// closes the connection without writing the message itself. The awaited
/// auth result authenticates the connection. Routing never reaches the wire
/// since only the element is serialized.
pub fn dispatch(conn: &mut Connection, packet: Packet) -> Result<Dispatch, XmppError> {
    let Packet { element, routing } = packet;

    if stanza::is_disconnect_signal(&element) {
        debug!(conn = %conn.id(), "Session manager forced disconnect");
        conn.force_closing();
        return Ok(Dispatch::Disconnect(generate_stream_error(
            stream_errors::UNDEFINED_CONDITION,
            Some("Disconnected"),
        )));
    }

    if conn.state() == ConnectionState::Unknown && element.name() == "iq" {
        match element.attr("type") {
            Some("result") if element.attr("id").is_some() && element.attr("id") == conn.auth_id() => {
                let route = routing
                    .map(|r| r.source)
                    .or_else(|| element.attr("from").and_then(|f| f.parse::<Jid>().ok()));
                match route {
                    Some(route) => conn.authenticate(route),
                    None => debug!(conn = %conn.id(), "Auth result without a session address"),
                }
            }
            Some("result") => debug!(conn = %conn.id(), "Pre-auth query answered"),
            _ => debug!(conn = %conn.id(), "Pre-auth query failed"),
        }
    }

    Ok(Dispatch::Write(element_to_string(&element)?))
}

#[cfg(test)]
mod tests {
    use minidom::Element;

    use super::*;
    use crate::delivery::Delivery;
    use crate::parser::ns;
    use crate::stanza::Routing;
    use crate::types::ConnId;

    struct NullBus;

    impl Delivery for NullBus {
        fn deliver(&self, _packet: Packet) {}
    }

    fn pending_auth() -> Connection {
        let mut conn = Connection::new(ConnId(1), "c2s.localhost", 4096).unwrap();
        conn.ingest(
            b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='localhost'><iq type='set' id='a1'><query xmlns='jabber:iq:auth'/></iq>",
            &NullBus,
        );
        conn
    }

    fn result(id: &str) -> Element {
        Element::builder("iq", ns::JABBER_CLIENT)
            .attr("type", "result")
            .attr("id", id)
            .build()
    }

    #[test]
    fn test_auth_result_authenticates() {
        let mut conn = pending_auth();
        let session: Jid = "alice@localhost/home".parse().unwrap();
        let packet = Packet::routed(
            result("a1"),
            Routing {
                source: session.clone(),
                destination: Jid::from(conn.address().clone()),
            },
        );

        let out = dispatch(&mut conn, packet).unwrap();

        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert_eq!(conn.route(), Some(&session));
        match out {
            Dispatch::Write(frame) => {
                assert!(frame.contains("type=\"result\"") || frame.contains("type='result'"));
                assert!(!frame.contains("alice@localhost/home"));
            }
            other => panic!("unexpected dispatch: {:?}", other),
        }
    }

    #[test]
    fn test_other_result_does_not_authenticate() {
        let mut conn = pending_auth();
        dispatch(&mut conn, Packet::new(result("r9"))).unwrap();
        assert_eq!(conn.state(), ConnectionState::Unknown);
    }

    #[test]
    fn test_auth_get_result_does_not_authenticate() {
        let mut conn = Connection::new(ConnId(1), "c2s.localhost", 4096).unwrap();
        conn.ingest(
            b"<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='localhost'><iq type='get' id='g1'><query xmlns='jabber:iq:auth'/></iq>",
            &NullBus,
        );

        dispatch(&mut conn, Packet::new(result("g1"))).unwrap();

        assert_eq!(conn.state(), ConnectionState::Unknown);
        assert_eq!(conn.route().map(|r| r.to_string()), Some("localhost".to_string()));
    }

    #[test]
    fn test_auth_error_does_not_authenticate() {
        let mut conn = pending_auth();
        let mut failed = result("a1");
        failed.set_attr("type", "error");
        dispatch(&mut conn, Packet::new(failed)).unwrap();
        assert_eq!(conn.state(), ConnectionState::Unknown);
    }

    #[test]
    fn test_disconnect_signal_forces_close() {
        let mut conn = pending_auth();
        let msg = stanza::disconnect_notification();

        let out = dispatch(&mut conn, Packet::new(msg)).unwrap();

        assert_eq!(conn.state(), ConnectionState::Closing);
        match out {
            Dispatch::Disconnect(frame) => {
                assert!(frame.starts_with("<stream:error>"));
                assert!(frame.contains("Disconnected"));
            }
            other => panic!("unexpected dispatch: {:?}", other),
        }
    }
}
