//! Test utilities for end-to-end connector tests.
//!
//! Starts a connector and a session manager on an ephemeral port and drives
//! them with raw TCP clients.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hearth_xmpp::roster::{InMemoryRoster, RosterTrust, Subscription};
use hearth_xmpp::sm::StaticAccounts;
use hearth_xmpp::{ChannelDelivery, Connector, ConnectorConfig, SessionManager, SessionManagerConfig};
use jid::BareJid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

fn bare(s: &str) -> BareJid {
    s.parse().expect("valid bare JID")
}

/// A running connector plus session manager for `localhost`.
///
/// Accounts: alice/secret, bob/hunter2, carol/pass. Alice and bob are
/// mutually subscribed; carol has no contacts.
pub struct TestServer {
    pub addr: SocketAddr,
    pub accounts: Arc<StaticAccounts>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        init_tracing();

        let accounts = Arc::new(StaticAccounts::new());
        accounts.insert(bare("alice@localhost"), "secret");
        accounts.insert(bare("bob@localhost"), "hunter2");
        accounts.insert(bare("carol@localhost"), "pass");

        let roster = Arc::new(InMemoryRoster::new());
        roster.add(bare("alice@localhost"), bare("bob@localhost"), Subscription::Both);
        roster.add(bare("bob@localhost"), bare("alice@localhost"), Subscription::Both);
        let trust = Arc::new(RosterTrust::new(roster.clone()));

        let (bus, bus_rx) = ChannelDelivery::new();
        let bus = Arc::new(bus);

        let config = ConnectorConfig {
            listen: "127.0.0.1:0".parse().expect("valid listen address"),
            ..ConnectorConfig::default()
        };
        let connector = Connector::new(config, bus.clone());
        let sm = SessionManager::new(
            SessionManagerConfig::default(),
            bus,
            connector.handle(),
            accounts.clone(),
            roster,
            trust,
        )
        .expect("Failed to create session manager");

        let bound = connector.bind().await.expect("Failed to bind test connector");
        let addr = bound.local_addr().expect("Failed to get local addr");

        let tasks = vec![tokio::spawn(bound.serve()), tokio::spawn(sm.run(bus_rx))];

        Self { addr, accounts, tasks }
    }

    pub async fn connect(&self) -> RawClient {
        RawClient::connect(self.addr)
            .await
            .expect("Failed to connect to test server")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Stream header a client sends to open a session with `to`.
pub fn stream_open(to: &str) -> String {
    format!(
        "<?xml version='1.0'?>\
        <stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' to='{}'>",
        to
    )
}

/// Plaintext `jabber:iq:auth` login request.
pub fn auth_set(id: &str, username: &str, password: &str, resource: &str) -> String {
    format!(
        "<iq type='set' id='{}'><query xmlns='jabber:iq:auth'>\
        <username>{}</username><password>{}</password><resource>{}</resource>\
        </query></iq>",
        id, username, password, resource
    )
}

/// Digest `jabber:iq:auth` login request.
pub fn auth_digest_set(id: &str, username: &str, digest: &str, resource: &str) -> String {
    format!(
        "<iq type='set' id='{}'><query xmlns='jabber:iq:auth'>\
        <username>{}</username><digest>{}</digest><resource>{}</resource>\
        </query></iq>",
        id, username, digest, resource
    )
}

/// Stream id from the server's stream header in `response`.
pub fn stream_id(response: &str) -> Option<String> {
    let start = response.find(" id='")? + " id='".len();
    let len = response[start..].find('\'')?;
    Some(response[start..start + len].to_string())
}

/// Raw client connection for protocol-level testing.
pub struct RawClient {
    tcp: TcpStream,
    buffer: String,
    closed: bool,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let tcp = TcpStream::connect(addr).await?;
        Ok(Self {
            tcp,
            buffer: String::new(),
            closed: false,
        })
    }

    /// Send raw data.
    pub async fn send(&mut self, data: &str) -> std::io::Result<()> {
        self.tcp.write_all(data.as_bytes()).await?;
        self.tcp.flush().await
    }

    /// Read once with timeout. Returns 0 at end of stream.
    pub async fn read(&mut self, timeout_dur: Duration) -> std::io::Result<usize> {
        let mut buf = [0u8; 4096];
        let n = timeout(timeout_dur, self.tcp.read(&mut buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "Timeout"))??;

        if n == 0 {
            self.closed = true;
        }
        self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        Ok(n)
    }

    /// Read until `pattern` is in the buffer.
    pub async fn read_until(&mut self, pattern: &str, timeout_dur: Duration) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        while !self.buffer.contains(pattern) {
            if self.closed {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("Connection closed while waiting for: {}", pattern),
                ));
            }
            if start.elapsed() > timeout_dur {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Timeout waiting for: {}", pattern),
                ));
            }
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            self.read(remaining).await?;
        }
        Ok(self.buffer.clone())
    }

    /// Read until the server closes the socket.
    pub async fn read_to_close(&mut self, timeout_dur: Duration) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        while !self.closed {
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "Timeout waiting for close"));
            }
            self.read(remaining).await?;
        }
        Ok(self.buffer.clone())
    }

    /// Whether nothing arrives within `quiet`.
    pub async fn stays_quiet(&mut self, quiet: Duration) -> bool {
        matches!(self.read(quiet).await, Err(e) if e.kind() == std::io::ErrorKind::TimedOut)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn take_buffer(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    /// Open a stream to `localhost` and log in.
    pub async fn login(&mut self, username: &str, password: &str, resource: &str) -> std::io::Result<()> {
        self.send(&stream_open("localhost")).await?;
        self.read_until("<stream:stream", DEFAULT_TIMEOUT).await?;
        self.send(&auth_set("auth1", username, password, resource)).await?;
        self.read_until("auth1", DEFAULT_TIMEOUT).await?;
        self.clear();
        Ok(())
    }
}
