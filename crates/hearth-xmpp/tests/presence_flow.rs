//! End-to-end presence tests: login broadcast, probes, departures and
//! bounces, seen from real client sockets.

mod common;

use std::time::Duration;

use common::{TestServer, DEFAULT_TIMEOUT};

#[tokio::test]
async fn test_contacts_see_each_other() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;

    alice.login("alice", "secret", "home").await.unwrap();
    alice.send("<presence><priority>5</priority></presence>").await.unwrap();

    bob.login("bob", "hunter2", "work").await.unwrap();
    bob.send("<presence/>").await.unwrap();

    // Bob's login probe is answered with alice's cached presence
    let seen_by_bob = bob.read_until("alice@localhost/home", DEFAULT_TIMEOUT).await.unwrap();
    assert!(seen_by_bob.contains(">5</priority>"));
    assert!(seen_by_bob.contains("jabber:x:delay"));

    // And alice hears about bob directly
    alice.read_until("bob@localhost/work", DEFAULT_TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_departure_is_broadcast() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;

    alice.login("alice", "secret", "home").await.unwrap();
    alice.send("<presence/>").await.unwrap();
    bob.login("bob", "hunter2", "work").await.unwrap();
    bob.send("<presence/>").await.unwrap();
    alice.read_until("bob@localhost/work", DEFAULT_TIMEOUT).await.unwrap();
    alice.clear();

    // Hang up without closing the stream
    drop(bob);

    let seen = alice.read_until("unavailable", DEFAULT_TIMEOUT).await.unwrap();
    assert!(seen.contains("bob@localhost/work"));
}

#[tokio::test]
async fn test_going_unavailable_is_broadcast() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;

    alice.login("alice", "secret", "home").await.unwrap();
    alice.send("<presence/>").await.unwrap();
    bob.login("bob", "hunter2", "work").await.unwrap();
    bob.send("<presence/>").await.unwrap();
    alice.read_until("bob@localhost/work", DEFAULT_TIMEOUT).await.unwrap();
    alice.clear();

    bob.send("<presence type='unavailable'><status>brb</status></presence>")
        .await
        .unwrap();

    let seen = alice.read_until("brb", DEFAULT_TIMEOUT).await.unwrap();
    assert!(seen.contains("unavailable"));
}

#[tokio::test]
async fn test_presence_to_unknown_user_bounces() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;

    alice.login("alice", "secret", "home").await.unwrap();
    alice.send("<presence/>").await.unwrap();
    alice.send("<presence to='nobody@localhost'/>").await.unwrap();

    let bounced = alice.read_until("404", DEFAULT_TIMEOUT).await.unwrap();
    assert!(bounced.contains("nobody@localhost"));
    assert!(bounced.contains("error"));
}

#[tokio::test]
async fn test_strangers_do_not_see_presence() {
    let server = TestServer::start().await;
    let mut alice = server.connect().await;
    let mut carol = server.connect().await;

    alice.login("alice", "secret", "home").await.unwrap();
    alice.send("<presence/>").await.unwrap();

    carol.login("carol", "pass", "desk").await.unwrap();
    carol.send("<presence/>").await.unwrap();
    carol
        .send("<presence type='probe' to='alice@localhost'/>")
        .await
        .unwrap();

    assert!(carol.stays_quiet(Duration::from_millis(300)).await);
    assert!(!carol.take_buffer().contains("alice@localhost/home"));
}

#[tokio::test]
async fn test_other_resources_see_each_other() {
    let server = TestServer::start().await;
    let mut home = server.connect().await;
    let mut phone = server.connect().await;

    home.login("alice", "secret", "home").await.unwrap();
    home.send("<presence/>").await.unwrap();

    phone.login("alice", "secret", "phone").await.unwrap();
    phone.send("<presence/>").await.unwrap();

    phone.read_until("alice@localhost/home", DEFAULT_TIMEOUT).await.unwrap();
    home.read_until("alice@localhost/phone", DEFAULT_TIMEOUT).await.unwrap();
}
