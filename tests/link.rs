//! End-to-end link bring-up between two supervisors wired directly
//! to each other.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use ppplinkd::eap::{TlsSession, TlsTurn, METHOD_TLS};
use ppplinkd::lcp::AuthProto;
use ppplinkd::mppe::KeyStrength;
use ppplinkd::{Client, ClientConfig, DownReason, LinkEvent};

fn spawn_pair(
    a: ClientConfig,
    b: ClientConfig,
) -> (
    mpsc::UnboundedReceiver<LinkEvent>,
    mpsc::UnboundedReceiver<LinkEvent>,
) {
    let (to_a_tx, to_a_rx) = mpsc::unbounded_channel();
    let (to_b_tx, to_b_rx) = mpsc::unbounded_channel();

    let (a_events_tx, a_events_rx) = mpsc::unbounded_channel();
    let (b_events_tx, b_events_rx) = mpsc::unbounded_channel();

    let client_a = Client::new(a, to_b_tx, a_events_tx);
    let client_b = Client::new(b, to_a_tx, b_events_tx);

    tokio::spawn(client_a.run(to_a_rx));
    tokio::spawn(client_b.run(to_b_rx));

    (a_events_rx, b_events_rx)
}

/// Waits for the first event matching `pred`, failing the test if the
/// link produces a `Down` first or nothing arrives in time.
async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<LinkEvent>, pred: F) -> LinkEvent
where
    F: Fn(&LinkEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
            if let LinkEvent::Down(reason) = event {
                panic!("link went down early: {:?}", reason);
            }
        }
    })
    .await
    .expect("timed out waiting for link event")
}

async fn wait_for_down(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> DownReason {
    timeout(Duration::from_secs(10), async {
        loop {
            if let LinkEvent::Down(reason) = events.recv().await.expect("event channel closed") {
                return reason;
            }
        }
    })
    .await
    .expect("timed out waiting for link down")
}

fn secrets() -> Box<dyn ppplinkd::secret::SecretStore + Send> {
    let mut secrets = HashMap::new();
    secrets.insert("alice".to_string(), b"hunter2".to_vec());
    Box::new(secrets)
}

#[tokio::test]
async fn link_comes_up_without_authentication() {
    let a = ClientConfig {
        username: "alice".into(),
        password: "hunter2".into(),
        ..ClientConfig::default()
    };
    let b = ClientConfig {
        username: "gateway".into(),
        password: "gw".into(),
        peer_ipv4: Some(Ipv4Addr::new(10, 0, 0, 1)),
        ..ClientConfig::default()
    };

    let (mut a_events, mut b_events) = spawn_pair(a, b);

    let up = wait_for(&mut a_events, |event| matches!(event, LinkEvent::Up(_))).await;
    let LinkEvent::Up(info) = up else {
        unreachable!()
    };
    let ipv4 = info.ipv4.expect("ipv4 came up");
    assert_eq!(ipv4.addr, Ipv4Addr::new(10, 0, 0, 1));

    wait_for(&mut b_events, |event| matches!(event, LinkEvent::Up(_))).await;
}

#[tokio::test]
async fn chap_authentication_gates_network_protocols() {
    let a = ClientConfig {
        username: "alice".into(),
        password: "hunter2".into(),
        ..ClientConfig::default()
    };
    let b = ClientConfig {
        username: "gateway".into(),
        password: "gw".into(),
        peer_auth: Some(AuthProto::ChapMd5),
        secrets: Some(secrets()),
        ..ClientConfig::default()
    };

    let (mut a_events, mut b_events) = spawn_pair(a, b);

    // The authenticator reports authentication strictly before the link.
    let first = wait_for(&mut b_events, |event| {
        matches!(event, LinkEvent::Authenticated | LinkEvent::Up(_))
    })
    .await;
    assert_eq!(first, LinkEvent::Authenticated);

    wait_for(&mut b_events, |event| matches!(event, LinkEvent::Up(_))).await;
    wait_for(&mut a_events, |event| matches!(event, LinkEvent::Up(_))).await;
}

#[tokio::test]
async fn wrong_chap_secret_tears_the_link_down() {
    let a = ClientConfig {
        username: "alice".into(),
        password: "wrong".into(),
        ..ClientConfig::default()
    };
    let b = ClientConfig {
        username: "gateway".into(),
        password: "gw".into(),
        peer_auth: Some(AuthProto::ChapMd5),
        secrets: Some(secrets()),
        ..ClientConfig::default()
    };

    let (mut a_events, mut b_events) = spawn_pair(a, b);

    assert_eq!(
        wait_for_down(&mut b_events).await,
        DownReason::AuthenticationFailed
    );

    // Depending on whose teardown lands first the peer sees either its
    // own failure or the authenticator's termination.
    let reason = wait_for_down(&mut a_events).await;
    assert!(
        reason == DownReason::AuthenticationFailed || reason == DownReason::PeerTerminated,
        "unexpected down reason {:?}",
        reason
    );
}

#[tokio::test]
async fn pap_authentication_succeeds() {
    let a = ClientConfig {
        username: "alice".into(),
        password: "hunter2".into(),
        ..ClientConfig::default()
    };
    let b = ClientConfig {
        username: "gateway".into(),
        password: "gw".into(),
        peer_auth: Some(AuthProto::Pap),
        secrets: Some(secrets()),
        ..ClientConfig::default()
    };

    let (mut a_events, mut b_events) = spawn_pair(a, b);

    wait_for(&mut b_events, |event| {
        matches!(event, LinkEvent::Authenticated)
    })
    .await;
    wait_for(&mut a_events, |event| matches!(event, LinkEvent::Up(_))).await;
}

#[tokio::test]
async fn eap_md5_authentication_succeeds() {
    let a = ClientConfig {
        username: "alice".into(),
        password: "hunter2".into(),
        ..ClientConfig::default()
    };
    let b = ClientConfig {
        username: "gateway".into(),
        password: "gw".into(),
        peer_auth: Some(AuthProto::Eap),
        secrets: Some(secrets()),
        ..ClientConfig::default()
    };

    let (mut a_events, mut b_events) = spawn_pair(a, b);

    wait_for(&mut b_events, |event| {
        matches!(event, LinkEvent::Authenticated)
    })
    .await;
    wait_for(&mut a_events, |event| matches!(event, LinkEvent::Up(_))).await;
}

/// Scripted handshake engines standing in for a real TLS stack. The
/// authenticator's second flight is large enough to be fragmented.
struct ScriptedTlsPeer {
    step: usize,
}

impl TlsSession for ScriptedTlsPeer {
    fn advance(&mut self, inbound: &[u8]) -> TlsTurn {
        self.step += 1;
        match self.step {
            1 => {
                assert!(inbound.is_empty());
                TlsTurn::Respond(b"client hello".to_vec())
            }
            2 => {
                assert_eq!(inbound, vec![0xab; 2500]);
                TlsTurn::Respond(b"key exchange and finished".to_vec())
            }
            3 => {
                assert_eq!(inbound, b"server finished");
                TlsTurn::Finished
            }
            _ => TlsTurn::Failed,
        }
    }
}

struct ScriptedTlsAuthenticator {
    step: usize,
}

impl TlsSession for ScriptedTlsAuthenticator {
    fn advance(&mut self, inbound: &[u8]) -> TlsTurn {
        self.step += 1;
        match self.step {
            1 => {
                assert_eq!(inbound, b"client hello");
                TlsTurn::Respond(vec![0xab; 2500])
            }
            2 => {
                assert_eq!(inbound, b"key exchange and finished");
                TlsTurn::Respond(b"server finished".to_vec())
            }
            3 => {
                assert!(inbound.is_empty());
                TlsTurn::Finished
            }
            _ => TlsTurn::Failed,
        }
    }
}

#[tokio::test]
async fn eap_tls_authentication_reassembles_fragments() {
    let a = ClientConfig {
        username: "alice".into(),
        password: "hunter2".into(),
        tls_client: Some(Box::new(ScriptedTlsPeer { step: 0 })),
        ..ClientConfig::default()
    };
    let b = ClientConfig {
        username: "gateway".into(),
        password: "gw".into(),
        peer_auth: Some(AuthProto::Eap),
        eap_methods: vec![METHOD_TLS],
        tls_server: Some(Box::new(ScriptedTlsAuthenticator { step: 0 })),
        ..ClientConfig::default()
    };

    let (mut a_events, mut b_events) = spawn_pair(a, b);

    // The scripted engines assert the reassembled flights along the
    // way; a mismatch fails the handshake and brings the link down.
    wait_for(&mut b_events, |event| {
        matches!(event, LinkEvent::Authenticated)
    })
    .await;
    wait_for(&mut b_events, |event| matches!(event, LinkEvent::Up(_))).await;
    wait_for(&mut a_events, |event| matches!(event, LinkEvent::Up(_))).await;
}

#[tokio::test]
async fn encryption_keys_armed_after_authentication() {
    let a = ClientConfig {
        username: "alice".into(),
        password: "hunter2".into(),
        encryption: true,
        strength: KeyStrength::Bits128,
        ..ClientConfig::default()
    };
    let b = ClientConfig {
        username: "gateway".into(),
        password: "gw".into(),
        peer_auth: Some(AuthProto::ChapMd5),
        secrets: Some(secrets()),
        encryption: true,
        strength: KeyStrength::Bits128,
        ..ClientConfig::default()
    };

    let (mut a_events, mut b_events) = spawn_pair(a, b);

    let encrypted = wait_for(&mut a_events, |event| {
        matches!(event, LinkEvent::Encrypted(_))
    })
    .await;
    assert_eq!(encrypted, LinkEvent::Encrypted(KeyStrength::Bits128));

    wait_for(&mut b_events, |event| {
        matches!(event, LinkEvent::Encrypted(KeyStrength::Bits128))
    })
    .await;
}
