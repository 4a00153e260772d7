//! A single supervisor driven by a scripted peer holding the other end
//! of the transport.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use ppplinkd::lcp::LcpOpt;
use ppplinkd::wire::{self, CpFrame};
use ppplinkd::{Client, ClientConfig, DownReason, LinkEvent, Packet, PacketType};

struct Peer {
    tx: mpsc::UnboundedSender<(u16, Vec<u8>)>,
    rx: mpsc::UnboundedReceiver<(u16, Vec<u8>)>,
}

impl Peer {
    async fn recv_frame(&mut self) -> (u16, Vec<u8>) {
        timeout(Duration::from_secs(120), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("supervisor exited")
    }

    /// Receives the next LCP packet, discarding other protocols.
    async fn recv_lcp(&mut self) -> Packet<LcpOpt> {
        loop {
            let (protocol, data) = self.recv_frame().await;
            if protocol == wire::LCP {
                let frame = CpFrame::deserialize(&data).expect("malformed lcp frame");
                return Packet::from_frame(frame).expect("malformed lcp packet");
            }
        }
    }

    fn send_lcp(&self, packet: Packet<LcpOpt>) {
        let mut buf = Vec::new();
        packet.to_frame(0).serialize(&mut buf);
        self.tx.send((wire::LCP, buf)).expect("supervisor exited");
    }

    fn send_lcp_frame(&self, frame: CpFrame) {
        let mut buf = Vec::new();
        frame.serialize(&mut buf);
        self.tx.send((wire::LCP, buf)).expect("supervisor exited");
    }
}

fn spawn_supervisor(config: ClientConfig) -> (Peer, mpsc::UnboundedReceiver<LinkEvent>) {
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let client = Client::new(config, to_peer_tx, events_tx);
    tokio::spawn(client.run(to_client_rx));

    (
        Peer {
            tx: to_client_tx,
            rx: to_peer_rx,
        },
        events_rx,
    )
}

async fn wait_for_down(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> DownReason {
    timeout(Duration::from_secs(120), async {
        loop {
            if let LinkEvent::Down(reason) = events.recv().await.expect("event channel closed") {
                return reason;
            }
        }
    })
    .await
    .expect("timed out waiting for link down")
}

/// Brings LCP up by acknowledging the supervisor's Configure-Request
/// and negotiating an empty one of our own. Returns the magic number
/// the supervisor requested.
async fn open_link(peer: &mut Peer) -> u32 {
    let magic = loop {
        let packet = peer.recv_lcp().await;
        if packet.ty != PacketType::ConfigureRequest {
            continue;
        }

        let magic = packet
            .options
            .iter()
            .find_map(|opt| match opt {
                LcpOpt::MagicNumber(magic) => Some(*magic),
                _ => None,
            })
            .expect("request carries a magic number");
        peer.send_lcp(Packet::with_options(
            PacketType::ConfigureAck,
            packet.id,
            packet.options.clone(),
        ));

        break magic;
    };

    peer.send_lcp(Packet::with_options(
        PacketType::ConfigureRequest,
        1,
        Vec::new(),
    ));
    loop {
        if peer.recv_lcp().await.ty == PacketType::ConfigureAck {
            return magic;
        }
    }
}

#[tokio::test]
async fn transport_loss_reports_link_down() {
    let (peer, mut events) = spawn_supervisor(ClientConfig::default());

    drop(peer);

    assert_eq!(wait_for_down(&mut events).await, DownReason::Closed);
}

#[tokio::test(start_paused = true)]
async fn magic_number_rejection_disables_keepalives() {
    let (mut peer, mut events) = spawn_supervisor(ClientConfig::default());

    let request = peer.recv_lcp().await;
    assert_eq!(request.ty, PacketType::ConfigureRequest);
    let magic = request
        .options
        .iter()
        .find(|opt| matches!(opt, LcpOpt::MagicNumber(_)))
        .cloned()
        .expect("first request carries a magic number");
    peer.send_lcp(Packet::with_options(
        PacketType::ConfigureReject,
        request.id,
        vec![magic],
    ));

    let request = peer.recv_lcp().await;
    assert_eq!(request.ty, PacketType::ConfigureRequest);
    assert!(
        !request
            .options
            .iter()
            .any(|opt| matches!(opt, LcpOpt::MagicNumber(_))),
        "rejected magic number was requested again"
    );
    peer.send_lcp(Packet::with_options(
        PacketType::ConfigureAck,
        request.id,
        request.options.clone(),
    ));
    peer.send_lcp(Packet::with_options(
        PacketType::ConfigureRequest,
        1,
        Vec::new(),
    ));

    // The link opens but no network protocol ever answers. The
    // supervisor must keep running without keepalives until it gives
    // the network phase up.
    loop {
        let packet = peer.recv_lcp().await;
        match packet.ty {
            PacketType::EchoRequest => panic!("keepalive sent without a magic number"),
            PacketType::TerminateRequest => {
                peer.send_lcp(Packet::new(PacketType::TerminateAck, packet.id));
                break;
            }
            _ => {}
        }
    }

    assert_eq!(wait_for_down(&mut events).await, DownReason::NcpTimeout);
}

#[tokio::test(start_paused = true)]
async fn looped_back_magic_renews_then_tears_down() {
    let (mut peer, mut events) = spawn_supervisor(ClientConfig::default());

    let mut magic = open_link(&mut peer).await;

    for renewal in 0..4 {
        // Echo the supervisor's own magic number back at it.
        peer.send_lcp_frame(CpFrame::new(
            wire::ECHO_REQUEST,
            1,
            magic.to_be_bytes().to_vec(),
        ));

        if renewal < 3 {
            let renewed = open_link(&mut peer).await;
            assert_ne!(renewed, magic, "magic number was not renewed");
            magic = renewed;
        }
    }

    // Renewals are exhausted, the line is considered looped back.
    loop {
        let packet = peer.recv_lcp().await;
        if packet.ty == PacketType::TerminateRequest {
            peer.send_lcp(Packet::new(PacketType::TerminateAck, packet.id));
            break;
        }
    }

    assert_eq!(
        wait_for_down(&mut events).await,
        DownReason::LoopbackDetected
    );
}
