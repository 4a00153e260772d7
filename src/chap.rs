//! Challenge-Handshake Authentication Protocol state machines as per
//! RFC 1994, for both the responding peer and the authenticator.
//!
//! Digest computation and timing-safe verification live in [`crate::crypto`]
//! and are performed by the supervisor; these machines track the exchange.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Interval;

/// The CHAP peer state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ChapClientState {
    #[default]
    Initial, // Lower layer down, no Open has occured, no timeout
    Starting,     // Lower layer down, Open initiated, no timeout
    Closed,       // Lower layer up, no Open has occured, no timeout
    Stopped,      // Lower layer up, Open initiated, no timeout
    Waiting,      // No Challenge received, timeout running
    ResponseSent, // Response sent, no reply, timeout running
    ReauthSent,   // Second Challenge received, Response sent, no reply, timeout running
    Failed,       // Response sent, Failure received, no timeout; link is to be terminated
    Opened,       // Response sent, Success received, no timeout; auth is successful
}

/// List of valid packet types for `ChapPacket`s.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChapType {
    Challenge,
    Response,
    Success,
    Failure,
    TerminateLower,
}

/// A packet that can be a Challenge, Response, Success, Failure
/// or a signal to terminate the link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChapPacket {
    pub ty: ChapType,
    pub id: u8,
    pub data: Vec<u8>,
}

/// The Challenge-Handshake Authentication Protocol peer implementation
/// as per RFC 1994.
#[derive(Debug)]
pub struct ChapClient {
    state: ChapClientState,

    timeout: Interval,

    output_tx: mpsc::UnboundedSender<ChapPacket>,
    output_rx: mpsc::UnboundedReceiver<ChapPacket>,

    upper_status_tx: watch::Sender<bool>,
    upper_status_rx: watch::Receiver<bool>,
}

impl ChapClient {
    /// Creates a new `ChapClient`.
    ///
    /// You must start calling the [`ChapClient::to_send`] method
    /// before calling the [`ChapClient::up`] method
    /// and keep calling it until [`ChapClient::close`] and [`ChapClient::down`]
    /// have been issued.
    ///
    /// # Arguments
    ///
    /// * `timeout` - The timeout for receiving Challenges, default is 30 seconds.
    pub fn new(timeout: Option<Duration>) -> Self {
        let timeout = tokio::time::interval(timeout.unwrap_or(Duration::from_secs(30)));
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (upper_status_tx, upper_status_rx) = watch::channel(false);

        Self {
            state: ChapClientState::default(),

            timeout,

            output_tx,
            output_rx,

            upper_status_tx,
            upper_status_rx,
        }
    }

    /// Waits for and returns the next packet to send.
    pub async fn to_send(&mut self) -> ChapPacket {
        loop {
            tokio::select! {
                packet = self.output_rx.recv() => return packet.expect("output channel is closed"),
                _ = self.timeout.tick() => {
                    match self.state {
                        ChapClientState::Waiting
                        | ChapClientState::ResponseSent
                        | ChapClientState::ReauthSent => {
                            self.state = ChapClientState::Failed;
                            return ChapPacket {
                                ty: ChapType::TerminateLower,
                                id: 0,
                                data: Vec::default(),
                            };
                        }
                        _ => {} // stale tick
                    }
                }
            }
        }
    }

    /// Feeds a packet into the state machine for processing.
    /// Can trigger the RC, RS or RF events.
    pub fn from_recv(&mut self, packet: ChapPacket) {
        match packet.ty {
            ChapType::Challenge => self.rc(packet),
            ChapType::Response | ChapType::TerminateLower => {} // illegal
            ChapType::Success => self.rs(),
            ChapType::Failure => self.rf(),
        }
    }

    /// Signals to the state machine that the lower layer is now up.
    /// This is equivalent to the Up event.
    pub fn up(&mut self) {
        match self.state {
            ChapClientState::Initial => self.state = ChapClientState::Closed,
            ChapClientState::Starting => {
                self.timeout.reset();
                self.state = ChapClientState::Waiting;
            }
            ChapClientState::Closed
            | ChapClientState::Stopped
            | ChapClientState::Waiting
            | ChapClientState::ResponseSent
            | ChapClientState::ReauthSent
            | ChapClientState::Failed
            | ChapClientState::Opened => {} // illegal
        }
    }

    /// Signals to the state machine that the lower layer is now down.
    /// This is equivalent to the Down event.
    pub fn down(&mut self) {
        match self.state {
            ChapClientState::Initial | ChapClientState::Starting => {} // illegal
            ChapClientState::Closed => self.state = ChapClientState::Initial,
            ChapClientState::Stopped
            | ChapClientState::Waiting
            | ChapClientState::ResponseSent
            | ChapClientState::ReauthSent
            | ChapClientState::Failed => self.state = ChapClientState::Starting,
            ChapClientState::Opened => {
                self.upper_status_tx
                    .send(false)
                    .expect("upper status channel is closed");

                self.state = ChapClientState::Starting;
            }
        }
    }

    /// Issues an administrative open, allowing the protocol to start authentication.
    /// This is equivalent to the Open event.
    pub fn open(&mut self) {
        match self.state {
            ChapClientState::Initial => self.state = ChapClientState::Starting,
            ChapClientState::Starting
            | ChapClientState::Stopped
            | ChapClientState::Waiting
            | ChapClientState::ResponseSent
            | ChapClientState::ReauthSent
            | ChapClientState::Failed
            | ChapClientState::Opened => {}
            ChapClientState::Closed => {
                self.timeout.reset();
                self.state = ChapClientState::Waiting;
            }
        }
    }

    /// Issues an administrative close, gracefully shutting down the protocol.
    /// This is equivalent to the Close event.
    pub fn close(&mut self) {
        match self.state {
            ChapClientState::Initial | ChapClientState::Closed => {} // illegal
            ChapClientState::Starting => self.state = ChapClientState::Initial,
            ChapClientState::Stopped
            | ChapClientState::Waiting
            | ChapClientState::ResponseSent
            | ChapClientState::ReauthSent
            | ChapClientState::Failed
            | ChapClientState::Opened => self.state = ChapClientState::Closed,
        }
    }

    /// Returns a watch channel receiver that can be used to monitor whether
    /// the `ChapClient` is in the `Opened` state.
    pub fn opened(&self) -> watch::Receiver<bool> {
        self.upper_status_rx.clone()
    }

    fn rc(&mut self, packet: ChapPacket) {
        match self.state {
            ChapClientState::Initial | ChapClientState::Starting => {} // illegal
            ChapClientState::Closed | ChapClientState::Stopped | ChapClientState::Failed => {}
            ChapClientState::Waiting
            | ChapClientState::ResponseSent
            | ChapClientState::ReauthSent => {
                self.output_tx
                    .send(ChapPacket {
                        ty: ChapType::Response,
                        id: packet.id,
                        data: packet.data,
                    })
                    .expect("output channel is closed");

                self.state = ChapClientState::ResponseSent;
            }
            ChapClientState::Opened => {
                self.output_tx
                    .send(ChapPacket {
                        ty: ChapType::Response,
                        id: packet.id,
                        data: packet.data,
                    })
                    .expect("output channel is closed");

                self.state = ChapClientState::ReauthSent;
            }
        }
    }

    fn rs(&mut self) {
        match self.state {
            ChapClientState::Initial | ChapClientState::Starting => {} // illegal
            ChapClientState::Closed
            | ChapClientState::Stopped
            | ChapClientState::Failed
            | ChapClientState::Opened => {}
            ChapClientState::Waiting
            | ChapClientState::ResponseSent
            | ChapClientState::ReauthSent => {
                self.upper_status_tx
                    .send(true)
                    .expect("upper status channel is closed");

                self.state = ChapClientState::Opened;
            }
        }
    }

    fn rf(&mut self) {
        match self.state {
            ChapClientState::Initial | ChapClientState::Starting => {} // illegal
            ChapClientState::Closed | ChapClientState::Stopped | ChapClientState::Failed => {}
            ChapClientState::Waiting
            | ChapClientState::ResponseSent
            | ChapClientState::ReauthSent
            | ChapClientState::Opened => {
                self.upper_status_tx.send_if_modified(|value| {
                    let ret = *value;
                    *value = false;
                    ret
                });

                self.state = ChapClientState::Failed;
                self.output_tx
                    .send(ChapPacket {
                        ty: ChapType::TerminateLower,
                        id: 0,
                        data: Vec::default(),
                    })
                    .expect("output channel is closed");
            }
        }
    }
}

/// The CHAP authenticator state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ChapServerState {
    #[default]
    Initial, // Lower layer down, no Open has occured, no restart timer
    Starting,      // Lower layer down, Open initiated, no restart timer; Up triggers Challenge
    Closed,        // Lower layer up, no Open has occured, no restart timer
    Stopped,       // Lower layer up, Open initiated, no restart timer
    ChallengeSent, // Challenge sent, no valid Response, restart timer running
    Failed,        // Failure sent or timeout hit, no restart timer; link is to be terminated
    Opened,        // Success sent, no restart timer; auth is successful
}

/// The Challenge-Handshake Authentication Protocol authenticator
/// implementation as per RFC 1994. The supervisor generates the random
/// challenge value, recomputes the expected digest on each Response and
/// feeds the verification result in; a mismatch produces exactly one
/// Failure message followed by link teardown, never a credential retry.
#[derive(Debug)]
pub struct ChapServer {
    state: ChapServerState,

    restart_timer: Interval,
    restart_counter: u32,

    max_challenge: u32,

    output_tx: mpsc::UnboundedSender<ChapPacket>,
    output_rx: mpsc::UnboundedReceiver<ChapPacket>,

    upper_status_tx: watch::Sender<bool>,
    upper_status_rx: watch::Receiver<bool>,
}

impl ChapServer {
    /// Creates a new `ChapServer`.
    ///
    /// You must start calling the [`ChapServer::to_send`] method
    /// before calling the [`ChapServer::up`] method
    /// and keep calling it until [`ChapServer::close`] and [`ChapServer::down`]
    /// have been issued.
    ///
    /// # Arguments
    ///
    /// * `restart_interval` - The Challenge retransmission interval, default is 3 seconds.
    /// * `max_challenge` - The maximum number of Challenges to transmit, default is 10.
    pub fn new(restart_interval: Option<Duration>, max_challenge: Option<u32>) -> Self {
        let restart_timer =
            tokio::time::interval(restart_interval.unwrap_or(Duration::from_secs(3)));
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (upper_status_tx, upper_status_rx) = watch::channel(false);

        Self {
            state: ChapServerState::default(),

            restart_timer,
            restart_counter: 0,

            max_challenge: max_challenge.unwrap_or(10),

            output_tx,
            output_rx,

            upper_status_tx,
            upper_status_rx,
        }
    }

    /// Waits for and returns the next packet to send.
    pub async fn to_send(&mut self) -> ChapPacket {
        loop {
            tokio::select! {
                packet = self.output_rx.recv() => return packet.expect("output channel is closed"),
                _ = self.restart_timer.tick() => {
                    if self.state != ChapServerState::ChallengeSent { continue; }

                    if self.restart_counter > 0 {
                        self.restart_counter -= 1;
                        return ChapPacket {
                            ty: ChapType::Challenge,
                            id: 0,
                            data: Vec::default(),
                        };
                    } else {
                        self.state = ChapServerState::Failed;
                        return ChapPacket {
                            ty: ChapType::TerminateLower,
                            id: 0,
                            data: Vec::default(),
                        };
                    }
                }
            }
        }
    }

    /// Feeds the verification result of a received Response into the
    /// state machine. A valid digest produces a Success message; an
    /// invalid one produces exactly one Failure message followed by a
    /// link teardown request.
    pub fn from_recv(&mut self, id: u8, valid: bool) {
        match self.state {
            ChapServerState::Initial | ChapServerState::Starting => {} // illegal
            ChapServerState::Closed | ChapServerState::Stopped | ChapServerState::Failed => {}
            ChapServerState::ChallengeSent => {
                if valid {
                    self.output_tx
                        .send(ChapPacket {
                            ty: ChapType::Success,
                            id,
                            data: Vec::default(),
                        })
                        .expect("output channel is closed");
                    self.upper_status_tx
                        .send(true)
                        .expect("upper status channel is closed");

                    self.state = ChapServerState::Opened;
                } else {
                    self.output_tx
                        .send(ChapPacket {
                            ty: ChapType::Failure,
                            id,
                            data: Vec::default(),
                        })
                        .expect("output channel is closed");
                    self.output_tx
                        .send(ChapPacket {
                            ty: ChapType::TerminateLower,
                            id: 0,
                            data: Vec::default(),
                        })
                        .expect("output channel is closed");

                    self.state = ChapServerState::Failed;
                }
            }
            // A duplicate of the valid Response is re-acked.
            ChapServerState::Opened => {
                if valid {
                    self.output_tx
                        .send(ChapPacket {
                            ty: ChapType::Success,
                            id,
                            data: Vec::default(),
                        })
                        .expect("output channel is closed");
                }
            }
        }
    }

    /// Signals to the state machine that the lower layer is now up.
    /// This is equivalent to the Up event.
    pub fn up(&mut self) {
        match self.state {
            ChapServerState::Initial => self.state = ChapServerState::Closed,
            ChapServerState::Starting => {
                self.restart_timer.reset();
                self.restart_counter = self.max_challenge;

                self.output_tx
                    .send(ChapPacket {
                        ty: ChapType::Challenge,
                        id: 0,
                        data: Vec::default(),
                    })
                    .expect("output channel is closed");
                self.restart_counter -= 1;

                self.state = ChapServerState::ChallengeSent;
            }
            ChapServerState::Closed
            | ChapServerState::Stopped
            | ChapServerState::ChallengeSent
            | ChapServerState::Failed
            | ChapServerState::Opened => {} // illegal
        }
    }

    /// Signals to the state machine that the lower layer is now down.
    /// This is equivalent to the Down event.
    pub fn down(&mut self) {
        match self.state {
            ChapServerState::Initial | ChapServerState::Starting => {} // illegal
            ChapServerState::Closed => self.state = ChapServerState::Initial,
            ChapServerState::Stopped
            | ChapServerState::ChallengeSent
            | ChapServerState::Failed => self.state = ChapServerState::Starting,
            ChapServerState::Opened => {
                self.upper_status_tx
                    .send(false)
                    .expect("upper status channel is closed");
                self.state = ChapServerState::Starting;
            }
        }
    }

    /// Issues an administrative open, allowing the protocol to start challenging.
    /// This is equivalent to the Open event.
    pub fn open(&mut self) {
        match self.state {
            ChapServerState::Initial => self.state = ChapServerState::Starting,
            ChapServerState::Starting => {}
            ChapServerState::Closed => {
                self.restart_timer.reset();
                self.restart_counter = self.max_challenge;

                self.output_tx
                    .send(ChapPacket {
                        ty: ChapType::Challenge,
                        id: 0,
                        data: Vec::default(),
                    })
                    .expect("output channel is closed");
                self.restart_counter -= 1;

                self.state = ChapServerState::ChallengeSent;
            }
            ChapServerState::Stopped
            | ChapServerState::ChallengeSent
            | ChapServerState::Failed
            | ChapServerState::Opened => {}
        }
    }

    /// Issues an administrative close, gracefully shutting down the protocol.
    /// This is equivalent to the Close event.
    pub fn close(&mut self) {
        match self.state {
            ChapServerState::Initial | ChapServerState::Closed => {} // illegal
            ChapServerState::Starting => self.state = ChapServerState::Initial,
            ChapServerState::Stopped
            | ChapServerState::ChallengeSent
            | ChapServerState::Failed
            | ChapServerState::Opened => self.state = ChapServerState::Closed,
        }
    }

    /// Returns a watch channel receiver that can be used to monitor whether
    /// the `ChapServer` is in the `Opened` state.
    pub fn opened(&self) -> watch::Receiver<bool> {
        self.upper_status_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_responds_to_challenge_and_opens_on_success() {
        let mut client = ChapClient::new(None);
        client.open();
        client.up();
        assert_eq!(client.state, ChapClientState::Waiting);

        client.from_recv(ChapPacket {
            ty: ChapType::Challenge,
            id: 3,
            data: vec![0xaa; 16],
        });

        let response = client.to_send().await;
        assert_eq!(response.ty, ChapType::Response);
        assert_eq!(response.id, 3);
        assert_eq!(response.data, vec![0xaa; 16]);

        client.from_recv(ChapPacket {
            ty: ChapType::Success,
            id: 3,
            data: Vec::default(),
        });
        assert_eq!(client.state, ChapClientState::Opened);
        assert!(*client.opened().borrow());
    }

    #[tokio::test]
    async fn client_tears_down_on_failure_without_retry() {
        let mut client = ChapClient::new(None);
        client.open();
        client.up();

        client.from_recv(ChapPacket {
            ty: ChapType::Challenge,
            id: 1,
            data: vec![0x55; 16],
        });
        let _ = client.to_send().await;

        client.from_recv(ChapPacket {
            ty: ChapType::Failure,
            id: 1,
            data: Vec::default(),
        });

        let packet = client.to_send().await;
        assert_eq!(packet.ty, ChapType::TerminateLower);
        assert_eq!(client.state, ChapClientState::Failed);

        // A further Challenge must not produce a Response.
        client.from_recv(ChapPacket {
            ty: ChapType::Challenge,
            id: 2,
            data: vec![0x55; 16],
        });
        assert!(client.output_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_challenges_and_opens_on_valid_response() {
        let mut server = ChapServer::new(None, None);
        server.open();
        server.up();

        let challenge = server.to_send().await;
        assert_eq!(challenge.ty, ChapType::Challenge);
        assert_eq!(server.state, ChapServerState::ChallengeSent);

        server.from_recv(7, true);
        let success = server.to_send().await;
        assert_eq!(success.ty, ChapType::Success);
        assert!(*server.opened().borrow());
    }

    #[tokio::test]
    async fn server_sends_one_failure_then_teardown_on_bad_digest() {
        let mut server = ChapServer::new(None, None);
        server.open();
        server.up();
        let _ = server.to_send().await;

        server.from_recv(7, false);

        let failure = server.to_send().await;
        assert_eq!(failure.ty, ChapType::Failure);
        let teardown = server.to_send().await;
        assert_eq!(teardown.ty, ChapType::TerminateLower);
        assert_eq!(server.state, ChapServerState::Failed);

        // No credential retry is attempted at this layer.
        server.from_recv(8, false);
        assert!(server.output_rx.try_recv().is_err());
    }
}
