//! Password Authentication Protocol state machines as per RFC 1334
//! section 2, for both the authenticating peer and the authenticator.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Interval;

/// The PAP peer state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum PapClientState {
    #[default]
    Initial, // Lower layer down, no Open has occured, no restart timer
    Starting,    // Lower layer down, Open initiated, no restart timer; Up triggers Auth-Req
    Closed,      // Lower layer up, no Open has occured, no restart timer
    Stopped,     // Lower layer up, Open initiated, no restart_timer
    RequestSent, // Auth-Req sent, no reply, restart timer running
    Failed,      // Auth-Req sent, Auth-Nak received, no restart timer; link is to be terminated
    Opened,      // Auth-Req sent, Auth-Ack received, no restart timer; auth is completed
}

/// A packet that can be an Authenticate-Request, Authenticate-Ack, Authenticate-Nak
/// or a signal to terminate the link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PapPacket {
    AuthenticateRequest,
    AuthenticateAck,
    AuthenticateNak,
    TerminateLower,
}

/// The Password Authentication Protocol peer implementation
/// as per RFC 1334 section 2.
#[derive(Debug)]
pub struct PapClient {
    state: PapClientState,

    restart_timer: Interval,
    restart_counter: u32,

    max_request: u32,

    output_tx: mpsc::UnboundedSender<PapPacket>,
    output_rx: mpsc::UnboundedReceiver<PapPacket>,

    upper_status_tx: watch::Sender<bool>,
    upper_status_rx: watch::Receiver<bool>,
}

impl PapClient {
    /// Creates a new `PapClient`.
    ///
    /// You must start calling the [`PapClient::to_send`] method
    /// before calling the [`PapClient::up`] method
    /// and keep calling it until [`PapClient::close`] and [`PapClient::down`]
    /// have been issued.
    ///
    /// # Arguments
    ///
    /// * `restart_interval` - The retransmission interval, default is 3 seconds.
    /// * `max_request` - The maximum number of Authenticate-Requests to send.
    ///   The default is 2: the initial request plus one administrative resend.
    pub fn new(restart_interval: Option<Duration>, max_request: Option<u32>) -> Self {
        let restart_timer =
            tokio::time::interval(restart_interval.unwrap_or(Duration::from_secs(3)));
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (upper_status_tx, upper_status_rx) = watch::channel(false);

        Self {
            state: PapClientState::default(),

            restart_timer,
            restart_counter: 0,

            max_request: max_request.unwrap_or(2),

            output_tx,
            output_rx,

            upper_status_tx,
            upper_status_rx,
        }
    }

    /// Waits for and returns the next packet to send.
    pub async fn to_send(&mut self) -> PapPacket {
        loop {
            tokio::select! {
                packet = self.output_rx.recv() => return packet.expect("output channel is closed"),
                _ = self.restart_timer.tick() => {
                    if self.state != PapClientState::RequestSent { continue; }

                    if self.restart_counter > 0 {
                        self.restart_counter -= 1;
                        return PapPacket::AuthenticateRequest;
                    } else {
                        self.state = PapClientState::Failed;
                        return PapPacket::TerminateLower;
                    }
                }
            }
        }
    }

    /// Feeds a packet into the state machine for processing.
    /// Can trigger the RAA or RAN events.
    pub fn from_recv(&mut self, packet: PapPacket) {
        match packet {
            PapPacket::AuthenticateRequest | PapPacket::TerminateLower => {} // illegal
            PapPacket::AuthenticateAck => self.raa(),
            PapPacket::AuthenticateNak => self.ran(),
        }
    }

    /// Signals to the state machine that the lower layer is now up.
    /// This is equivalent to the Up event.
    pub fn up(&mut self) {
        match self.state {
            PapClientState::Initial => self.state = PapClientState::Closed,
            PapClientState::Starting => {
                self.restart_timer.reset();
                self.restart_counter = self.max_request;

                self.output_tx
                    .send(PapPacket::AuthenticateRequest)
                    .expect("output channel is closed");
                self.restart_counter -= 1;

                self.state = PapClientState::RequestSent;
            }
            PapClientState::Closed
            | PapClientState::Stopped
            | PapClientState::RequestSent
            | PapClientState::Failed
            | PapClientState::Opened => {} // illegal
        }
    }

    /// Signals to the state machine that the lower layer is now down.
    /// This is equivalent to the Down event.
    pub fn down(&mut self) {
        match self.state {
            PapClientState::Initial | PapClientState::Starting => {} // illegal
            PapClientState::Closed => self.state = PapClientState::Initial,
            PapClientState::Stopped
            | PapClientState::RequestSent
            | PapClientState::Failed => self.state = PapClientState::Starting,
            PapClientState::Opened => {
                self.upper_status_tx
                    .send(false)
                    .expect("upper status channel is closed");
                self.state = PapClientState::Starting;
            }
        }
    }

    /// Issues an administrative open, allowing the protocol to start authentication.
    /// This is equivalent to the Open event.
    pub fn open(&mut self) {
        match self.state {
            PapClientState::Initial => self.state = PapClientState::Starting,
            PapClientState::Starting => {}
            PapClientState::Closed => {
                self.restart_timer.reset();
                self.restart_counter = self.max_request;

                self.output_tx
                    .send(PapPacket::AuthenticateRequest)
                    .expect("output channel is closed");
                self.restart_counter -= 1;

                self.state = PapClientState::RequestSent;
            }
            PapClientState::Stopped
            | PapClientState::RequestSent
            | PapClientState::Failed
            | PapClientState::Opened => {}
        }
    }

    /// Issues an administrative close, gracefully shutting down the protocol.
    /// This is equivalent to the Close event.
    pub fn close(&mut self) {
        match self.state {
            PapClientState::Initial | PapClientState::Closed => {} // illegal
            PapClientState::Starting => self.state = PapClientState::Initial,
            PapClientState::Stopped
            | PapClientState::RequestSent
            | PapClientState::Failed
            | PapClientState::Opened => self.state = PapClientState::Closed,
        }
    }

    /// Returns a watch channel receiver that can be used to monitor whether
    /// the `PapClient` is in the `Opened` state.
    pub fn opened(&self) -> watch::Receiver<bool> {
        self.upper_status_rx.clone()
    }

    fn raa(&mut self) {
        match self.state {
            PapClientState::Initial | PapClientState::Starting => {} // illegal
            PapClientState::Closed
            | PapClientState::Stopped
            | PapClientState::Failed
            | PapClientState::Opened => {}
            PapClientState::RequestSent => {
                self.upper_status_tx
                    .send(true)
                    .expect("upper status channel is closed");

                self.state = PapClientState::Opened;
            }
        }
    }

    fn ran(&mut self) {
        match self.state {
            PapClientState::Initial | PapClientState::Starting => {} // illegal
            PapClientState::Closed | PapClientState::Stopped | PapClientState::Failed => {}
            PapClientState::RequestSent | PapClientState::Opened => {
                self.upper_status_tx.send_if_modified(|value| {
                    let ret = *value;
                    *value = false;
                    ret
                });

                self.output_tx
                    .send(PapPacket::TerminateLower)
                    .expect("output channel is closed");

                self.state = PapClientState::Failed;
            }
        }
    }
}

/// The PAP authenticator state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum PapServerState {
    #[default]
    Initial, // Lower layer down, no Open has occured, no timeout
    Starting,  // Lower layer down, Open initiated, no timeout
    Closed,    // Lower layer up, no Open has occured, no timeout
    Stopped,   // Lower layer up, Open initiated, no timeout
    Listening, // No Auth-Req received, timeout running
    Failed,    // Auth-Nak sent or timeout hit, no timeout; link is to be terminated
    Opened,    // Auth-Ack sent, no timeout; auth is completed
}

/// The Password Authentication Protocol authenticator implementation.
/// Credential validation against the secret store is performed by the
/// supervisor; this machine only tracks the exchange.
#[derive(Debug)]
pub struct PapServer {
    state: PapServerState,

    timeout: Interval,

    output_tx: mpsc::UnboundedSender<PapPacket>,
    output_rx: mpsc::UnboundedReceiver<PapPacket>,

    upper_status_tx: watch::Sender<bool>,
    upper_status_rx: watch::Receiver<bool>,
}

impl PapServer {
    /// Creates a new `PapServer`.
    ///
    /// You must start calling the [`PapServer::to_send`] method
    /// before calling the [`PapServer::up`] method
    /// and keep calling it until [`PapServer::close`] and [`PapServer::down`]
    /// have been issued.
    ///
    /// # Arguments
    ///
    /// * `timeout` - The timeout for receiving an Authenticate-Request,
    ///   default is 30 seconds.
    pub fn new(timeout: Option<Duration>) -> Self {
        let timeout = tokio::time::interval(timeout.unwrap_or(Duration::from_secs(30)));
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (upper_status_tx, upper_status_rx) = watch::channel(false);

        Self {
            state: PapServerState::default(),

            timeout,

            output_tx,
            output_rx,

            upper_status_tx,
            upper_status_rx,
        }
    }

    /// Waits for and returns the next packet to send.
    pub async fn to_send(&mut self) -> PapPacket {
        loop {
            tokio::select! {
                packet = self.output_rx.recv() => return packet.expect("output channel is closed"),
                _ = self.timeout.tick() => {
                    if self.state != PapServerState::Listening { continue; }

                    self.state = PapServerState::Failed;
                    return PapPacket::TerminateLower;
                }
            }
        }
    }

    /// Feeds the validation result of a received Authenticate-Request
    /// into the state machine. Exactly one reply is sent; a failed
    /// validation additionally requests link termination.
    pub fn from_recv(&mut self, valid: bool) {
        match self.state {
            PapServerState::Initial | PapServerState::Starting => {} // illegal
            PapServerState::Closed | PapServerState::Stopped | PapServerState::Failed => {}
            PapServerState::Listening => {
                if valid {
                    self.output_tx
                        .send(PapPacket::AuthenticateAck)
                        .expect("output channel is closed");
                    self.upper_status_tx
                        .send(true)
                        .expect("upper status channel is closed");

                    self.state = PapServerState::Opened;
                } else {
                    self.output_tx
                        .send(PapPacket::AuthenticateNak)
                        .expect("output channel is closed");
                    self.output_tx
                        .send(PapPacket::TerminateLower)
                        .expect("output channel is closed");

                    self.state = PapServerState::Failed;
                }
            }
            // A duplicate request on an authenticated link is re-acked.
            PapServerState::Opened => {
                if valid {
                    self.output_tx
                        .send(PapPacket::AuthenticateAck)
                        .expect("output channel is closed");
                }
            }
        }
    }

    /// Signals to the state machine that the lower layer is now up.
    /// This is equivalent to the Up event.
    pub fn up(&mut self) {
        match self.state {
            PapServerState::Initial => self.state = PapServerState::Closed,
            PapServerState::Starting => {
                self.timeout.reset();
                self.state = PapServerState::Listening;
            }
            PapServerState::Closed
            | PapServerState::Stopped
            | PapServerState::Listening
            | PapServerState::Failed
            | PapServerState::Opened => {} // illegal
        }
    }

    /// Signals to the state machine that the lower layer is now down.
    /// This is equivalent to the Down event.
    pub fn down(&mut self) {
        match self.state {
            PapServerState::Initial | PapServerState::Starting => {} // illegal
            PapServerState::Closed => self.state = PapServerState::Initial,
            PapServerState::Stopped
            | PapServerState::Listening
            | PapServerState::Failed => self.state = PapServerState::Starting,
            PapServerState::Opened => {
                self.upper_status_tx
                    .send(false)
                    .expect("upper status channel is closed");
                self.state = PapServerState::Starting;
            }
        }
    }

    /// Issues an administrative open, arming the request timeout.
    /// This is equivalent to the Open event.
    pub fn open(&mut self) {
        match self.state {
            PapServerState::Initial => self.state = PapServerState::Starting,
            PapServerState::Starting => {}
            PapServerState::Closed => {
                self.timeout.reset();
                self.state = PapServerState::Listening;
            }
            PapServerState::Stopped
            | PapServerState::Listening
            | PapServerState::Failed
            | PapServerState::Opened => {}
        }
    }

    /// Issues an administrative close, gracefully shutting down the protocol.
    /// This is equivalent to the Close event.
    pub fn close(&mut self) {
        match self.state {
            PapServerState::Initial | PapServerState::Closed => {} // illegal
            PapServerState::Starting => self.state = PapServerState::Initial,
            PapServerState::Stopped
            | PapServerState::Listening
            | PapServerState::Failed
            | PapServerState::Opened => self.state = PapServerState::Closed,
        }
    }

    /// Returns a watch channel receiver that can be used to monitor whether
    /// the `PapServer` is in the `Opened` state.
    pub fn opened(&self) -> watch::Receiver<bool> {
        self.upper_status_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_opens_on_ack() {
        let mut client = PapClient::new(None, None);
        client.open();
        client.up();

        assert_eq!(client.to_send().await, PapPacket::AuthenticateRequest);

        client.from_recv(PapPacket::AuthenticateAck);
        assert_eq!(client.state, PapClientState::Opened);
        assert!(*client.opened().borrow());
    }

    #[tokio::test]
    async fn client_fails_on_nak_and_requests_teardown_once() {
        let mut client = PapClient::new(None, None);
        client.open();
        client.up();

        assert_eq!(client.to_send().await, PapPacket::AuthenticateRequest);

        client.from_recv(PapPacket::AuthenticateNak);
        assert_eq!(client.to_send().await, PapPacket::TerminateLower);
        assert_eq!(client.state, PapClientState::Failed);

        // A second Nak must not trigger another teardown request.
        client.from_recv(PapPacket::AuthenticateNak);
        assert!(client.output_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn server_acks_valid_credentials() {
        let mut server = PapServer::new(None);
        server.open();
        server.up();
        assert_eq!(server.state, PapServerState::Listening);

        server.from_recv(true);
        assert_eq!(server.to_send().await, PapPacket::AuthenticateAck);
        assert!(*server.opened().borrow());
    }

    #[tokio::test]
    async fn server_naks_bad_credentials_and_terminates() {
        let mut server = PapServer::new(None);
        server.open();
        server.up();

        server.from_recv(false);
        assert_eq!(server.to_send().await, PapPacket::AuthenticateNak);
        assert_eq!(server.to_send().await, PapPacket::TerminateLower);
        assert_eq!(server.state, PapServerState::Failed);
        assert!(!*server.opened().borrow());
    }
}
