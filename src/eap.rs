//! Extensible Authentication Protocol state machines as per RFC 3748,
//! for both the responding peer and the authenticator, plus the
//! fragmentation framer and session trait used by EAP-TLS (RFC 5216).
//!
//! Method payloads (identity strings, MD5 digests, TLS records) are
//! produced and verified by the supervisor; these machines track the
//! request/response exchange and method negotiation.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Interval;

use crate::{Error, Result};

/// EAP method type: Identity.
pub const METHOD_IDENTITY: u8 = 1;
/// EAP method type: Legacy Nak, used to counter-propose methods.
pub const METHOD_NAK: u8 = 3;
/// EAP method type: MD5-Challenge.
pub const METHOD_MD5_CHALLENGE: u8 = 4;
/// EAP method type: EAP-TLS.
pub const METHOD_TLS: u8 = 13;

/// List of valid packet codes for `EapPacket`s.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EapCode {
    Request,
    Response,
    Success,
    Failure,
    TerminateLower,
}

/// A single EAP message. For Requests and Responses the `method` field
/// carries the EAP type and `data` its payload; Success and Failure
/// carry neither.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EapPacket {
    pub code: EapCode,
    pub id: u8,
    pub method: u8,
    pub data: Vec<u8>,
}

/// The EAP peer state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum EapClientState {
    #[default]
    Initial, // Lower layer down, no Open has occured, no timeout
    Starting,     // Lower layer down, Open initiated, no timeout
    Closed,       // Lower layer up, no Open has occured, no timeout
    Stopped,      // Lower layer up, Open initiated, no timeout
    Waiting,      // No Request received, timeout running
    ResponseSent, // Response sent, no reply, timeout running
    Failed,       // Failure received or timeout hit, no timeout; link is to be terminated
    Opened,       // Success received, no timeout; auth is successful
}

/// The Extensible Authentication Protocol peer implementation
/// as per RFC 3748.
#[derive(Debug)]
pub struct EapClient {
    state: EapClientState,

    supported: Vec<u8>,

    timeout: Interval,

    output_tx: mpsc::UnboundedSender<EapPacket>,
    output_rx: mpsc::UnboundedReceiver<EapPacket>,

    upper_status_tx: watch::Sender<bool>,
    upper_status_rx: watch::Receiver<bool>,
}

impl EapClient {
    /// Creates a new `EapClient`.
    ///
    /// You must start calling the [`EapClient::to_send`] method
    /// before calling the [`EapClient::up`] method
    /// and keep calling it until [`EapClient::close`] and [`EapClient::down`]
    /// have been issued.
    ///
    /// # Arguments
    ///
    /// * `supported` - The EAP methods this peer is willing to perform, in order of preference.
    /// * `timeout` - The timeout for receiving Requests, default is 30 seconds.
    pub fn new(supported: Vec<u8>, timeout: Option<Duration>) -> Self {
        let timeout = tokio::time::interval(timeout.unwrap_or(Duration::from_secs(30)));
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (upper_status_tx, upper_status_rx) = watch::channel(false);

        Self {
            state: EapClientState::default(),

            supported,

            timeout,

            output_tx,
            output_rx,

            upper_status_tx,
            upper_status_rx,
        }
    }

    /// Waits for and returns the next packet to send.
    pub async fn to_send(&mut self) -> EapPacket {
        loop {
            tokio::select! {
                packet = self.output_rx.recv() => return packet.expect("output channel is closed"),
                _ = self.timeout.tick() => {
                    match self.state {
                        EapClientState::Waiting | EapClientState::ResponseSent => {
                            self.state = EapClientState::Failed;
                            return EapPacket {
                                code: EapCode::TerminateLower,
                                id: 0,
                                method: 0,
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
    /// Requests for an unsupported method are answered with a Legacy Nak
    /// listing the supported methods; supported Requests are echoed back
    /// as Responses for the supervisor to fill with method data.
    pub fn from_recv(&mut self, packet: EapPacket) {
        match packet.code {
            EapCode::Request => self.rr(packet),
            EapCode::Response | EapCode::TerminateLower => {} // illegal
            EapCode::Success => self.rs(),
            EapCode::Failure => self.rf(),
        }
    }

    /// Signals to the state machine that the lower layer is now up.
    /// This is equivalent to the Up event.
    pub fn up(&mut self) {
        match self.state {
            EapClientState::Initial => self.state = EapClientState::Closed,
            EapClientState::Starting => {
                self.timeout.reset();
                self.state = EapClientState::Waiting;
            }
            EapClientState::Closed
            | EapClientState::Stopped
            | EapClientState::Waiting
            | EapClientState::ResponseSent
            | EapClientState::Failed
            | EapClientState::Opened => {} // illegal
        }
    }

    /// Signals to the state machine that the lower layer is now down.
    /// This is equivalent to the Down event.
    pub fn down(&mut self) {
        match self.state {
            EapClientState::Initial | EapClientState::Starting => {} // illegal
            EapClientState::Closed => self.state = EapClientState::Initial,
            EapClientState::Stopped
            | EapClientState::Waiting
            | EapClientState::ResponseSent
            | EapClientState::Failed => self.state = EapClientState::Starting,
            EapClientState::Opened => {
                self.upper_status_tx
                    .send(false)
                    .expect("upper status channel is closed");

                self.state = EapClientState::Starting;
            }
        }
    }

    /// Issues an administrative open, allowing the protocol to start authentication.
    /// This is equivalent to the Open event.
    pub fn open(&mut self) {
        match self.state {
            EapClientState::Initial => self.state = EapClientState::Starting,
            EapClientState::Starting
            | EapClientState::Stopped
            | EapClientState::Waiting
            | EapClientState::ResponseSent
            | EapClientState::Failed
            | EapClientState::Opened => {}
            EapClientState::Closed => {
                self.timeout.reset();
                self.state = EapClientState::Waiting;
            }
        }
    }

    /// Issues an administrative close, gracefully shutting down the protocol.
    /// This is equivalent to the Close event.
    pub fn close(&mut self) {
        match self.state {
            EapClientState::Initial | EapClientState::Closed => {} // illegal
            EapClientState::Starting => self.state = EapClientState::Initial,
            EapClientState::Stopped
            | EapClientState::Waiting
            | EapClientState::ResponseSent
            | EapClientState::Failed
            | EapClientState::Opened => self.state = EapClientState::Closed,
        }
    }

    /// Returns a watch channel receiver that can be used to monitor whether
    /// the `EapClient` is in the `Opened` state.
    pub fn opened(&self) -> watch::Receiver<bool> {
        self.upper_status_rx.clone()
    }

    fn rr(&mut self, packet: EapPacket) {
        match self.state {
            EapClientState::Initial | EapClientState::Starting => {} // illegal
            EapClientState::Closed | EapClientState::Stopped | EapClientState::Failed => {}
            EapClientState::Waiting | EapClientState::ResponseSent | EapClientState::Opened => {
                let reply = if packet.method == METHOD_IDENTITY
                    || self.supported.contains(&packet.method)
                {
                    EapPacket {
                        code: EapCode::Response,
                        id: packet.id,
                        method: packet.method,
                        data: packet.data,
                    }
                } else {
                    EapPacket {
                        code: EapCode::Response,
                        id: packet.id,
                        method: METHOD_NAK,
                        data: self.supported.clone(),
                    }
                };

                self.output_tx
                    .send(reply)
                    .expect("output channel is closed");

                if self.state != EapClientState::Opened {
                    self.state = EapClientState::ResponseSent;
                }
            }
        }
    }

    fn rs(&mut self) {
        match self.state {
            EapClientState::Initial | EapClientState::Starting => {} // illegal
            EapClientState::Closed
            | EapClientState::Stopped
            | EapClientState::Failed
            | EapClientState::Opened => {}
            EapClientState::Waiting | EapClientState::ResponseSent => {
                self.upper_status_tx
                    .send(true)
                    .expect("upper status channel is closed");

                self.state = EapClientState::Opened;
            }
        }
    }

    fn rf(&mut self) {
        match self.state {
            EapClientState::Initial | EapClientState::Starting => {} // illegal
            EapClientState::Closed | EapClientState::Stopped | EapClientState::Failed => {}
            EapClientState::Waiting | EapClientState::ResponseSent | EapClientState::Opened => {
                self.upper_status_tx.send_if_modified(|value| {
                    let ret = *value;
                    *value = false;
                    ret
                });

                self.state = EapClientState::Failed;
                self.output_tx
                    .send(EapPacket {
                        code: EapCode::TerminateLower,
                        id: 0,
                        method: 0,
                        data: Vec::default(),
                    })
                    .expect("output channel is closed");
            }
        }
    }
}

/// The EAP authenticator state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum EapServerState {
    #[default]
    Initial, // Lower layer down, no Open has occured, no restart timer
    Starting,     // Lower layer down, Open initiated, no restart timer; Up triggers Identity
    Closed,       // Lower layer up, no Open has occured, no restart timer
    Stopped,      // Lower layer up, Open initiated, no restart timer
    IdentitySent, // Identity Request sent, no Response, restart timer running
    MethodSent,   // Method Request sent, no valid Response, restart timer running
    Failed,       // Failure sent or timeout hit, no restart timer; link is to be terminated
    Opened,       // Success sent, no restart timer; auth is successful
}

/// The Extensible Authentication Protocol authenticator implementation
/// as per RFC 3748. Carries an ordered list of offered methods; a peer
/// Legacy Nak selects the first offered method the peer also lists, or
/// fails authentication if there is none.
#[derive(Debug)]
pub struct EapServer {
    state: EapServerState,

    methods: Vec<u8>,
    current_method: u8,

    restart_timer: Interval,
    restart_counter: u32,

    max_request: u32,

    output_tx: mpsc::UnboundedSender<EapPacket>,
    output_rx: mpsc::UnboundedReceiver<EapPacket>,

    upper_status_tx: watch::Sender<bool>,
    upper_status_rx: watch::Receiver<bool>,
}

impl EapServer {
    /// Creates a new `EapServer`.
    ///
    /// You must start calling the [`EapServer::to_send`] method
    /// before calling the [`EapServer::up`] method
    /// and keep calling it until [`EapServer::close`] and [`EapServer::down`]
    /// have been issued.
    ///
    /// # Arguments
    ///
    /// * `methods` - The EAP methods to offer, in order of preference. Must not be empty.
    /// * `restart_interval` - The Request retransmission interval, default is 3 seconds.
    /// * `max_request` - The maximum number of Requests to transmit, default is 10.
    pub fn new(
        methods: Vec<u8>,
        restart_interval: Option<Duration>,
        max_request: Option<u32>,
    ) -> Self {
        let restart_timer =
            tokio::time::interval(restart_interval.unwrap_or(Duration::from_secs(3)));
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (upper_status_tx, upper_status_rx) = watch::channel(false);

        let current_method = methods.first().copied().unwrap_or(METHOD_MD5_CHALLENGE);

        Self {
            state: EapServerState::default(),

            methods,
            current_method,

            restart_timer,
            restart_counter: 0,

            max_request: max_request.unwrap_or(10),

            output_tx,
            output_rx,

            upper_status_tx,
            upper_status_rx,
        }
    }

    /// Waits for and returns the next packet to send.
    pub async fn to_send(&mut self) -> EapPacket {
        loop {
            tokio::select! {
                packet = self.output_rx.recv() => return packet.expect("output channel is closed"),
                _ = self.restart_timer.tick() => {
                    let method = match self.state {
                        EapServerState::IdentitySent => METHOD_IDENTITY,
                        EapServerState::MethodSent => self.current_method,
                        _ => continue, // stale tick
                    };

                    if self.restart_counter > 0 {
                        self.restart_counter -= 1;
                        return EapPacket {
                            code: EapCode::Request,
                            id: 0,
                            method,
                            data: Vec::default(),
                        };
                    } else {
                        self.state = EapServerState::Failed;
                        return EapPacket {
                            code: EapCode::TerminateLower,
                            id: 0,
                            method: 0,
                            data: Vec::default(),
                        };
                    }
                }
            }
        }
    }

    /// Feeds a peer Response into the state machine. An Identity Response
    /// advances to the first offered method; a Legacy Nak renegotiates the
    /// method. Method Responses are verified by the supervisor, which then
    /// calls [`EapServer::verdict`].
    pub fn from_recv(&mut self, packet: EapPacket) {
        if packet.code != EapCode::Response {
            return; // illegal
        }

        match self.state {
            EapServerState::Initial | EapServerState::Starting => {} // illegal
            EapServerState::Closed
            | EapServerState::Stopped
            | EapServerState::Failed
            | EapServerState::Opened => {}
            EapServerState::IdentitySent => {
                if packet.method == METHOD_IDENTITY {
                    self.restart_timer.reset();
                    self.restart_counter = self.max_request;

                    self.output_tx
                        .send(EapPacket {
                            code: EapCode::Request,
                            id: 0,
                            method: self.current_method,
                            data: Vec::default(),
                        })
                        .expect("output channel is closed");
                    self.restart_counter -= 1;

                    self.state = EapServerState::MethodSent;
                }
            }
            EapServerState::MethodSent => {
                if packet.method == METHOD_NAK {
                    match self
                        .methods
                        .iter()
                        .find(|method| packet.data.contains(method))
                    {
                        Some(method) => {
                            self.current_method = *method;

                            self.restart_timer.reset();
                            self.restart_counter = self.max_request;

                            self.output_tx
                                .send(EapPacket {
                                    code: EapCode::Request,
                                    id: 0,
                                    method: self.current_method,
                                    data: Vec::default(),
                                })
                                .expect("output channel is closed");
                            self.restart_counter -= 1;
                        }
                        None => self.fail(packet.id),
                    }
                }
            }
        }
    }

    /// Feeds the verification result of a method Response into the state
    /// machine. A valid Response produces a Success message; an invalid
    /// one produces exactly one Failure message followed by a link
    /// teardown request.
    pub fn verdict(&mut self, id: u8, valid: bool) {
        match self.state {
            EapServerState::MethodSent => {
                if valid {
                    self.output_tx
                        .send(EapPacket {
                            code: EapCode::Success,
                            id,
                            method: 0,
                            data: Vec::default(),
                        })
                        .expect("output channel is closed");
                    self.upper_status_tx
                        .send(true)
                        .expect("upper status channel is closed");

                    self.state = EapServerState::Opened;
                } else {
                    self.fail(id);
                }
            }
            _ => {} // illegal
        }
    }

    /// Signals to the state machine that the lower layer is now up.
    /// This is equivalent to the Up event.
    pub fn up(&mut self) {
        match self.state {
            EapServerState::Initial => self.state = EapServerState::Closed,
            EapServerState::Starting => self.begin(),
            EapServerState::Closed
            | EapServerState::Stopped
            | EapServerState::IdentitySent
            | EapServerState::MethodSent
            | EapServerState::Failed
            | EapServerState::Opened => {} // illegal
        }
    }

    /// Signals to the state machine that the lower layer is now down.
    /// This is equivalent to the Down event.
    pub fn down(&mut self) {
        match self.state {
            EapServerState::Initial | EapServerState::Starting => {} // illegal
            EapServerState::Closed => self.state = EapServerState::Initial,
            EapServerState::Stopped
            | EapServerState::IdentitySent
            | EapServerState::MethodSent
            | EapServerState::Failed => self.state = EapServerState::Starting,
            EapServerState::Opened => {
                self.upper_status_tx
                    .send(false)
                    .expect("upper status channel is closed");
                self.state = EapServerState::Starting;
            }
        }
    }

    /// Issues an administrative open, allowing the protocol to start authenticating.
    /// This is equivalent to the Open event.
    pub fn open(&mut self) {
        match self.state {
            EapServerState::Initial => self.state = EapServerState::Starting,
            EapServerState::Starting => {}
            EapServerState::Closed => self.begin(),
            EapServerState::Stopped
            | EapServerState::IdentitySent
            | EapServerState::MethodSent
            | EapServerState::Failed
            | EapServerState::Opened => {}
        }
    }

    /// Issues an administrative close, gracefully shutting down the protocol.
    /// This is equivalent to the Close event.
    pub fn close(&mut self) {
        match self.state {
            EapServerState::Initial | EapServerState::Closed => {} // illegal
            EapServerState::Starting => self.state = EapServerState::Initial,
            EapServerState::Stopped
            | EapServerState::IdentitySent
            | EapServerState::MethodSent
            | EapServerState::Failed
            | EapServerState::Opened => self.state = EapServerState::Closed,
        }
    }

    /// Returns a watch channel receiver that can be used to monitor whether
    /// the `EapServer` is in the `Opened` state.
    pub fn opened(&self) -> watch::Receiver<bool> {
        self.upper_status_rx.clone()
    }

    /// Returns the method currently being requested of the peer.
    pub fn current_method(&self) -> u8 {
        self.current_method
    }

    fn begin(&mut self) {
        self.restart_timer.reset();
        self.restart_counter = self.max_request;

        self.output_tx
            .send(EapPacket {
                code: EapCode::Request,
                id: 0,
                method: METHOD_IDENTITY,
                data: Vec::default(),
            })
            .expect("output channel is closed");
        self.restart_counter -= 1;

        self.state = EapServerState::IdentitySent;
    }

    fn fail(&mut self, id: u8) {
        self.output_tx
            .send(EapPacket {
                code: EapCode::Failure,
                id,
                method: 0,
                data: Vec::default(),
            })
            .expect("output channel is closed");
        self.output_tx
            .send(EapPacket {
                code: EapCode::TerminateLower,
                id: 0,
                method: 0,
                data: Vec::default(),
            })
            .expect("output channel is closed");

        self.state = EapServerState::Failed;
    }
}

/// EAP-TLS flag bit: a 4 byte message length field follows the flags.
pub const TLS_FLAG_LENGTH: u8 = 0x80;
/// EAP-TLS flag bit: more fragments follow.
pub const TLS_FLAG_MORE: u8 = 0x40;
/// EAP-TLS flag bit: start of the handshake.
pub const TLS_FLAG_START: u8 = 0x20;

/// The outcome of feeding a TLS message into a handshake session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TlsTurn {
    /// The session produced records to send to the peer.
    Respond(Vec<u8>),
    /// The handshake completed successfully.
    Finished,
    /// The handshake failed and authentication must be rejected.
    Failed,
}

/// A TLS handshake engine driven by reassembled EAP-TLS messages.
/// The supervisor supplies an implementation; the machines and framer
/// care only about the byte exchange.
pub trait TlsSession {
    fn advance(&mut self, inbound: &[u8]) -> TlsTurn;
}

/// Fragmentation and reassembly of EAP-TLS messages as per RFC 5216.
/// Outbound messages larger than the fragment size are split, with the
/// total length prefixed to the first fragment; inbound fragments are
/// buffered until the announced length has arrived.
#[derive(Debug, Default)]
pub struct TlsFramer {
    max_fragment: usize,

    outbound: Vec<u8>,
    outbound_sent: usize,

    inbound: Vec<u8>,
    inbound_expected: Option<usize>,
}

impl TlsFramer {
    /// Creates a new `TlsFramer`.
    ///
    /// # Arguments
    ///
    /// * `max_fragment` - The maximum TLS data bytes per EAP packet, default is 1024.
    pub fn new(max_fragment: Option<usize>) -> Self {
        Self {
            max_fragment: max_fragment.unwrap_or(1024),
            ..Default::default()
        }
    }

    /// Queues a complete TLS message for fragmented transmission,
    /// replacing any previous one.
    pub fn queue(&mut self, message: Vec<u8>) {
        self.outbound = message;
        self.outbound_sent = 0;
    }

    /// Returns the next outbound EAP-TLS payload (flags plus data),
    /// or `None` if the queued message has been sent in full.
    pub fn next_fragment(&mut self) -> Option<Vec<u8>> {
        if self.outbound_sent >= self.outbound.len() {
            return None;
        }

        let remaining = self.outbound.len() - self.outbound_sent;
        let take = remaining.min(self.max_fragment);
        let more = take < remaining;
        let first = self.outbound_sent == 0;

        let mut payload = Vec::with_capacity(take + 5);
        let mut flags = 0;
        if more {
            flags |= TLS_FLAG_MORE;
        }
        if first && more {
            flags |= TLS_FLAG_LENGTH;
        }
        payload.push(flags);
        if first && more {
            payload.extend_from_slice(&(self.outbound.len() as u32).to_be_bytes());
        }
        payload.extend_from_slice(&self.outbound[self.outbound_sent..self.outbound_sent + take]);

        self.outbound_sent += take;
        Some(payload)
    }

    /// Builds the payload of the initial EAP-TLS/Start Request.
    pub fn start_payload() -> Vec<u8> {
        vec![TLS_FLAG_START]
    }

    /// Builds an empty acknowledgement payload, sent to request the
    /// peer's next fragment.
    pub fn ack_payload() -> Vec<u8> {
        vec![0]
    }

    /// Feeds an inbound EAP-TLS payload into the reassembly buffer.
    /// Returns the complete TLS message once all fragments have arrived,
    /// or `None` if more fragments are expected and an acknowledgement
    /// should be sent.
    pub fn push(&mut self, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let (flags, mut data) = payload
            .split_first()
            .ok_or(Error::Truncated { want: 1, got: 0 })?;

        if flags & TLS_FLAG_LENGTH != 0 {
            if data.len() < 4 {
                return Err(Error::Truncated {
                    want: 4,
                    got: data.len(),
                });
            }

            let expected = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            self.inbound_expected = Some(expected);
            self.inbound.clear();
            data = &data[4..];
        } else if self.inbound_expected.is_none() {
            // Unfragmented message.
            return Ok(Some(data.to_vec()));
        }

        self.inbound.extend_from_slice(data);

        if flags & TLS_FLAG_MORE != 0 {
            return Ok(None);
        }

        self.inbound_expected = None;
        Ok(Some(std::mem::take(&mut self.inbound)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_answers_identity_and_opens_on_success() {
        let mut client = EapClient::new(vec![METHOD_MD5_CHALLENGE], None);
        client.open();
        client.up();
        assert_eq!(client.state, EapClientState::Waiting);

        client.from_recv(EapPacket {
            code: EapCode::Request,
            id: 1,
            method: METHOD_IDENTITY,
            data: Vec::default(),
        });
        let reply = client.to_send().await;
        assert_eq!(reply.code, EapCode::Response);
        assert_eq!(reply.method, METHOD_IDENTITY);
        assert_eq!(reply.id, 1);

        client.from_recv(EapPacket {
            code: EapCode::Request,
            id: 2,
            method: METHOD_MD5_CHALLENGE,
            data: vec![0xaa; 16],
        });
        let reply = client.to_send().await;
        assert_eq!(reply.method, METHOD_MD5_CHALLENGE);
        assert_eq!(reply.data, vec![0xaa; 16]);

        client.from_recv(EapPacket {
            code: EapCode::Success,
            id: 2,
            method: 0,
            data: Vec::default(),
        });
        assert_eq!(client.state, EapClientState::Opened);
        assert!(*client.opened().borrow());
    }

    #[tokio::test]
    async fn client_naks_unsupported_method() {
        let mut client = EapClient::new(vec![METHOD_MD5_CHALLENGE], None);
        client.open();
        client.up();

        client.from_recv(EapPacket {
            code: EapCode::Request,
            id: 4,
            method: METHOD_TLS,
            data: Vec::default(),
        });

        let reply = client.to_send().await;
        assert_eq!(reply.code, EapCode::Response);
        assert_eq!(reply.method, METHOD_NAK);
        assert_eq!(reply.data, vec![METHOD_MD5_CHALLENGE]);
    }

    #[tokio::test]
    async fn client_tears_down_on_failure() {
        let mut client = EapClient::new(vec![METHOD_MD5_CHALLENGE], None);
        client.open();
        client.up();

        client.from_recv(EapPacket {
            code: EapCode::Failure,
            id: 1,
            method: 0,
            data: Vec::default(),
        });

        let packet = client.to_send().await;
        assert_eq!(packet.code, EapCode::TerminateLower);
        assert_eq!(client.state, EapClientState::Failed);
    }

    #[tokio::test]
    async fn server_runs_identity_then_method() {
        let mut server = EapServer::new(vec![METHOD_MD5_CHALLENGE], None, None);
        server.open();
        server.up();

        let request = server.to_send().await;
        assert_eq!(request.code, EapCode::Request);
        assert_eq!(request.method, METHOD_IDENTITY);

        server.from_recv(EapPacket {
            code: EapCode::Response,
            id: request.id,
            method: METHOD_IDENTITY,
            data: b"user".to_vec(),
        });
        let request = server.to_send().await;
        assert_eq!(request.method, METHOD_MD5_CHALLENGE);

        server.verdict(2, true);
        let success = server.to_send().await;
        assert_eq!(success.code, EapCode::Success);
        assert!(*server.opened().borrow());
    }

    #[tokio::test]
    async fn server_renegotiates_method_on_nak() {
        let mut server = EapServer::new(vec![METHOD_TLS, METHOD_MD5_CHALLENGE], None, None);
        server.open();
        server.up();
        let _ = server.to_send().await;

        server.from_recv(EapPacket {
            code: EapCode::Response,
            id: 0,
            method: METHOD_IDENTITY,
            data: b"user".to_vec(),
        });
        let request = server.to_send().await;
        assert_eq!(request.method, METHOD_TLS);

        server.from_recv(EapPacket {
            code: EapCode::Response,
            id: 1,
            method: METHOD_NAK,
            data: vec![METHOD_MD5_CHALLENGE],
        });
        let request = server.to_send().await;
        assert_eq!(request.method, METHOD_MD5_CHALLENGE);
        assert_eq!(server.current_method(), METHOD_MD5_CHALLENGE);
    }

    #[tokio::test]
    async fn server_fails_when_no_common_method() {
        let mut server = EapServer::new(vec![METHOD_TLS], None, None);
        server.open();
        server.up();
        let _ = server.to_send().await;

        server.from_recv(EapPacket {
            code: EapCode::Response,
            id: 0,
            method: METHOD_IDENTITY,
            data: b"user".to_vec(),
        });
        let _ = server.to_send().await;

        server.from_recv(EapPacket {
            code: EapCode::Response,
            id: 1,
            method: METHOD_NAK,
            data: vec![METHOD_MD5_CHALLENGE],
        });

        let failure = server.to_send().await;
        assert_eq!(failure.code, EapCode::Failure);
        let teardown = server.to_send().await;
        assert_eq!(teardown.code, EapCode::TerminateLower);
        assert_eq!(server.state, EapServerState::Failed);
    }

    #[test]
    fn framer_passes_small_message_unfragmented() {
        let mut framer = TlsFramer::new(Some(64));
        framer.queue(vec![0x16; 10]);

        let fragment = framer.next_fragment().expect("one fragment");
        assert_eq!(fragment[0], 0);
        assert_eq!(&fragment[1..], &[0x16; 10]);
        assert!(framer.next_fragment().is_none());
    }

    #[test]
    fn framer_fragments_and_reassembles() {
        let message: Vec<u8> = (0u32..2500).map(|b| (b % 256) as u8).collect();

        let mut sender = TlsFramer::new(Some(1000));
        sender.queue(message.clone());

        let mut receiver = TlsFramer::new(None);
        let mut reassembled = None;
        let mut fragments = 0;
        while let Some(fragment) = sender.next_fragment() {
            fragments += 1;
            if fragments == 1 {
                assert_eq!(fragment[0], TLS_FLAG_LENGTH | TLS_FLAG_MORE);
                assert_eq!(
                    u32::from_be_bytes(fragment[1..5].try_into().unwrap()),
                    2500
                );
            }
            reassembled = receiver.push(&fragment).expect("push succeeds");
        }

        assert_eq!(fragments, 3);
        assert_eq!(reassembled, Some(message));
    }

    #[test]
    fn framer_rejects_truncated_length() {
        let mut framer = TlsFramer::new(None);
        assert!(framer.push(&[TLS_FLAG_LENGTH, 0, 0]).is_err());
        assert!(framer.push(&[]).is_err());
    }
}
