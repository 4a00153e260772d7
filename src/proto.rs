//! The generic option negotiation state machine shared by all control
//! protocols, as described in RFC 1661 section 4.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Interval;

use crate::wire::{self, CpFrame, RawOption};
use crate::{Error, Result};

/// A protocol state as described in RFC 1661 section 4.2.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ProtocolState {
    #[default]
    Initial, // Lower layer down, no Open has occured, no restart timer
    Starting,    // Lower layer down, Open initiated, no restart timer; Up triggers Cfg-Req
    Closed,      // Lower layer up, no Open has occured, no restart timer; Cfg-Req triggers Term-Ack
    Stopped, // Lower layer up, Open initiated, no restart timer; Cfg-Req handled, * triggers Term-Ack
    Closing, // Term-Req sent, restart timer running, no Term-Ack received
    Stopping, // Like Closing, but transitions to Stopped, not Closed
    RequestSent, // Cfg-Req sent, no Cfg-Ack (either direction), restart timer running
    AckReceived, // Cfg-Req sent, Cfg-Ack received, no Cfg-Ack sent, restart timer running
    AckSent, // Cfg-Req and Cfg-Ack sent, no Cfg-Ack received, restart timer running
    Opened,  // Cfg-Ack sent and received, no restart timer; this layer is up
}

/// List of valid packet types for `Packet`s.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketType {
    ConfigureRequest,
    ConfigureAck,
    ConfigureNak,
    ConfigureReject,
    TerminateRequest,
    TerminateAck,
    CodeReject,
    ProtocolReject,
    EchoRequest,
    EchoReply,
    DiscardRequest,
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(code: u8) -> Self {
        match code {
            wire::CONFIGURE_REQUEST => Self::ConfigureRequest,
            wire::CONFIGURE_ACK => Self::ConfigureAck,
            wire::CONFIGURE_NAK => Self::ConfigureNak,
            wire::CONFIGURE_REJECT => Self::ConfigureReject,
            wire::TERMINATE_REQUEST => Self::TerminateRequest,
            wire::TERMINATE_ACK => Self::TerminateAck,
            wire::CODE_REJECT => Self::CodeReject,
            wire::PROTOCOL_REJECT => Self::ProtocolReject,
            wire::ECHO_REQUEST => Self::EchoRequest,
            wire::ECHO_REPLY => Self::EchoReply,
            wire::DISCARD_REQUEST => Self::DiscardRequest,
            _ => Self::Unknown(code),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(ty: PacketType) -> Self {
        match ty {
            PacketType::ConfigureRequest => wire::CONFIGURE_REQUEST,
            PacketType::ConfigureAck => wire::CONFIGURE_ACK,
            PacketType::ConfigureNak => wire::CONFIGURE_NAK,
            PacketType::ConfigureReject => wire::CONFIGURE_REJECT,
            PacketType::TerminateRequest => wire::TERMINATE_REQUEST,
            PacketType::TerminateAck => wire::TERMINATE_ACK,
            PacketType::CodeReject => wire::CODE_REJECT,
            PacketType::ProtocolReject => wire::PROTOCOL_REJECT,
            PacketType::EchoRequest => wire::ECHO_REQUEST,
            PacketType::EchoReply => wire::ECHO_REPLY,
            PacketType::DiscardRequest => wire::DISCARD_REQUEST,
            PacketType::Unknown(code) => code,
        }
    }
}

/// A generic PPP option.
pub trait ProtocolOption: Clone + Eq + std::fmt::Debug {
    const PROTOCOL: u16;

    /// The option type code, unique within one configure packet.
    fn kind(&self) -> u8;

    /// Whether this is an option type the protocol does not recognize.
    /// Unknown options are always Reject-class.
    fn is_unknown(&self) -> bool;

    fn to_raw(&self) -> RawOption;
    fn from_raw(raw: RawOption) -> Self;
}

/// A packet that can be a Configure-Request, Configure-Ack, Configure-Nak,
/// Configure-Reject, Terminate-Request, Terminate-Ack, Code-Reject,
/// Protocol-Reject, Echo-Request, Echo-Reply or Discard-Request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet<O: ProtocolOption> {
    pub ty: PacketType,
    pub id: u8,
    pub options: Vec<O>,
    pub rejected_code: PacketType,
    pub rejected_protocol: u16,
}

impl<O: ProtocolOption> Packet<O> {
    pub fn new(ty: PacketType, id: u8) -> Self {
        Self {
            ty,
            id,
            options: Vec::default(),
            rejected_code: PacketType::Unknown(0),
            rejected_protocol: 0,
        }
    }

    pub fn with_options(ty: PacketType, id: u8, options: Vec<O>) -> Self {
        Self {
            ty,
            id,
            options,
            rejected_code: PacketType::Unknown(0),
            rejected_protocol: 0,
        }
    }

    /// Encodes the packet as a wire frame. Echo-Request, Echo-Reply and
    /// Discard-Request carry the local `magic` number.
    pub fn to_frame(&self, magic: u32) -> CpFrame {
        let payload = match self.ty {
            PacketType::ConfigureRequest
            | PacketType::ConfigureAck
            | PacketType::ConfigureNak
            | PacketType::ConfigureReject => {
                let raw: Vec<RawOption> = self.options.iter().map(|opt| opt.to_raw()).collect();
                let mut buf = Vec::new();
                wire::emit_options(&raw, &mut buf);
                buf
            }
            PacketType::TerminateRequest | PacketType::TerminateAck => Vec::default(),
            PacketType::CodeReject => vec![self.rejected_code.into(), self.id],
            PacketType::ProtocolReject => self.rejected_protocol.to_be_bytes().to_vec(),
            PacketType::EchoRequest | PacketType::EchoReply | PacketType::DiscardRequest => {
                magic.to_be_bytes().to_vec()
            }
            PacketType::Unknown(_) => Vec::default(),
        };

        CpFrame::new(self.ty.into(), self.id, payload)
    }

    /// Decodes a wire frame into a packet. The magic number of Echo and
    /// Discard packets is not retained here; callers that care about
    /// loopback detection inspect the frame payload first.
    pub fn from_frame(frame: CpFrame) -> Result<Self> {
        let ty = PacketType::from(frame.code);
        let mut packet = Packet::new(ty, frame.identifier);

        match ty {
            PacketType::ConfigureRequest
            | PacketType::ConfigureAck
            | PacketType::ConfigureNak
            | PacketType::ConfigureReject => {
                packet.options = wire::parse_options(&frame.payload)?
                    .into_iter()
                    .map(O::from_raw)
                    .collect();
            }
            PacketType::CodeReject => {
                packet.rejected_code = frame
                    .payload
                    .first()
                    .copied()
                    .map(PacketType::from)
                    .unwrap_or(PacketType::Unknown(0));
            }
            PacketType::ProtocolReject => {
                if frame.payload.len() < 2 {
                    return Err(Error::Truncated {
                        want: 2,
                        got: frame.payload.len(),
                    });
                }
                packet.rejected_protocol = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
            }
            PacketType::EchoRequest | PacketType::EchoReply | PacketType::DiscardRequest => {
                if frame.payload.len() < 4 {
                    return Err(Error::Truncated {
                        want: 4,
                        got: frame.payload.len(),
                    });
                }
            }
            PacketType::TerminateRequest | PacketType::TerminateAck | PacketType::Unknown(_) => {}
        }

        Ok(packet)
    }
}

/// Negotiation characteristics of a [`NegotiationProtocol`].
#[derive(Clone, Debug)]
pub struct ProtocolConfig<O: ProtocolOption> {
    /// Options to require the peer to set including a suggestion.
    pub require: Vec<O>,
    /// Options not to accept under any circumstances.
    pub deny: Vec<O>,
    /// Options not to accept if they have a listed value,
    /// paired with the counter-proposal to make.
    pub deny_exact: Vec<(O, O)>,

    /// Options to request initially.
    pub request: Vec<O>,
    /// Options not to accept suggestions for under any circumstances.
    pub refuse: Vec<O>,
    /// Options not to accept the listed suggestion values for.
    pub refuse_exact: Vec<O>,

    /// Whether unknown protocol numbers reported by the supervisor
    /// trigger a Protocol-Reject via this protocol. Only true for LCP.
    pub need_protocol_reject: bool,

    /// The retransmission interval, default is 3 seconds.
    pub restart_interval: Option<Duration>,
    /// The maximum number of Terminate-Requests to retransmit, default is 2.
    pub max_terminate: Option<u32>,
    /// The maximum number of Configure-Requests to retransmit, default is 10.
    pub max_configure: Option<u32>,
    /// The maximum number of Configure-Naks to reply with before resorting
    /// to Configure-Reject, default is 5.
    pub max_failure: Option<u32>,
}

/// A sub-protocol that implements the PPP Option Negotiation mechanism
/// as per RFC 1661 section 4. Used to manage individual protocols.
#[derive(Debug)]
pub struct NegotiationProtocol<O: ProtocolOption> {
    require: Vec<O>,
    deny: Vec<O>,
    deny_exact: Vec<(O, O)>,
    request: Vec<O>, // mutated during negotiation
    refuse: Vec<O>,
    refuse_exact: Vec<O>,

    need_protocol_reject: bool,

    peer: Vec<O>, // peer options we have acked

    state: ProtocolState,

    restart_timer: Interval,
    restart_counter: u32,

    max_terminate: u32,
    max_configure: u32,
    max_failure: u32,
    failure_count: u32,

    id_cfg: u8,
    id_term: u8,

    output_tx: mpsc::UnboundedSender<Packet<O>>,
    output_rx: mpsc::UnboundedReceiver<Packet<O>>,

    // True while this layer is up (tlu..tld).
    upper_status_tx: watch::Sender<bool>,
    upper_status_rx: watch::Receiver<bool>,

    // True while this layer is started (tls..tlf). A transition to false
    // reports a finished (failed or terminated) protocol to the supervisor.
    lower_status_tx: watch::Sender<bool>,
    lower_status_rx: watch::Receiver<bool>,
}

impl<O: ProtocolOption> NegotiationProtocol<O> {
    /// Creates a new `NegotiationProtocol` with the characteristics
    /// described by the [`ProtocolConfig`].
    ///
    /// You must start calling the [`NegotiationProtocol::to_send`] method
    /// before calling the [`NegotiationProtocol::up`] method
    /// and keep calling it until [`NegotiationProtocol::close`]
    /// and [`NegotiationProtocol::down`] have been issued.
    pub fn new(config: ProtocolConfig<O>) -> Self {
        let restart_timer = tokio::time::interval(
            config.restart_interval.unwrap_or(Duration::from_secs(3)),
        );
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (upper_status_tx, upper_status_rx) = watch::channel(false);
        let (lower_status_tx, lower_status_rx) = watch::channel(false);

        Self {
            require: config.require,
            deny: config.deny,
            deny_exact: config.deny_exact,
            request: config.request,
            refuse: config.refuse,
            refuse_exact: config.refuse_exact,

            need_protocol_reject: config.need_protocol_reject,

            peer: Vec::default(),

            state: ProtocolState::default(),

            restart_timer,
            restart_counter: 0,

            max_terminate: config.max_terminate.unwrap_or(2),
            max_configure: config.max_configure.unwrap_or(10),
            max_failure: config.max_failure.unwrap_or(5),
            failure_count: 0,

            id_cfg: 0,
            id_term: 0,

            output_tx,
            output_rx,

            upper_status_tx,
            upper_status_rx,

            lower_status_tx,
            lower_status_rx,
        }
    }

    /// The options we most recently requested. Once the protocol has
    /// reached `Opened` these are the options the peer has acknowledged.
    pub fn our_options(&self) -> &[O] {
        &self.request
    }

    /// The peer options we have acknowledged.
    pub fn peer_options(&self) -> &[O] {
        &self.peer
    }

    /// Whether unknown protocol numbers are reported via this protocol.
    pub fn handles_protocol_reject(&self) -> bool {
        self.need_protocol_reject
    }

    /// Replaces the same-type option in our request, or appends it.
    /// Used by the supervisor to renew the magic number after a loopback.
    pub fn update_request(&mut self, option: O) {
        match self
            .request
            .iter_mut()
            .find(|ours| ours.kind() == option.kind())
        {
            Some(ours) => *ours = option,
            None => self.request.push(option),
        }
    }

    /// Returns a watch channel receiver that can be used to monitor whether
    /// the protocol is in the `Opened` state and available for
    /// upper layers to use.
    pub fn opened(&self) -> watch::Receiver<bool> {
        self.upper_status_rx.clone()
    }

    /// Returns a watch channel receiver that can be used to monitor whether
    /// the protocol is still started. A transition to `false` reports
    /// a finished protocol: negotiation failure, rejection by the peer
    /// or completed termination.
    pub fn active(&self) -> watch::Receiver<bool> {
        self.lower_status_rx.clone()
    }

    /// Waits for and returns the next packet to send.
    pub async fn to_send(&mut self) -> Packet<O> {
        loop {
            tokio::select! {
                packet = self.output_rx.recv() => return packet.expect("output channel is closed"),
                _ = self.restart_timer.tick() => {
                    // The timer is only meaningful in the five timed states.
                    // Anywhere else the tick is stale and ignored.
                    if !self.timer_armed() { continue; }

                    if self.restart_counter > 0 {
                        if let Some(packet) = self.timeout_positive() { return packet; }
                    } else {
                        self.timeout_negative();
                    }
                }
            }
        }
    }

    /// Feeds a packet into the state machine for processing.
    /// Can trigger the RCR, RCA, RCN, RCJ, RTR, RTA, RUC, RXJ or RXR events.
    ///
    /// Configure-Ack, Configure-Nak, Configure-Reject and Terminate-Ack
    /// packets whose identifier does not match the outstanding request
    /// are stale duplicates and are discarded without effect.
    pub fn from_recv(&mut self, packet: Packet<O>) {
        match packet.ty {
            PacketType::ConfigureRequest => self.rcr(packet),
            PacketType::ConfigureAck => {
                if packet.id == self.id_cfg {
                    self.rca();
                }
            }
            PacketType::ConfigureNak => {
                if packet.id == self.id_cfg {
                    self.rcn(&packet.options);
                }
            }
            PacketType::ConfigureReject => {
                if packet.id == self.id_cfg {
                    self.rcj(&packet.options);
                }
            }
            PacketType::TerminateRequest => self.rtr(packet.id),
            PacketType::TerminateAck => {
                if packet.id == self.id_term {
                    self.rta();
                }
            }
            PacketType::CodeReject => match packet.rejected_code {
                // Rejection of codes the protocol cannot work without.
                PacketType::ConfigureRequest
                | PacketType::ConfigureAck
                | PacketType::ConfigureNak
                | PacketType::ConfigureReject
                | PacketType::TerminateRequest
                | PacketType::TerminateAck
                | PacketType::Unknown(_) => self.rxj_negative(),
                _ => self.rxj_positive(),
            },
            PacketType::ProtocolReject => {
                if packet.rejected_protocol == O::PROTOCOL {
                    self.rxj_negative();
                }
            }
            PacketType::EchoRequest => self.rxr(packet.id),
            PacketType::EchoReply | PacketType::DiscardRequest => {}
            PacketType::Unknown(code) => self.ruc(packet.id, code),
        }
    }

    /// Signals to the state machine that the lower layer is now up.
    /// This is equivalent to the Up event.
    pub fn up(&mut self) {
        match self.state {
            ProtocolState::Initial => self.state = ProtocolState::Closed,
            ProtocolState::Starting => {
                self.irc(self.max_configure);
                self.send_configure_request(true);

                self.state = ProtocolState::RequestSent;
            }
            ProtocolState::Closed
            | ProtocolState::Stopped
            | ProtocolState::Closing
            | ProtocolState::Stopping
            | ProtocolState::RequestSent
            | ProtocolState::AckReceived
            | ProtocolState::AckSent
            | ProtocolState::Opened => {} // illegal
        }
    }

    /// Signals to the state machine that the lower layer is now down.
    /// This is equivalent to the Down event.
    pub fn down(&mut self) {
        match self.state {
            ProtocolState::Initial | ProtocolState::Starting => {} // illegal
            ProtocolState::Closed => self.state = ProtocolState::Initial,
            ProtocolState::Stopped => {
                self.set_active(true);
                self.state = ProtocolState::Starting;
            }
            ProtocolState::Closing => self.state = ProtocolState::Initial,
            ProtocolState::Stopping
            | ProtocolState::RequestSent
            | ProtocolState::AckReceived
            | ProtocolState::AckSent => self.state = ProtocolState::Starting,
            ProtocolState::Opened => {
                self.set_opened(false);
                self.state = ProtocolState::Starting;
            }
        }
    }

    /// Issues an administrative open, allowing the protocol to start
    /// negotiation. This is equivalent to the Open event.
    pub fn open(&mut self) {
        match self.state {
            ProtocolState::Initial => {
                self.set_active(true);
                self.state = ProtocolState::Starting;
            }
            ProtocolState::Starting => {}
            ProtocolState::Closed => {
                self.irc(self.max_configure);
                self.send_configure_request(true);

                self.state = ProtocolState::RequestSent;
            }
            ProtocolState::Stopped => {}
            ProtocolState::Closing => self.state = ProtocolState::Stopping,
            ProtocolState::Stopping
            | ProtocolState::RequestSent
            | ProtocolState::AckReceived
            | ProtocolState::AckSent
            | ProtocolState::Opened => {}
        }
    }

    /// Issues an administrative close, gracefully shutting down the protocol.
    /// This is equivalent to the Close event. From any state the protocol
    /// eventually settles in `Closed`, bounded by the terminate retry limit.
    pub fn close(&mut self) {
        match self.state {
            ProtocolState::Initial => {}
            ProtocolState::Starting => {
                self.set_active(false);
                self.state = ProtocolState::Initial;
            }
            ProtocolState::Closed => {}
            ProtocolState::Stopped => self.state = ProtocolState::Closed,
            ProtocolState::Closing => {}
            ProtocolState::Stopping => self.state = ProtocolState::Closing,
            ProtocolState::RequestSent
            | ProtocolState::AckReceived
            | ProtocolState::AckSent => {
                self.irc(self.max_terminate);
                self.send_terminate_request(true);

                self.state = ProtocolState::Closing;
            }
            ProtocolState::Opened => {
                self.set_opened(false);

                self.irc(self.max_terminate);
                self.send_terminate_request(true);

                self.state = ProtocolState::Closing;
            }
        }
    }

    fn timer_armed(&self) -> bool {
        matches!(
            self.state,
            ProtocolState::Closing
                | ProtocolState::Stopping
                | ProtocolState::RequestSent
                | ProtocolState::AckReceived
                | ProtocolState::AckSent
        )
    }

    fn timeout_positive(&mut self) -> Option<Packet<O>> {
        self.restart_counter -= 1;

        match self.state {
            ProtocolState::Closing | ProtocolState::Stopping => Some(Packet::new(
                PacketType::TerminateRequest,
                self.id_term, // retransmission keeps the identifier
            )),
            ProtocolState::RequestSent
            | ProtocolState::AckReceived
            | ProtocolState::AckSent => Some(Packet::with_options(
                PacketType::ConfigureRequest,
                self.id_cfg,
                self.request.clone(),
            )),
            _ => None, // unreachable, checked by timer_armed
        }
    }

    fn timeout_negative(&mut self) {
        match self.state {
            ProtocolState::Closing => {
                self.set_active(false);
                self.state = ProtocolState::Closed;
            }
            ProtocolState::Stopping => {
                self.set_active(false);
                self.state = ProtocolState::Stopped;
            }
            // Configure retry count exceeded: fatal negotiation failure,
            // reported upward via the active watch channel.
            ProtocolState::RequestSent
            | ProtocolState::AckReceived
            | ProtocolState::AckSent => {
                self.set_active(false);
                self.state = ProtocolState::Stopped;
            }
            _ => {} // unreachable, checked by timer_armed
        }
    }

    fn rcr(&mut self, packet: Packet<O>) {
        match self.state {
            ProtocolState::Initial | ProtocolState::Starting => {} // illegal, lower layer is down
            // The protocol has not been told to start (or has finished):
            // answer with a Terminate-Ack instead of negotiating.
            ProtocolState::Closed | ProtocolState::Stopped => self.send_terminate_ack(packet.id),
            ProtocolState::Closing | ProtocolState::Stopping => {}
            ProtocolState::RequestSent => {
                if self.reply(packet.id, &packet.options) {
                    self.state = ProtocolState::AckSent;
                }
            }
            ProtocolState::AckReceived => {
                if self.reply(packet.id, &packet.options) {
                    self.set_opened(true);
                    self.state = ProtocolState::Opened;
                }
            }
            ProtocolState::AckSent => {
                if !self.reply(packet.id, &packet.options) {
                    self.state = ProtocolState::RequestSent;
                }
            }
            ProtocolState::Opened => {
                self.set_opened(false);

                self.irc(self.max_configure);
                self.send_configure_request(true);
                if self.reply(packet.id, &packet.options) {
                    self.state = ProtocolState::AckSent;
                } else {
                    self.state = ProtocolState::RequestSent;
                }
            }
        }
    }

    fn rca(&mut self) {
        match self.state {
            ProtocolState::Initial | ProtocolState::Starting => {} // illegal
            ProtocolState::Closed | ProtocolState::Stopped => self.send_terminate_ack(self.id_cfg),
            ProtocolState::Closing | ProtocolState::Stopping => {}
            ProtocolState::RequestSent => {
                self.irc(self.max_configure);
                self.state = ProtocolState::AckReceived;
            }
            ProtocolState::AckReceived => {
                // Crossed connection, restart the exchange.
                self.send_configure_request(true);
                self.state = ProtocolState::RequestSent;
            }
            ProtocolState::AckSent => {
                self.irc(self.max_configure);
                self.set_opened(true);
                self.state = ProtocolState::Opened;
            }
            ProtocolState::Opened => {
                self.set_opened(false);
                self.irc(self.max_configure);
                self.send_configure_request(true);
                self.state = ProtocolState::RequestSent;
            }
        }
    }

    fn rcn(&mut self, suggestions: &[O]) {
        match self.state {
            ProtocolState::Initial | ProtocolState::Starting => {} // illegal
            ProtocolState::Closed | ProtocolState::Stopped => self.send_terminate_ack(self.id_cfg),
            ProtocolState::Closing | ProtocolState::Stopping => {}
            ProtocolState::RequestSent => {
                self.irc(self.max_configure);
                self.revise_nak(suggestions);
                self.send_configure_request(true);
            }
            ProtocolState::AckReceived => {
                self.revise_nak(suggestions);
                self.send_configure_request(true);
                self.state = ProtocolState::RequestSent;
            }
            ProtocolState::AckSent => {
                self.irc(self.max_configure);
                self.revise_nak(suggestions);
                self.send_configure_request(true);
            }
            ProtocolState::Opened => {
                self.set_opened(false);
                self.irc(self.max_configure);
                self.revise_nak(suggestions);
                self.send_configure_request(true);
                self.state = ProtocolState::RequestSent;
            }
        }
    }

    fn rcj(&mut self, rejected: &[O]) {
        match self.state {
            ProtocolState::Initial | ProtocolState::Starting => {} // illegal
            ProtocolState::Closed | ProtocolState::Stopped => self.send_terminate_ack(self.id_cfg),
            ProtocolState::Closing | ProtocolState::Stopping => {}
            ProtocolState::RequestSent => {
                self.irc(self.max_configure);
                self.revise_reject(rejected);
                self.send_configure_request(true);
            }
            ProtocolState::AckReceived => {
                self.revise_reject(rejected);
                self.send_configure_request(true);
                self.state = ProtocolState::RequestSent;
            }
            ProtocolState::AckSent => {
                self.irc(self.max_configure);
                self.revise_reject(rejected);
                self.send_configure_request(true);
            }
            ProtocolState::Opened => {
                self.set_opened(false);
                self.irc(self.max_configure);
                self.revise_reject(rejected);
                self.send_configure_request(true);
                self.state = ProtocolState::RequestSent;
            }
        }
    }

    fn rtr(&mut self, id: u8) {
        match self.state {
            ProtocolState::Initial | ProtocolState::Starting => {} // illegal
            ProtocolState::Closed
            | ProtocolState::Stopped
            | ProtocolState::Closing
            | ProtocolState::Stopping => self.send_terminate_ack(id),
            ProtocolState::RequestSent
            | ProtocolState::AckReceived
            | ProtocolState::AckSent => {
                self.send_terminate_ack(id);
                self.state = ProtocolState::RequestSent;
            }
            ProtocolState::Opened => {
                self.set_opened(false);

                // Zero the restart counter so the peer has one interval
                // to send its own final Terminate-Ack before we finish.
                self.restart_counter = 0;
                self.restart_timer.reset();

                self.send_terminate_ack(id);
                self.state = ProtocolState::Stopping;
            }
        }
    }

    fn rta(&mut self) {
        match self.state {
            ProtocolState::Initial | ProtocolState::Starting => {} // illegal
            ProtocolState::Closed | ProtocolState::Stopped => {}
            ProtocolState::Closing => {
                self.set_active(false);
                self.state = ProtocolState::Closed;
            }
            ProtocolState::Stopping => {
                self.set_active(false);
                self.state = ProtocolState::Stopped;
            }
            ProtocolState::RequestSent => {}
            ProtocolState::AckReceived => self.state = ProtocolState::RequestSent,
            ProtocolState::AckSent => {}
            ProtocolState::Opened => {
                self.set_opened(false);
                self.irc(self.max_configure);
                self.send_configure_request(true);
                self.state = ProtocolState::RequestSent;
            }
        }
    }

    fn ruc(&mut self, id: u8, code: u8) {
        // Malformed or unknown codes never alter protocol state.
        let mut packet = Packet::new(PacketType::CodeReject, id);
        packet.rejected_code = PacketType::Unknown(code);

        self.output(packet);
    }

    fn rxj_positive(&mut self) {
        if self.state == ProtocolState::AckReceived {
            self.state = ProtocolState::RequestSent;
        }
    }

    fn rxj_negative(&mut self) {
        match self.state {
            ProtocolState::Initial | ProtocolState::Starting => {} // illegal
            ProtocolState::Closed | ProtocolState::Stopped => self.set_active(false),
            ProtocolState::Closing => {
                self.set_active(false);
                self.state = ProtocolState::Closed;
            }
            ProtocolState::Stopping => {
                self.set_active(false);
                self.state = ProtocolState::Stopped;
            }
            ProtocolState::RequestSent
            | ProtocolState::AckReceived
            | ProtocolState::AckSent => {
                self.set_active(false);
                self.state = ProtocolState::Stopped;
            }
            ProtocolState::Opened => {
                self.set_opened(false);

                self.irc(self.max_terminate);
                self.send_terminate_request(true);
                self.state = ProtocolState::Stopping;
            }
        }
    }

    fn rxr(&mut self, id: u8) {
        // Echo-Requests are only answered in the Opened state.
        if self.state == ProtocolState::Opened {
            self.output(Packet::new(PacketType::EchoReply, id));
        }
    }

    /// Classifies the peer's proposed options and replies with exactly one
    /// of Configure-Ack, Configure-Nak or Configure-Reject, Reject winning
    /// over Nak. Returns whether the options were acked.
    fn reply(&mut self, id: u8, options: &[O]) -> bool {
        let mut nak = Vec::new();
        // The peer's own options behind the counter-proposals. A
        // Configure-Reject may only carry options copied from the request.
        let mut nak_present = Vec::new();
        let mut reject = Vec::new();

        for option in options {
            if option.is_unknown() || self.deny.iter().any(|d| d.kind() == option.kind()) {
                reject.push(option.clone());
            } else if let Some((_, suggestion)) = self
                .deny_exact
                .iter()
                .find(|(bad, _)| bad == option)
            {
                nak.push(suggestion.clone());
                nak_present.push(option.clone());
            }
        }

        for required in &self.require {
            if !options.iter().any(|option| option.kind() == required.kind()) {
                nak.push(required.clone());
            }
        }

        if !reject.is_empty() {
            self.output(Packet::with_options(PacketType::ConfigureReject, id, reject));
            false
        } else if !nak.is_empty() {
            if self.failure_count >= self.max_failure && !nak_present.is_empty() {
                // The peer keeps ignoring our counter-proposals; reject
                // its offending options outright to force convergence.
                // Absent required options cannot be rejected and keep
                // drawing a Configure-Nak instead.
                self.output(Packet::with_options(
                    PacketType::ConfigureReject,
                    id,
                    nak_present,
                ));
            } else {
                self.failure_count += 1;
                self.output(Packet::with_options(PacketType::ConfigureNak, id, nak));
            }
            false
        } else {
            self.peer = options.to_vec();
            self.output(Packet::with_options(
                PacketType::ConfigureAck,
                id,
                options.to_vec(),
            ));
            true
        }
    }

    /// Adjusts our request toward the peer's counter-proposals,
    /// except for options we refuse suggestions for.
    fn revise_nak(&mut self, suggestions: &[O]) {
        for suggestion in suggestions {
            if self
                .refuse
                .iter()
                .any(|ours| ours.kind() == suggestion.kind())
                || self.refuse_exact.iter().any(|bad| bad == suggestion)
            {
                continue;
            }

            match self
                .request
                .iter_mut()
                .find(|ours| ours.kind() == suggestion.kind())
            {
                Some(ours) => *ours = suggestion.clone(),
                // The peer asks us to negotiate an option we omitted.
                None => {
                    if !suggestion.is_unknown() {
                        self.request.push(suggestion.clone());
                    }
                }
            }
        }
    }

    /// Drops rejected options from our request entirely.
    fn revise_reject(&mut self, rejected: &[O]) {
        self.request
            .retain(|ours| !rejected.iter().any(|bad| bad.kind() == ours.kind()));
    }

    fn irc(&mut self, count: u32) {
        self.restart_timer.reset();
        self.restart_counter = count;
        self.failure_count = 0;
    }

    fn send_configure_request(&mut self, fresh_id: bool) {
        if fresh_id {
            self.id_cfg = self.id_cfg.wrapping_add(1);
        }

        self.restart_counter = self.restart_counter.saturating_sub(1);
        self.output(Packet::with_options(
            PacketType::ConfigureRequest,
            self.id_cfg,
            self.request.clone(),
        ));
    }

    fn send_terminate_request(&mut self, fresh_id: bool) {
        if fresh_id {
            self.id_term = self.id_term.wrapping_add(1);
        }

        self.restart_counter = self.restart_counter.saturating_sub(1);
        self.output(Packet::new(PacketType::TerminateRequest, self.id_term));
    }

    fn send_terminate_ack(&mut self, id: u8) {
        self.output(Packet::new(PacketType::TerminateAck, id));
    }

    fn output(&mut self, packet: Packet<O>) {
        self.output_tx
            .send(packet)
            .expect("output channel is closed");
    }

    fn set_opened(&mut self, value: bool) {
        self.upper_status_tx.send_if_modified(|current| {
            let modified = *current != value;
            *current = value;
            modified
        });
    }

    fn set_active(&mut self, value: bool) {
        self.lower_status_tx.send_if_modified(|current| {
            let modified = *current != value;
            *current = value;
            modified
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Eq, PartialEq)]
    enum TestOpt {
        Speed(u8),
        Token(u32),
        Unhandled(RawOption),
    }

    impl ProtocolOption for TestOpt {
        const PROTOCOL: u16 = 0xc021;

        fn kind(&self) -> u8 {
            match self {
                Self::Speed(_) => 1,
                Self::Token(_) => 5,
                Self::Unhandled(raw) => raw.kind,
            }
        }

        fn is_unknown(&self) -> bool {
            matches!(self, Self::Unhandled(..))
        }

        fn to_raw(&self) -> RawOption {
            match self {
                Self::Speed(speed) => RawOption::new(1, vec![*speed]),
                Self::Token(token) => RawOption::new(5, token.to_be_bytes().to_vec()),
                Self::Unhandled(raw) => raw.clone(),
            }
        }

        fn from_raw(raw: RawOption) -> Self {
            match (raw.kind, raw.value.len()) {
                (1, 1) => Self::Speed(raw.value[0]),
                (5, 4) => Self::Token(u32::from_be_bytes([
                    raw.value[0],
                    raw.value[1],
                    raw.value[2],
                    raw.value[3],
                ])),
                _ => Self::Unhandled(raw),
            }
        }
    }

    fn proto() -> NegotiationProtocol<TestOpt> {
        NegotiationProtocol::new(ProtocolConfig {
            require: vec![],
            deny: vec![],
            deny_exact: vec![(TestOpt::Token(0), TestOpt::Token(99))],
            request: vec![TestOpt::Speed(9), TestOpt::Token(42)],
            refuse: vec![],
            refuse_exact: vec![],
            need_protocol_reject: false,
            restart_interval: None,
            max_terminate: None,
            max_configure: None,
            max_failure: None,
        })
    }

    fn drain(proto: &mut NegotiationProtocol<TestOpt>) -> Vec<Packet<TestOpt>> {
        let mut packets = Vec::new();
        while let Ok(packet) = proto.output_rx.try_recv() {
            packets.push(packet);
        }
        packets
    }

    /// Every (state, event) pair has a defined transition that leaves the
    /// machine in one of the ten states without panicking.
    #[tokio::test]
    async fn transition_table_is_total() {
        let states = [
            ProtocolState::Initial,
            ProtocolState::Starting,
            ProtocolState::Closed,
            ProtocolState::Stopped,
            ProtocolState::Closing,
            ProtocolState::Stopping,
            ProtocolState::RequestSent,
            ProtocolState::AckReceived,
            ProtocolState::AckSent,
            ProtocolState::Opened,
        ];

        let packet_types = [
            PacketType::ConfigureRequest,
            PacketType::ConfigureAck,
            PacketType::ConfigureNak,
            PacketType::ConfigureReject,
            PacketType::TerminateRequest,
            PacketType::TerminateAck,
            PacketType::CodeReject,
            PacketType::ProtocolReject,
            PacketType::EchoRequest,
            PacketType::EchoReply,
            PacketType::DiscardRequest,
            PacketType::Unknown(0x42),
        ];

        for state in &states {
            for ty in &packet_types {
                let mut p = proto();
                p.state = state.clone();

                let mut packet = Packet::with_options(*ty, p.id_cfg, vec![TestOpt::Speed(9)]);
                packet.rejected_code = PacketType::ConfigureRequest;
                packet.rejected_protocol = TestOpt::PROTOCOL;
                p.from_recv(packet);
            }

            for event in 0..6 {
                let mut p = proto();
                p.state = state.clone();
                match event {
                    0 => p.up(),
                    1 => p.down(),
                    2 => p.open(),
                    3 => p.close(),
                    4 => {
                        p.restart_counter = 1;
                        let _ = p.timeout_positive();
                    }
                    _ => p.timeout_negative(),
                }
            }
        }
    }

    #[tokio::test]
    async fn stale_configure_ack_is_discarded() {
        let mut p = proto();
        p.open();
        p.up();
        assert_eq!(p.state, ProtocolState::RequestSent);
        drain(&mut p);

        let stale = Packet::new(PacketType::ConfigureAck, p.id_cfg.wrapping_add(1));
        p.from_recv(stale);

        assert_eq!(p.state, ProtocolState::RequestSent);
        assert!(drain(&mut p).is_empty());
    }

    #[tokio::test]
    async fn configure_request_in_closed_elicits_terminate_ack() {
        let mut p = proto();
        p.up(); // Initial -> Closed, no Open has occured

        p.from_recv(Packet::with_options(
            PacketType::ConfigureRequest,
            7,
            vec![TestOpt::Speed(9)],
        ));

        let packets = drain(&mut p);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::TerminateAck);
        assert_eq!(packets[0].id, 7);
        assert_eq!(p.state, ProtocolState::Closed);
    }

    #[tokio::test]
    async fn configure_request_in_stopped_elicits_terminate_ack() {
        let mut p = proto();
        p.state = ProtocolState::Stopped;

        p.from_recv(Packet::with_options(
            PacketType::ConfigureRequest,
            8,
            vec![TestOpt::Speed(9)],
        ));

        let packets = drain(&mut p);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::TerminateAck);
        assert_eq!(p.state, ProtocolState::Stopped);
    }

    #[tokio::test]
    async fn open_up_then_ack_exchange_reaches_opened() {
        let mut p = proto();
        p.open();
        assert_eq!(p.state, ProtocolState::Starting);
        p.up();
        assert_eq!(p.state, ProtocolState::RequestSent);

        let packets = drain(&mut p);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::ConfigureRequest);
        assert_eq!(packets[0].options, vec![TestOpt::Speed(9), TestOpt::Token(42)]);

        // Peer acks our request.
        p.from_recv(Packet::new(PacketType::ConfigureAck, p.id_cfg));
        assert_eq!(p.state, ProtocolState::AckReceived);

        // Peer sends an agreeable request of its own.
        p.from_recv(Packet::with_options(
            PacketType::ConfigureRequest,
            3,
            vec![TestOpt::Speed(5)],
        ));
        assert_eq!(p.state, ProtocolState::Opened);
        assert!(*p.opened().borrow());
        assert_eq!(p.peer_options(), [TestOpt::Speed(5)]);

        let packets = drain(&mut p);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::ConfigureAck);
        assert_eq!(packets[0].id, 3);
    }

    #[tokio::test]
    async fn unknown_option_is_rejected_not_naked() {
        let mut p = proto();
        p.open();
        p.up();
        drain(&mut p);

        p.from_recv(Packet::with_options(
            PacketType::ConfigureRequest,
            1,
            vec![
                TestOpt::Speed(9),
                TestOpt::Unhandled(RawOption::new(0x7f, vec![1])),
                TestOpt::Token(0), // deny_exact value, but Reject wins over Nak
            ],
        ));

        let packets = drain(&mut p);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::ConfigureReject);
        assert_eq!(
            packets[0].options,
            vec![TestOpt::Unhandled(RawOption::new(0x7f, vec![1]))]
        );
        assert_eq!(p.state, ProtocolState::RequestSent);
    }

    #[tokio::test]
    async fn denied_value_is_naked_with_counter_proposal() {
        let mut p = proto();
        p.open();
        p.up();
        drain(&mut p);

        p.from_recv(Packet::with_options(
            PacketType::ConfigureRequest,
            1,
            vec![TestOpt::Token(0)],
        ));

        let packets = drain(&mut p);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::ConfigureNak);
        assert_eq!(packets[0].options, vec![TestOpt::Token(99)]);
    }

    #[tokio::test]
    async fn nak_escalation_rejects_only_peer_sent_options() {
        let mut p = NegotiationProtocol::new(ProtocolConfig {
            require: vec![TestOpt::Speed(9)],
            deny: vec![],
            deny_exact: vec![(TestOpt::Token(0), TestOpt::Token(99))],
            request: vec![TestOpt::Speed(9)],
            refuse: vec![],
            refuse_exact: vec![],
            need_protocol_reject: false,
            restart_interval: None,
            max_terminate: None,
            max_configure: None,
            max_failure: Some(2),
        });
        p.open();
        p.up();
        drain(&mut p);

        // The peer insists on the denied value and omits the required option.
        for id in 1..=2 {
            p.from_recv(Packet::with_options(
                PacketType::ConfigureRequest,
                id,
                vec![TestOpt::Token(0)],
            ));
            let packets = drain(&mut p);
            assert_eq!(packets.len(), 1);
            assert_eq!(packets[0].ty, PacketType::ConfigureNak);
            assert_eq!(
                packets[0].options,
                vec![TestOpt::Token(99), TestOpt::Speed(9)]
            );
        }

        // Counter-proposals exhausted: the reply escalates to Reject, but
        // carries only options copied from the peer's request.
        p.from_recv(Packet::with_options(
            PacketType::ConfigureRequest,
            3,
            vec![TestOpt::Token(0)],
        ));
        let packets = drain(&mut p);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::ConfigureReject);
        assert_eq!(packets[0].options, vec![TestOpt::Token(0)]);

        // An absent required option alone can never be rejected.
        p.from_recv(Packet::with_options(PacketType::ConfigureRequest, 4, vec![]));
        let packets = drain(&mut p);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::ConfigureNak);
        assert_eq!(packets[0].options, vec![TestOpt::Speed(9)]);
    }

    #[tokio::test]
    async fn reject_drops_option_from_request() {
        let mut p = proto();
        p.open();
        p.up();
        drain(&mut p);

        p.from_recv(Packet::with_options(
            PacketType::ConfigureReject,
            p.id_cfg,
            vec![TestOpt::Token(42)],
        ));

        assert_eq!(p.our_options(), [TestOpt::Speed(9)]);

        let packets = drain(&mut p);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::ConfigureRequest);
        assert_eq!(packets[0].options, vec![TestOpt::Speed(9)]);
    }

    #[tokio::test]
    async fn nak_adjusts_request_toward_suggestion() {
        let mut p = proto();
        p.open();
        p.up();
        drain(&mut p);

        p.from_recv(Packet::with_options(
            PacketType::ConfigureNak,
            p.id_cfg,
            vec![TestOpt::Speed(3)],
        ));

        assert!(p.our_options().contains(&TestOpt::Speed(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn configure_retry_exhaustion_is_fatal() {
        let mut p = NegotiationProtocol::new(ProtocolConfig {
            require: vec![],
            deny: vec![],
            deny_exact: vec![],
            request: vec![TestOpt::Speed(9)],
            refuse: vec![],
            refuse_exact: vec![],
            need_protocol_reject: false,
            restart_interval: Some(Duration::from_millis(10)),
            max_terminate: None,
            max_configure: Some(3),
            max_failure: None,
        });
        let mut active = p.active();

        p.open();
        p.up();

        // Initial request plus retransmissions until the counter runs out.
        for _ in 0..3 {
            let packet = p.to_send().await;
            assert_eq!(packet.ty, PacketType::ConfigureRequest);
        }

        let fatal = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                tokio::select! {
                    _ = p.to_send() => {}
                    result = active.changed() => {
                        result.unwrap();
                        if !*active.borrow_and_update() { break; }
                    }
                }
            }
        })
        .await;

        assert!(fatal.is_ok(), "retry exhaustion was not reported");
        assert_eq!(p.state, ProtocolState::Stopped);
    }

    #[tokio::test]
    async fn echo_request_answered_only_in_opened() {
        let mut p = proto();
        p.open();
        p.up();
        drain(&mut p);

        p.from_recv(Packet::new(PacketType::EchoRequest, 9));
        assert!(drain(&mut p).is_empty());

        p.state = ProtocolState::Opened;
        p.from_recv(Packet::new(PacketType::EchoRequest, 9));

        let packets = drain(&mut p);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::EchoReply);
        assert_eq!(packets[0].id, 9);
    }

    #[tokio::test]
    async fn unknown_code_elicits_code_reject_without_state_change() {
        let mut p = proto();
        p.open();
        p.up();
        drain(&mut p);

        p.from_recv(Packet::new(PacketType::Unknown(0x2a), 4));

        let packets = drain(&mut p);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].ty, PacketType::CodeReject);
        assert_eq!(packets[0].rejected_code, PacketType::Unknown(0x2a));
        assert_eq!(p.state, ProtocolState::RequestSent);
    }

    #[tokio::test]
    async fn protocol_reject_for_own_protocol_is_fatal() {
        let mut p = proto();
        p.open();
        p.up();
        drain(&mut p);

        let mut packet = Packet::new(PacketType::ProtocolReject, 1);
        packet.rejected_protocol = TestOpt::PROTOCOL;
        p.from_recv(packet);

        assert_eq!(p.state, ProtocolState::Stopped);
        assert!(!*p.active().borrow());
    }

    #[test]
    fn frame_conversion_round_trip() {
        let packet = Packet::with_options(
            PacketType::ConfigureRequest,
            0x11,
            vec![TestOpt::Speed(9), TestOpt::Token(42)],
        );

        let frame = packet.to_frame(0);
        let mut buf = Vec::new();
        frame.serialize(&mut buf);

        let parsed: Packet<TestOpt> =
            Packet::from_frame(CpFrame::deserialize(&buf).unwrap()).unwrap();
        assert_eq!(parsed, packet);
    }
}
