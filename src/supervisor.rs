//! The link supervisor. Owns one state machine per control protocol,
//! multiplexes them over a single packet transport and drives the link
//! through negotiation, authentication, network protocol configuration
//! and optional encryption.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::ccp::CcpOpt;
use crate::chap::{ChapClient, ChapPacket, ChapServer, ChapType};
use crate::crypto::{chap_digest, constant_time_eq};
use crate::eap::{
    EapClient, EapCode, EapPacket, EapServer, TlsFramer, TlsSession, TlsTurn, METHOD_IDENTITY,
    METHOD_MD5_CHALLENGE, METHOD_TLS, TLS_FLAG_START,
};
use crate::ecp::EcpOpt;
use crate::ipcp::IpcpOpt;
use crate::ipv6cp::Ipv6cpOpt;
use crate::lcp::{AuthProto, LcpOpt};
use crate::mppe::{derive_keys, EncryptionContext, KeyStrength};
use crate::pap::{PapClient, PapPacket, PapServer};
use crate::proto::{NegotiationProtocol, Packet, PacketType, ProtocolConfig, ProtocolOption};
use crate::secret::SecretStore;
use crate::wire::{self, AuthReply, AuthRequest, ChapValue, CpFrame};
use crate::{Error, Result};

const MRU: u16 = 1492;

const ECHO_INTERVAL: Duration = Duration::from_secs(12);
const NCP_CHECK_INTERVAL: Duration = Duration::from_secs(20);

// Consecutive unanswered Echo-Requests before the link is declared dead.
const MAX_ECHO_OUTSTANDING: u8 = 3;
// Magic number renewals before a looped-back link is given up on.
const MAX_LOOPBACK_RENEWALS: u8 = 3;

const PAP_AUTH_REQUEST: u8 = 1;
const PAP_AUTH_ACK: u8 = 2;
const PAP_AUTH_NAK: u8 = 3;

const CHAP_CHALLENGE: u8 = 1;
const CHAP_RESPONSE: u8 = 2;
const CHAP_SUCCESS: u8 = 3;
const CHAP_FAILURE: u8 = 4;

const EAP_REQUEST: u8 = 1;
const EAP_RESPONSE: u8 = 2;
const EAP_SUCCESS: u8 = 3;
const EAP_FAILURE: u8 = 4;

const MSG_AUTH_OK: &str = "Login ok";
const MSG_AUTH_FAILED: &str = "Login incorrect";

/// Why a link went down. Stable across releases so consumers can match on it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum DownReason {
    /// Option negotiation did not converge within the retry limits,
    /// or the peer rejected a protocol the configuration requires.
    NegotiationFailed,
    /// Authentication failed in either direction.
    AuthenticationFailed,
    /// The line echoed our own packets back and magic number renewal
    /// did not clear the condition.
    LoopbackDetected,
    /// The peer terminated the link.
    PeerTerminated,
    /// The peer stopped answering Echo-Requests.
    KeepaliveExpired,
    /// No network protocol came up after authentication.
    NcpTimeout,
    /// The link was closed administratively.
    Closed,
}

/// Negotiated IPv4 parameters.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Ipv4Config {
    pub addr: Ipv4Addr,
    pub peer_addr: Ipv4Addr,
    pub dns1: Ipv4Addr,
    pub dns2: Ipv4Addr,
}

impl Default for Ipv4Config {
    fn default() -> Self {
        Self {
            addr: Ipv4Addr::UNSPECIFIED,
            peer_addr: Ipv4Addr::UNSPECIFIED,
            dns1: Ipv4Addr::UNSPECIFIED,
            dns2: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Negotiated IPv6 parameters.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Ipv6Config {
    pub ifid: u64,
    pub peer_ifid: u64,
}

/// The negotiated link parameters reported when a network protocol opens.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct LinkInfo {
    pub mru: u16,
    pub compression: Option<String>,
    pub ipv4: Option<Ipv4Config>,
    pub ipv6: Option<Ipv6Config>,
}

/// A state change reported to the consumer of a [`Client`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkEvent {
    /// Authentication completed in all demanded directions.
    Authenticated,
    /// Session keys were derived and installed.
    Encrypted(KeyStrength),
    /// A network protocol opened; carries the parameters negotiated so far.
    Up(LinkInfo),
    /// The link went down and the supervisor has finished.
    Down(DownReason),
}

/// Configuration of a link [`Client`].
pub struct ClientConfig {
    /// Our name when authenticating toward the peer.
    pub username: String,
    /// Our secret when authenticating toward the peer.
    pub password: String,

    /// The authentication protocol the peer is required to perform,
    /// or `None` to let the peer in unauthenticated.
    pub peer_auth: Option<AuthProto>,
    /// Secrets of peers allowed in via `peer_auth`.
    pub secrets: Option<Box<dyn SecretStore + Send>>,

    /// EAP methods offered to the peer, most preferred first.
    pub eap_methods: Vec<u8>,
    /// TLS handshake driver used when the peer asks us for EAP-TLS.
    pub tls_client: Option<Box<dyn TlsSession + Send>>,
    /// TLS handshake driver used when we demand EAP-TLS from the peer.
    pub tls_server: Option<Box<dyn TlsSession + Send>>,

    /// The IPv4 address to propose, `None` to let the peer assign one.
    pub ipv4_addr: Option<Ipv4Addr>,
    /// The address to assign to the peer if it asks for one.
    pub peer_ipv4: Option<Ipv4Addr>,
    /// Whether to negotiate IPv6.
    pub ipv6: bool,

    /// Whether to negotiate data compression.
    pub compression: bool,

    /// Whether to require link encryption.
    pub encryption: bool,
    /// The session key strength to insist on.
    pub strength: KeyStrength,
    /// Whether to request stateless operation.
    pub stateless: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            peer_auth: None,
            secrets: None,
            eap_methods: vec![METHOD_MD5_CHALLENGE],
            tls_client: None,
            tls_server: None,
            ipv4_addr: None,
            peer_ipv4: None,
            ipv6: false,
            compression: false,
            encryption: false,
            strength: KeyStrength::Bits128,
            stateless: false,
        }
    }
}

// One completed iteration of the supervisor select loop.
enum Event {
    Frame(u16, Vec<u8>),
    Lcp(Packet<LcpOpt>),
    Ipcp(Packet<IpcpOpt>),
    Ipv6cp(Packet<Ipv6cpOpt>),
    Ccp(Packet<CcpOpt>),
    Ecp(Packet<EcpOpt>),
    PapClient(PapPacket),
    PapServer(PapPacket),
    ChapClient(ChapPacket),
    ChapServer(ChapPacket),
    EapClient(EapPacket),
    EapServer(EapPacket),
    LcpOpened(bool),
    LcpFinished(bool),
    AuthChanged,
    IpcpOpened(bool),
    Ipv6cpOpened(bool),
    CcpOpened(bool),
    EcpOpened(bool),
    EchoTick,
    NcpTick,
}

/// A supervisor for a single point-to-point link.
///
/// The client is handed a bidirectional packet transport keyed by PPP
/// protocol number and a channel for [`LinkEvent`]s. It runs until the
/// link finishes, reporting the reason via [`LinkEvent::Down`].
pub struct Client {
    username: String,
    password: String,

    auth_client: Option<AuthProto>,
    auth_server: Option<AuthProto>,
    secrets: Option<Box<dyn SecretStore + Send>>,

    want_ipv6: bool,
    want_compression: bool,
    want_encryption: bool,
    strength: KeyStrength,

    lcp: NegotiationProtocol<LcpOpt>,
    ipcp: NegotiationProtocol<IpcpOpt>,
    ipv6cp: NegotiationProtocol<Ipv6cpOpt>,
    ccp: NegotiationProtocol<CcpOpt>,
    ecp: NegotiationProtocol<EcpOpt>,

    pap_client: PapClient,
    pap_server: PapServer,
    chap_client: ChapClient,
    chap_server: ChapServer,
    eap_client: EapClient,
    eap_server: EapServer,

    tls_client: Option<Box<dyn TlsSession + Send>>,
    tls_server: Option<Box<dyn TlsSession + Send>>,
    tls_client_framer: TlsFramer,
    tls_server_framer: TlsFramer,
    // The last EAP-TLS payload we sent in a Request, kept for
    // retransmissions of the underlying machine.
    tls_request: Option<Vec<u8>>,

    encryption: EncryptionContext,
    // (secret, challenge, response) of the completed handshake,
    // the inputs to session key derivation.
    auth_material: Option<(Vec<u8>, Vec<u8>, Vec<u8>)>,

    authenticated: bool,
    peer_name: String,

    pending_reason: Option<DownReason>,

    echo_outstanding: u8,
    loopback_renewals: u8,
    ncp_ticks: u8,

    id_pap: u8,
    id_pap_reply: u8,
    id_chap: u8,
    id_eap: u8,
    id_echo: u8,
    id_reject: u8,

    chap_challenge: Vec<u8>,
    eap_challenge: Vec<u8>,

    tx: mpsc::UnboundedSender<(u16, Vec<u8>)>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Client {
    /// Creates a new `Client` that reports state changes on `events`
    /// and sends packets via `tx`.
    pub fn new(
        config: ClientConfig,
        tx: mpsc::UnboundedSender<(u16, Vec<u8>)>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let mut lcp_request = vec![
            LcpOpt::Mru(MRU),
            LcpOpt::MagicNumber(rand::random()),
        ];
        if let Some(proto) = config.peer_auth {
            lcp_request.push(LcpOpt::AuthenticationProtocol(proto));
        }

        let lcp = NegotiationProtocol::new(ProtocolConfig {
            require: Vec::default(),
            // Link quality monitoring is not implemented.
            deny: vec![LcpOpt::QualityProtocol(0)],
            deny_exact: Vec::default(),
            request: lcp_request,
            refuse: Vec::default(),
            refuse_exact: Vec::default(),
            need_protocol_reject: true,
            restart_interval: None,
            max_terminate: None,
            max_configure: None,
            max_failure: None,
        });

        let ipcp = NegotiationProtocol::new(ProtocolConfig {
            require: Vec::default(),
            // Van Jacobson compression is not implemented.
            deny: vec![IpcpOpt::IpCompressionProtocol(0)],
            deny_exact: config
                .peer_ipv4
                .map(|addr| {
                    vec![(
                        IpcpOpt::IpAddr(Ipv4Addr::UNSPECIFIED),
                        IpcpOpt::IpAddr(addr),
                    )]
                })
                .unwrap_or_default(),
            request: vec![
                IpcpOpt::IpAddr(config.ipv4_addr.unwrap_or(Ipv4Addr::UNSPECIFIED)),
                IpcpOpt::PrimaryDns(Ipv4Addr::UNSPECIFIED),
                IpcpOpt::SecondaryDns(Ipv4Addr::UNSPECIFIED),
            ],
            refuse: Vec::default(),
            refuse_exact: Vec::default(),
            need_protocol_reject: false,
            restart_interval: None,
            max_terminate: None,
            max_configure: None,
            max_failure: None,
        });

        let ipv6cp = NegotiationProtocol::new(ProtocolConfig {
            require: Vec::default(),
            deny: Vec::default(),
            deny_exact: Vec::default(),
            request: vec![Ipv6cpOpt::InterfaceId(rand::random())],
            refuse: Vec::default(),
            refuse_exact: Vec::default(),
            need_protocol_reject: false,
            restart_interval: None,
            max_terminate: None,
            max_configure: None,
            max_failure: None,
        });

        let ccp = NegotiationProtocol::new(ProtocolConfig {
            require: Vec::default(),
            deny: Vec::default(),
            deny_exact: Vec::default(),
            request: vec![CcpOpt::Deflate(15)],
            refuse: Vec::default(),
            refuse_exact: Vec::default(),
            need_protocol_reject: false,
            restart_interval: None,
            max_terminate: None,
            max_configure: None,
            max_failure: None,
        });

        let mppe = |strength, stateless| EcpOpt::Mppe {
            strength,
            stateless,
        };
        let other = match config.strength {
            KeyStrength::Bits40 => KeyStrength::Bits128,
            KeyStrength::Bits128 => KeyStrength::Bits40,
        };
        let ecp = NegotiationProtocol::new(ProtocolConfig {
            require: vec![mppe(config.strength, config.stateless)],
            deny: Vec::default(),
            // Insist on the configured strength in both directions.
            deny_exact: vec![
                (mppe(other, false), mppe(config.strength, false)),
                (mppe(other, true), mppe(config.strength, true)),
            ],
            request: vec![mppe(config.strength, config.stateless)],
            refuse: Vec::default(),
            refuse_exact: vec![mppe(other, false), mppe(other, true)],
            need_protocol_reject: false,
            restart_interval: None,
            max_terminate: None,
            max_configure: None,
            max_failure: None,
        });

        let mut eap_supported = vec![METHOD_MD5_CHALLENGE];
        if config.tls_client.is_some() {
            eap_supported.push(METHOD_TLS);
        }

        Self {
            username: config.username,
            password: config.password,

            auth_client: None,
            auth_server: None,
            secrets: config.secrets,

            want_ipv6: config.ipv6,
            want_compression: config.compression,
            want_encryption: config.encryption,
            strength: config.strength,

            lcp,
            ipcp,
            ipv6cp,
            ccp,
            ecp,

            pap_client: PapClient::new(None, None),
            pap_server: PapServer::new(None),
            chap_client: ChapClient::new(None),
            chap_server: ChapServer::new(None, None),
            eap_client: EapClient::new(eap_supported, None),
            eap_server: EapServer::new(config.eap_methods, None, None),

            tls_client: config.tls_client,
            tls_server: config.tls_server,
            tls_client_framer: TlsFramer::new(None),
            tls_server_framer: TlsFramer::new(None),
            tls_request: None,

            encryption: EncryptionContext::default(),
            auth_material: None,

            authenticated: false,
            peer_name: String::new(),

            pending_reason: None,

            echo_outstanding: 0,
            loopback_renewals: 0,
            ncp_ticks: 0,

            id_pap: 0,
            id_pap_reply: 0,
            id_chap: 0,
            id_eap: 0,
            id_echo: 0,
            id_reject: 0,

            chap_challenge: Vec::default(),
            eap_challenge: Vec::default(),

            tx,
            events,
        }
    }

    /// Runs the link until it goes down. The reason is reported via
    /// [`LinkEvent::Down`] before this method returns.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<(u16, Vec<u8>)>) -> Result<()> {
        let mut lcp_opened = self.lcp.opened();
        let mut lcp_active = self.lcp.active();
        let mut ipcp_opened = self.ipcp.opened();
        let mut ipv6cp_opened = self.ipv6cp.opened();
        let mut ccp_opened = self.ccp.opened();
        let mut ecp_opened = self.ecp.opened();

        let mut pap_client_opened = self.pap_client.opened();
        let mut pap_server_opened = self.pap_server.opened();
        let mut chap_client_opened = self.chap_client.opened();
        let mut chap_server_opened = self.chap_server.opened();
        let mut eap_client_opened = self.eap_client.opened();
        let mut eap_server_opened = self.eap_server.opened();

        let mut echo_timer = tokio::time::interval(ECHO_INTERVAL);
        let mut ncp_timer = tokio::time::interval(NCP_CHECK_INTERVAL);

        self.lcp.open();
        self.lcp.up();

        loop {
            let event = tokio::select! {
                frame = rx.recv() => match frame {
                    Some((protocol, data)) => Event::Frame(protocol, data),
                    None => {
                        // The lower layer is gone. The link is reported
                        // down regardless so consumers see a reason.
                        let reason = self.pending_reason.unwrap_or(DownReason::Closed);
                        println!("[info] transport closed, link down: {:?}", reason);

                        let _ = self.events.send(LinkEvent::Down(reason));
                        return Err(Error::TransportClosed);
                    }
                },

                packet = self.lcp.to_send() => Event::Lcp(packet),
                packet = self.ipcp.to_send() => Event::Ipcp(packet),
                packet = self.ipv6cp.to_send() => Event::Ipv6cp(packet),
                packet = self.ccp.to_send() => Event::Ccp(packet),
                packet = self.ecp.to_send() => Event::Ecp(packet),

                packet = self.pap_client.to_send() => Event::PapClient(packet),
                packet = self.pap_server.to_send() => Event::PapServer(packet),
                packet = self.chap_client.to_send() => Event::ChapClient(packet),
                packet = self.chap_server.to_send() => Event::ChapServer(packet),
                packet = self.eap_client.to_send() => Event::EapClient(packet),
                packet = self.eap_server.to_send() => Event::EapServer(packet),

                result = lcp_opened.changed() => {
                    result?;
                    Event::LcpOpened(*lcp_opened.borrow_and_update())
                }
                result = lcp_active.changed() => {
                    result?;
                    Event::LcpFinished(!*lcp_active.borrow_and_update())
                }
                result = ipcp_opened.changed() => {
                    result?;
                    Event::IpcpOpened(*ipcp_opened.borrow_and_update())
                }
                result = ipv6cp_opened.changed() => {
                    result?;
                    Event::Ipv6cpOpened(*ipv6cp_opened.borrow_and_update())
                }
                result = ccp_opened.changed() => {
                    result?;
                    Event::CcpOpened(*ccp_opened.borrow_and_update())
                }
                result = ecp_opened.changed() => {
                    result?;
                    Event::EcpOpened(*ecp_opened.borrow_and_update())
                }

                result = pap_client_opened.changed() => { result?; Event::AuthChanged }
                result = pap_server_opened.changed() => { result?; Event::AuthChanged }
                result = chap_client_opened.changed() => { result?; Event::AuthChanged }
                result = chap_server_opened.changed() => { result?; Event::AuthChanged }
                result = eap_client_opened.changed() => { result?; Event::AuthChanged }
                result = eap_server_opened.changed() => { result?; Event::AuthChanged }

                _ = echo_timer.tick() => Event::EchoTick,
                _ = ncp_timer.tick() => Event::NcpTick,
            };

            match event {
                Event::Frame(protocol, data) => self.handle_frame(protocol, &data)?,

                Event::Lcp(packet) => self.send_lcp(packet)?,
                Event::Ipcp(packet) => self.send_control(wire::IPCP, packet)?,
                Event::Ipv6cp(packet) => self.send_control(wire::IPV6CP, packet)?,
                Event::Ccp(packet) => self.send_control(wire::CCP, packet)?,
                Event::Ecp(packet) => self.send_control(wire::ECP, packet)?,

                Event::PapClient(packet) => self.send_pap_client(packet)?,
                Event::PapServer(packet) => self.send_pap_server(packet)?,
                Event::ChapClient(packet) => self.send_chap_client(packet)?,
                Event::ChapServer(packet) => self.send_chap_server(packet)?,
                Event::EapClient(packet) => self.send_eap_client(packet)?,
                Event::EapServer(packet) => self.send_eap_server(packet)?,

                Event::LcpOpened(true) => self.this_layer_up(),
                Event::LcpOpened(false) => self.this_layer_down(),
                Event::LcpFinished(true) => {
                    let reason = self.pending_reason.unwrap_or(DownReason::NegotiationFailed);
                    println!("[info] link down: {:?}", reason);

                    self.events
                        .send(LinkEvent::Down(reason))
                        .map_err(|_| Error::EventChannelClosed)?;
                    return Ok(());
                }
                Event::LcpFinished(false) => {}

                Event::AuthChanged => self.check_auth()?,

                Event::IpcpOpened(true) => {
                    println!("[info] ipv4 up");

                    self.ncp_ticks = 0;
                    let info = self.link_info();
                    self.events
                        .send(LinkEvent::Up(info))
                        .map_err(|_| Error::EventChannelClosed)?;
                }
                Event::Ipv6cpOpened(true) => {
                    println!("[info] ipv6 up");

                    self.ncp_ticks = 0;
                    let info = self.link_info();
                    self.events
                        .send(LinkEvent::Up(info))
                        .map_err(|_| Error::EventChannelClosed)?;
                }
                Event::IpcpOpened(false) | Event::Ipv6cpOpened(false) => {}

                Event::CcpOpened(true) => {
                    println!("[info] compression up");

                    // Refresh the applied parameters if the link is
                    // already reported up.
                    let info = self.link_info();
                    if info.ipv4.is_some() || info.ipv6.is_some() {
                        self.events
                            .send(LinkEvent::Up(info))
                            .map_err(|_| Error::EventChannelClosed)?;
                    }
                }
                Event::CcpOpened(false) => {}

                Event::EcpOpened(true) => self.arm_encryption()?,
                Event::EcpOpened(false) => self.encryption.clear(),

                Event::EchoTick => self.echo_tick()?,
                Event::NcpTick => self.ncp_tick(),
            }
        }
    }

    fn handle_frame(&mut self, protocol: u16, data: &[u8]) -> Result<()> {
        match protocol {
            wire::LCP => self.handle_lcp(data),
            wire::PAP => self.handle_pap(data),
            wire::CHAP => self.handle_chap(data),
            wire::EAP => self.handle_eap(data),
            wire::IPCP | wire::IPV6CP | wire::CCP | wire::ECP => {
                // Network and encryption protocols are gated on the
                // authentication phase; early packets are discarded.
                if !self.authenticated {
                    println!("[warn] discarding protocol {:04x} before auth", protocol);
                    return Ok(());
                }

                match protocol {
                    wire::IPCP => match parse(data) {
                        Ok(packet) => self.ipcp.from_recv(packet),
                        Err(error) => return self.code_reject(protocol, data, error),
                    },
                    wire::IPV6CP => match parse(data) {
                        Ok(packet) => self.ipv6cp.from_recv(packet),
                        Err(error) => return self.code_reject(protocol, data, error),
                    },
                    wire::CCP => match parse(data) {
                        Ok(packet) => self.ccp.from_recv(packet),
                        Err(error) => return self.code_reject(protocol, data, error),
                    },
                    _ => match parse(data) {
                        Ok(packet) => self.ecp.from_recv(packet),
                        Err(error) => return self.code_reject(protocol, data, error),
                    },
                }
                Ok(())
            }
            _ => {
                // An unknown protocol is reported to the peer, but only
                // once the link is up to negotiate over.
                if *self.lcp.opened().borrow() && self.lcp.handles_protocol_reject() {
                    println!("[warn] rejecting unknown protocol {:04x}", protocol);

                    self.id_reject = self.id_reject.wrapping_add(1);
                    let mut packet: Packet<LcpOpt> =
                        Packet::new(PacketType::ProtocolReject, self.id_reject);
                    packet.rejected_protocol = protocol;

                    self.send_lcp(packet)?;
                }
                Ok(())
            }
        }
    }

    fn handle_lcp(&mut self, data: &[u8]) -> Result<()> {
        let frame = match CpFrame::deserialize(data) {
            Ok(frame) => frame,
            Err(error) => return self.code_reject(wire::LCP, data, error),
        };

        // Our own magic number inside an echo packet means the line is
        // looped back onto us. Echo traffic only exists on an open link.
        if *self.lcp.opened().borrow()
            && (frame.code == wire::ECHO_REQUEST || frame.code == wire::ECHO_REPLY)
            && frame.payload.len() >= 4
        {
            let magic = u32::from_be_bytes([
                frame.payload[0],
                frame.payload[1],
                frame.payload[2],
                frame.payload[3],
            ]);

            if Some(magic) == self.magic() {
                return self.handle_loopback();
            }
        }

        if frame.code == wire::ECHO_REPLY {
            self.echo_outstanding = 0;
        }

        if frame.code == wire::TERMINATE_REQUEST && self.pending_reason.is_none() {
            self.pending_reason = Some(DownReason::PeerTerminated);
        }

        let packet: Packet<LcpOpt> = match Packet::from_frame(frame) {
            Ok(packet) => packet,
            Err(error) => return self.code_reject(wire::LCP, data, error),
        };

        // A Protocol-Reject names the rejected protocol; dispatch it to
        // the machine it belongs to.
        if packet.ty == PacketType::ProtocolReject {
            self.dispatch_protocol_reject(packet.rejected_protocol)?;
        }

        self.lcp.from_recv(packet);
        Ok(())
    }

    fn dispatch_protocol_reject(&mut self, protocol: u16) -> Result<()> {
        fn rejected<O: ProtocolOption>(protocol: u16) -> Packet<O> {
            let mut packet = Packet::new(PacketType::ProtocolReject, 0);
            packet.rejected_protocol = protocol;
            packet
        }

        match protocol {
            wire::IPCP => self.ipcp.from_recv(rejected(protocol)),
            wire::IPV6CP => self.ipv6cp.from_recv(rejected(protocol)),
            wire::CCP => self.ccp.from_recv(rejected(protocol)),
            wire::ECP => {
                self.ecp.from_recv(rejected(protocol));

                if self.want_encryption {
                    println!("[warn] peer rejected mandatory encryption");
                    self.teardown(DownReason::NegotiationFailed);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_loopback(&mut self) -> Result<()> {
        self.loopback_renewals += 1;
        if self.loopback_renewals > MAX_LOOPBACK_RENEWALS {
            println!("[warn] line is looped back, giving up");
            self.teardown(DownReason::LoopbackDetected);
            return Ok(());
        }

        println!("[warn] own magic number looped back, renewing");

        self.lcp.update_request(LcpOpt::MagicNumber(rand::random()));
        self.lcp.down();
        self.lcp.up();
        Ok(())
    }

    fn handle_pap(&mut self, data: &[u8]) -> Result<()> {
        let frame = match CpFrame::deserialize(data) {
            Ok(frame) => frame,
            Err(error) => {
                println!("[warn] malformed pap packet: {}", error);
                return Ok(());
            }
        };

        match frame.code {
            PAP_AUTH_REQUEST => {
                let request = match AuthRequest::deserialize(&frame.payload) {
                    Ok(request) => request,
                    Err(error) => {
                        println!("[warn] malformed pap request: {}", error);
                        return Ok(());
                    }
                };

                let valid = match &self.secrets {
                    Some(secrets) => match secrets.lookup(&request.peer_id) {
                        Ok(secret) => constant_time_eq(request.passwd.as_bytes(), &secret),
                        Err(_) => false,
                    },
                    None => false,
                };

                if valid {
                    self.peer_name = request.peer_id;
                }

                self.id_pap_reply = frame.identifier;
                self.pap_server.from_recv(valid);
            }
            PAP_AUTH_ACK => self.pap_client.from_recv(PapPacket::AuthenticateAck),
            PAP_AUTH_NAK => {
                match AuthReply::deserialize(&frame.payload) {
                    Ok(reply) => println!("[warn] peer refused credentials: {}", reply.message),
                    Err(_) => println!("[warn] peer refused credentials"),
                }

                self.pap_client.from_recv(PapPacket::AuthenticateNak);
            }
            _ => println!("[warn] invalid pap code {}", frame.code),
        }
        Ok(())
    }

    fn handle_chap(&mut self, data: &[u8]) -> Result<()> {
        let frame = match CpFrame::deserialize(data) {
            Ok(frame) => frame,
            Err(error) => {
                println!("[warn] malformed chap packet: {}", error);
                return Ok(());
            }
        };

        match frame.code {
            CHAP_CHALLENGE => {
                let challenge = match ChapValue::deserialize(&frame.payload) {
                    Ok(challenge) => challenge,
                    Err(error) => {
                        println!("[warn] malformed chap challenge: {}", error);
                        return Ok(());
                    }
                };

                self.chap_client.from_recv(ChapPacket {
                    ty: ChapType::Challenge,
                    id: frame.identifier,
                    data: challenge.value,
                });
            }
            CHAP_RESPONSE => {
                // Responses to anything but the current challenge are stale.
                if frame.identifier != self.id_chap {
                    return Ok(());
                }

                let response = match ChapValue::deserialize(&frame.payload) {
                    Ok(response) => response,
                    Err(error) => {
                        println!("[warn] malformed chap response: {}", error);
                        return Ok(());
                    }
                };
                let challenge = self.chap_challenge.clone();
                let valid =
                    self.verify_digest(frame.identifier, &response.name, &challenge, &response.value);

                self.chap_server.from_recv(frame.identifier, valid);
            }
            CHAP_SUCCESS => self.chap_client.from_recv(ChapPacket {
                ty: ChapType::Success,
                id: frame.identifier,
                data: Vec::default(),
            }),
            CHAP_FAILURE => self.chap_client.from_recv(ChapPacket {
                ty: ChapType::Failure,
                id: frame.identifier,
                data: Vec::default(),
            }),
            _ => println!("[warn] invalid chap code {}", frame.code),
        }
        Ok(())
    }

    fn handle_eap(&mut self, data: &[u8]) -> Result<()> {
        let frame = match CpFrame::deserialize(data) {
            Ok(frame) => frame,
            Err(error) => {
                println!("[warn] malformed eap packet: {}", error);
                return Ok(());
            }
        };

        let (method, method_data) = match frame.code {
            EAP_REQUEST | EAP_RESPONSE => match frame.payload.split_first() {
                Some((method, data)) => (*method, data.to_vec()),
                None => {
                    println!("[warn] eap packet without a type field");
                    return Ok(());
                }
            },
            _ => (0, Vec::default()),
        };

        match frame.code {
            EAP_REQUEST => self.eap_client.from_recv(EapPacket {
                code: EapCode::Request,
                id: frame.identifier,
                method,
                data: method_data,
            }),
            EAP_RESPONSE => {
                let packet = EapPacket {
                    code: EapCode::Response,
                    id: frame.identifier,
                    method,
                    data: method_data,
                };

                // Identity and Nak drive the machine directly; a method
                // response carries a digest we verify here first.
                if packet.method == METHOD_MD5_CHALLENGE {
                    let value = match ChapValue::deserialize(&packet.data) {
                        Ok(value) => value,
                        Err(error) => {
                            println!("[warn] malformed eap md5 response: {}", error);
                            return Ok(());
                        }
                    };
                    let name = if value.name.is_empty() {
                        self.peer_name.clone()
                    } else {
                        value.name
                    };
                    let challenge = self.eap_challenge.clone();
                    let valid = self.verify_digest(packet.id, &name, &challenge, &value.value);

                    self.eap_server.verdict(packet.id, valid);
                } else if packet.method == METHOD_TLS {
                    self.handle_eap_tls(packet.id, &packet.data)?;
                } else {
                    if packet.method == METHOD_IDENTITY {
                        match String::from_utf8(packet.data.clone()) {
                            Ok(name) => self.peer_name = name,
                            Err(_) => {
                                println!("[warn] non-utf8 eap identity");
                                return Ok(());
                            }
                        }
                    }
                    self.eap_server.from_recv(packet);
                }
            }
            EAP_SUCCESS => self.eap_client.from_recv(EapPacket {
                code: EapCode::Success,
                id: frame.identifier,
                method: 0,
                data: Vec::default(),
            }),
            EAP_FAILURE => self.eap_client.from_recv(EapPacket {
                code: EapCode::Failure,
                id: frame.identifier,
                method: 0,
                data: Vec::default(),
            }),
            _ => println!("[warn] invalid eap code {}", frame.code),
        }
        Ok(())
    }

    /// Checks a peer digest against the secret store in constant time.
    /// A valid digest also captures the key derivation inputs.
    fn verify_digest(&mut self, id: u8, name: &str, challenge: &[u8], digest: &[u8]) -> bool {
        let secret = match &self.secrets {
            Some(secrets) => match secrets.lookup(name) {
                Ok(secret) => secret,
                Err(_) => return false,
            },
            None => return false,
        };

        let expected = chap_digest(id, &secret, challenge);
        let valid = constant_time_eq(&expected, digest);

        if valid {
            self.peer_name = name.to_string();
            self.auth_material = Some((secret, challenge.to_vec(), digest.to_vec()));
        }

        valid
    }

    fn send_lcp(&mut self, packet: Packet<LcpOpt>) -> Result<()> {
        let magic = self.magic().unwrap_or(0);
        let mut buf = Vec::new();
        packet.to_frame(magic).serialize(&mut buf);

        self.tx
            .send((wire::LCP, buf))
            .map_err(|_| Error::TransportClosed)
    }

    fn send_control<O: ProtocolOption>(&mut self, protocol: u16, packet: Packet<O>) -> Result<()> {
        let mut buf = Vec::new();
        packet.to_frame(0).serialize(&mut buf);

        self.tx
            .send((protocol, buf))
            .map_err(|_| Error::TransportClosed)
    }

    /// A packet that cannot be decoded is reported back to the peer with
    /// a Code-Reject carrying the offending code and identifier. Machine
    /// state is left untouched.
    fn code_reject(&mut self, protocol: u16, data: &[u8], error: Error) -> Result<()> {
        println!(
            "[warn] malformed packet, protocol {:04x}: {}",
            protocol, error
        );

        if data.len() < 2 {
            return Ok(());
        }

        self.id_reject = self.id_reject.wrapping_add(1);

        let mut buf = Vec::new();
        CpFrame::new(wire::CODE_REJECT, self.id_reject, vec![data[0], data[1]]).serialize(&mut buf);

        self.tx
            .send((protocol, buf))
            .map_err(|_| Error::TransportClosed)
    }

    fn send_pap_client(&mut self, packet: PapPacket) -> Result<()> {
        match packet {
            PapPacket::AuthenticateRequest => {
                self.id_pap = self.id_pap.wrapping_add(1);

                let mut payload = Vec::new();
                AuthRequest {
                    peer_id: self.username.clone(),
                    passwd: self.password.clone(),
                }
                .serialize(&mut payload)?;

                self.send_auth(wire::PAP, PAP_AUTH_REQUEST, self.id_pap, payload)
            }
            PapPacket::TerminateLower => {
                self.teardown(DownReason::AuthenticationFailed);
                Ok(())
            }
            PapPacket::AuthenticateAck | PapPacket::AuthenticateNak => Ok(()), // illegal
        }
    }

    fn send_pap_server(&mut self, packet: PapPacket) -> Result<()> {
        let (code, message) = match packet {
            PapPacket::AuthenticateAck => (PAP_AUTH_ACK, MSG_AUTH_OK),
            PapPacket::AuthenticateNak => (PAP_AUTH_NAK, MSG_AUTH_FAILED),
            PapPacket::TerminateLower => {
                self.teardown(DownReason::AuthenticationFailed);
                return Ok(());
            }
            PapPacket::AuthenticateRequest => return Ok(()), // illegal
        };

        let mut payload = Vec::new();
        AuthReply {
            message: message.to_string(),
        }
        .serialize(&mut payload)?;

        self.send_auth(wire::PAP, code, self.id_pap_reply, payload)
    }

    fn send_chap_client(&mut self, packet: ChapPacket) -> Result<()> {
        match packet.ty {
            ChapType::Response => {
                let digest = chap_digest(packet.id, self.password.as_bytes(), &packet.data);
                // These become the key derivation inputs if the peer
                // accepts the response.
                self.auth_material = Some((
                    self.password.as_bytes().to_vec(),
                    packet.data.clone(),
                    digest.to_vec(),
                ));

                let mut payload = Vec::new();
                ChapValue {
                    value: digest.to_vec(),
                    name: self.username.clone(),
                }
                .serialize(&mut payload)?;

                self.send_auth(wire::CHAP, CHAP_RESPONSE, packet.id, payload)
            }
            ChapType::TerminateLower => {
                self.teardown(DownReason::AuthenticationFailed);
                Ok(())
            }
            ChapType::Challenge | ChapType::Success | ChapType::Failure => Ok(()), // illegal
        }
    }

    fn send_chap_server(&mut self, packet: ChapPacket) -> Result<()> {
        match packet.ty {
            ChapType::Challenge => {
                self.id_chap = self.id_chap.wrapping_add(1);
                let challenge: [u8; 16] = rand::random();
                self.chap_challenge = challenge.to_vec();

                let mut payload = Vec::new();
                ChapValue {
                    value: self.chap_challenge.clone(),
                    name: self.username.clone(),
                }
                .serialize(&mut payload)?;

                self.send_auth(wire::CHAP, CHAP_CHALLENGE, self.id_chap, payload)
            }
            ChapType::Success => self.send_auth(wire::CHAP, CHAP_SUCCESS, packet.id, Vec::new()),
            ChapType::Failure => self.send_auth(wire::CHAP, CHAP_FAILURE, packet.id, Vec::new()),
            ChapType::TerminateLower => {
                self.teardown(DownReason::AuthenticationFailed);
                Ok(())
            }
            ChapType::Response => Ok(()), // illegal
        }
    }

    fn send_eap_client(&mut self, packet: EapPacket) -> Result<()> {
        match packet.code {
            EapCode::Response => {
                // The machine echoes the request data; the actual method
                // payload is built here.
                let data = match packet.method {
                    METHOD_IDENTITY => self.username.as_bytes().to_vec(),
                    METHOD_MD5_CHALLENGE => {
                        let challenge = match ChapValue::deserialize(&packet.data) {
                            Ok(challenge) => challenge,
                            Err(error) => {
                                println!("[warn] malformed eap md5 challenge: {}", error);
                                return Ok(());
                            }
                        };
                        let digest =
                            chap_digest(packet.id, self.password.as_bytes(), &challenge.value);
                        self.auth_material = Some((
                            self.password.as_bytes().to_vec(),
                            challenge.value,
                            digest.to_vec(),
                        ));

                        let mut data = Vec::new();
                        ChapValue {
                            value: digest.to_vec(),
                            name: self.username.clone(),
                        }
                        .serialize(&mut data)?;
                        data
                    }
                    METHOD_TLS => match self.tls_client_payload(&packet.data) {
                        Some(data) => data,
                        None => return Ok(()),
                    },
                    _ => packet.data,
                };

                let mut payload = vec![packet.method];
                payload.extend_from_slice(&data);
                self.send_auth(wire::EAP, EAP_RESPONSE, packet.id, payload)
            }
            EapCode::TerminateLower => {
                self.teardown(DownReason::AuthenticationFailed);
                Ok(())
            }
            EapCode::Request | EapCode::Success | EapCode::Failure => Ok(()), // illegal
        }
    }

    fn send_eap_server(&mut self, packet: EapPacket) -> Result<()> {
        match packet.code {
            EapCode::Request => {
                if packet.method == METHOD_TLS {
                    // The first emission starts the handshake; later ones
                    // are restart timer retransmissions of the last payload.
                    let payload = match self.tls_request.clone() {
                        Some(payload) => payload,
                        None => TlsFramer::start_payload(),
                    };

                    return self.send_tls_request(payload);
                }

                self.id_eap = self.id_eap.wrapping_add(1);

                let mut payload = vec![packet.method];
                if packet.method == METHOD_MD5_CHALLENGE {
                    let challenge: [u8; 16] = rand::random();
                    self.eap_challenge = challenge.to_vec();

                    ChapValue {
                        value: self.eap_challenge.clone(),
                        name: self.username.clone(),
                    }
                    .serialize(&mut payload)?;
                }

                self.send_auth(wire::EAP, EAP_REQUEST, self.id_eap, payload)
            }
            EapCode::Success => self.send_auth(wire::EAP, EAP_SUCCESS, packet.id, Vec::new()),
            EapCode::Failure => self.send_auth(wire::EAP, EAP_FAILURE, packet.id, Vec::new()),
            EapCode::TerminateLower => {
                self.teardown(DownReason::AuthenticationFailed);
                Ok(())
            }
            EapCode::Response => Ok(()), // illegal
        }
    }

    /// Builds the payload of our next EAP-TLS Response, or `None` if the
    /// handshake failed and the link is coming down.
    fn tls_client_payload(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let session = self.tls_client.as_mut()?; // only offered with a session

        // The authenticator acknowledged a fragment of ours.
        if let Some(fragment) = self.tls_client_framer.next_fragment() {
            return Some(fragment);
        }

        let message = if request.first().is_some_and(|flags| flags & TLS_FLAG_START != 0) {
            Vec::new()
        } else {
            match self.tls_client_framer.push(request) {
                Ok(Some(message)) => message,
                // More fragments to come, acknowledge this one.
                Ok(None) => return Some(TlsFramer::ack_payload()),
                Err(error) => {
                    println!("[warn] malformed eap tls request: {}", error);
                    return None;
                }
            }
        };

        match session.advance(&message) {
            TlsTurn::Respond(outbound) => {
                self.tls_client_framer.queue(outbound);
                self.tls_client_framer.next_fragment()
            }
            TlsTurn::Finished => Some(TlsFramer::ack_payload()),
            TlsTurn::Failed => {
                println!("[warn] tls handshake failed");
                self.teardown(DownReason::AuthenticationFailed);
                None
            }
        }
    }

    /// Drives our authenticator side of an EAP-TLS exchange: reassembles
    /// the peer's fragments, advances the handshake and issues the next
    /// Request, bypassing the machine until a verdict is reached.
    fn handle_eap_tls(&mut self, id: u8, payload: &[u8]) -> Result<()> {
        // The peer acknowledged a fragment of ours.
        if let Some(fragment) = self.tls_server_framer.next_fragment() {
            return self.send_tls_request(fragment);
        }

        let message = match self.tls_server_framer.push(payload) {
            Ok(Some(message)) => message,
            Ok(None) => return self.send_tls_request(TlsFramer::ack_payload()),
            Err(error) => {
                println!("[warn] malformed eap tls response: {}", error);
                return Ok(());
            }
        };

        let Some(session) = self.tls_server.as_mut() else {
            println!("[warn] eap tls response without a session");
            return Ok(());
        };

        match session.advance(&message) {
            TlsTurn::Respond(outbound) => {
                self.tls_server_framer.queue(outbound);
                match self.tls_server_framer.next_fragment() {
                    Some(fragment) => self.send_tls_request(fragment),
                    None => Ok(()),
                }
            }
            TlsTurn::Finished => {
                self.eap_server.verdict(id, true);
                Ok(())
            }
            TlsTurn::Failed => {
                self.eap_server.verdict(id, false);
                Ok(())
            }
        }
    }

    fn send_tls_request(&mut self, payload: Vec<u8>) -> Result<()> {
        self.id_eap = self.id_eap.wrapping_add(1);

        let mut data = vec![METHOD_TLS];
        data.extend_from_slice(&payload);
        self.tls_request = Some(payload);

        self.send_auth(wire::EAP, EAP_REQUEST, self.id_eap, data)
    }

    fn send_auth(&mut self, protocol: u16, code: u8, id: u8, payload: Vec<u8>) -> Result<()> {
        let mut buf = Vec::new();
        CpFrame::new(code, id, payload).serialize(&mut buf);

        self.tx
            .send((protocol, buf))
            .map_err(|_| Error::TransportClosed)
    }

    /// The link layer came up: start the authentication phase per the
    /// negotiated options, or the network protocols if no authentication
    /// was agreed on.
    fn this_layer_up(&mut self) {
        println!("[info] link established");

        self.echo_outstanding = 0;

        // The peer's request tells us how to prove ourselves, our own
        // acknowledged request what to demand of the peer.
        self.auth_client = self.lcp.peer_options().iter().find_map(|opt| match opt {
            LcpOpt::AuthenticationProtocol(proto) => Some(*proto),
            _ => None,
        });
        self.auth_server = self.lcp.our_options().iter().find_map(|opt| match opt {
            LcpOpt::AuthenticationProtocol(proto) => Some(*proto),
            _ => None,
        });

        match self.auth_client {
            Some(AuthProto::Pap) => {
                self.pap_client.open();
                self.pap_client.up();
            }
            Some(AuthProto::ChapMd5) => {
                self.chap_client.open();
                self.chap_client.up();
            }
            Some(AuthProto::Eap) => {
                self.eap_client.open();
                self.eap_client.up();
            }
            None => {}
        }

        match self.auth_server {
            Some(AuthProto::Pap) => {
                self.pap_server.open();
                self.pap_server.up();
            }
            Some(AuthProto::ChapMd5) => {
                self.chap_server.open();
                self.chap_server.up();
            }
            Some(AuthProto::Eap) => {
                self.eap_server.open();
                self.eap_server.up();
            }
            None => {}
        }

        if self.auth_client.is_none() && self.auth_server.is_none() {
            println!("[info] no authentication negotiated");

            self.authenticated = true;
            self.start_ncps();
        }
    }

    /// The link layer went down: take the whole stack down with it.
    fn this_layer_down(&mut self) {
        println!("[info] link lost");

        self.authenticated = false;
        self.auth_material = None;
        self.encryption.clear();
        self.echo_outstanding = 0;
        self.ncp_ticks = 0;

        self.tls_client_framer = TlsFramer::new(None);
        self.tls_server_framer = TlsFramer::new(None);
        self.tls_request = None;

        match self.auth_client.take() {
            Some(AuthProto::Pap) => self.pap_client.down(),
            Some(AuthProto::ChapMd5) => self.chap_client.down(),
            Some(AuthProto::Eap) => self.eap_client.down(),
            None => {}
        }
        match self.auth_server.take() {
            Some(AuthProto::Pap) => self.pap_server.down(),
            Some(AuthProto::ChapMd5) => self.chap_server.down(),
            Some(AuthProto::Eap) => self.eap_server.down(),
            None => {}
        }

        self.ipcp.down();
        self.ipv6cp.down();
        self.ccp.down();
        self.ecp.down();
    }

    /// Reports authentication completion once every engaged direction
    /// has succeeded, then starts the network protocols.
    fn check_auth(&mut self) -> Result<()> {
        if self.authenticated {
            return Ok(());
        }

        let client_done = match self.auth_client {
            Some(AuthProto::Pap) => *self.pap_client.opened().borrow(),
            Some(AuthProto::ChapMd5) => *self.chap_client.opened().borrow(),
            Some(AuthProto::Eap) => *self.eap_client.opened().borrow(),
            None => true,
        };
        let server_done = match self.auth_server {
            Some(AuthProto::Pap) => *self.pap_server.opened().borrow(),
            Some(AuthProto::ChapMd5) => *self.chap_server.opened().borrow(),
            Some(AuthProto::Eap) => *self.eap_server.opened().borrow(),
            None => true,
        };

        if client_done && server_done {
            println!("[info] authentication complete");

            self.authenticated = true;
            self.events
                .send(LinkEvent::Authenticated)
                .map_err(|_| Error::EventChannelClosed)?;

            self.start_ncps();
        }
        Ok(())
    }

    /// Brings the network layer up. Protocols not enabled by
    /// configuration still see the lower layer: without an Open they sit
    /// in `Closed` and answer the peer's requests with a Terminate-Ack.
    fn start_ncps(&mut self) {
        self.ncp_ticks = 0;

        self.ipcp.open();
        self.ipcp.up();

        if self.want_ipv6 {
            self.ipv6cp.open();
        }
        self.ipv6cp.up();

        if self.want_compression {
            self.ccp.open();
        }
        self.ccp.up();

        if self.want_encryption {
            self.ecp.open();
        }
        self.ecp.up();
    }

    /// Derives and installs the session keys once the encryption protocol
    /// has opened on an authenticated link.
    fn arm_encryption(&mut self) -> Result<()> {
        if !self.authenticated {
            return Ok(());
        }

        let material = self.auth_material.clone();
        let Some((secret, challenge, response)) = material else {
            // PAP and EAP-TLS leave no challenge/response pair to
            // derive keys from.
            println!("[warn] no key material, encryption stays off");

            if self.want_encryption {
                self.teardown(DownReason::NegotiationFailed);
            }
            return Ok(());
        };

        let (strength, stateless) = self
            .ecp
            .our_options()
            .iter()
            .find_map(|opt| match opt {
                EcpOpt::Mppe {
                    strength,
                    stateless,
                } => Some((*strength, *stateless)),
                _ => None,
            })
            .unwrap_or((self.strength, false));

        let keys = derive_keys(&secret, &challenge, &response, strength, stateless);
        self.encryption.install(keys);

        println!("[info] encryption armed, {:?}", strength);

        self.events
            .send(LinkEvent::Encrypted(strength))
            .map_err(|_| Error::EventChannelClosed)
    }

    fn echo_tick(&mut self) -> Result<()> {
        if !*self.lcp.opened().borrow() {
            return Ok(());
        }

        if self.echo_outstanding >= MAX_ECHO_OUTSTANDING {
            println!("[warn] peer stopped answering echo requests");
            self.teardown(DownReason::KeepaliveExpired);
            return Ok(());
        }

        // Keepalives carry our magic number. If the peer rejected it
        // the link stays up without them, loopback detection included.
        if self.magic().is_none() {
            return Ok(());
        }

        self.id_echo = self.id_echo.wrapping_add(1);
        self.echo_outstanding += 1;
        self.send_lcp(Packet::new(PacketType::EchoRequest, self.id_echo))
    }

    fn ncp_tick(&mut self) {
        if !self.authenticated || self.any_ncp_open() {
            return;
        }

        self.ncp_ticks += 1;
        if self.ncp_ticks > 1 {
            println!("[warn] no network protocol came up");
            self.teardown(DownReason::NcpTimeout);
        }
    }

    fn any_ncp_open(&self) -> bool {
        *self.ipcp.opened().borrow() || *self.ipv6cp.opened().borrow()
    }

    fn teardown(&mut self, reason: DownReason) {
        if self.pending_reason.is_none() {
            self.pending_reason = Some(reason);
        }
        self.lcp.close();
    }

    fn magic(&self) -> Option<u32> {
        self.lcp.our_options().iter().find_map(|opt| match opt {
            LcpOpt::MagicNumber(magic) => Some(*magic),
            _ => None,
        })
    }

    fn link_info(&self) -> LinkInfo {
        let mut info = LinkInfo::default();

        info.mru = self
            .lcp
            .our_options()
            .iter()
            .find_map(|opt| match opt {
                LcpOpt::Mru(mru) => Some(*mru),
                _ => None,
            })
            .unwrap_or(MRU);

        if *self.ccp.opened().borrow() {
            info.compression = self.ccp.our_options().iter().find_map(|opt| {
                Some(match opt {
                    CcpOpt::Deflate(_) => String::from("deflate"),
                    CcpOpt::BsdCompress(_) => String::from("bsd-compress"),
                    CcpOpt::Predictor1 => String::from("predictor-1"),
                    CcpOpt::Unhandled(_) => return None,
                })
            });
        }

        if *self.ipcp.opened().borrow() {
            let mut ipv4 = Ipv4Config::default();
            for opt in self.ipcp.our_options() {
                match opt {
                    IpcpOpt::IpAddr(addr) => ipv4.addr = *addr,
                    IpcpOpt::PrimaryDns(addr) => ipv4.dns1 = *addr,
                    IpcpOpt::SecondaryDns(addr) => ipv4.dns2 = *addr,
                    _ => {}
                }
            }
            for opt in self.ipcp.peer_options() {
                if let IpcpOpt::IpAddr(addr) = opt {
                    ipv4.peer_addr = *addr;
                }
            }
            info.ipv4 = Some(ipv4);
        }

        if *self.ipv6cp.opened().borrow() {
            let mut ipv6 = Ipv6Config::default();
            for opt in self.ipv6cp.our_options() {
                if let Ipv6cpOpt::InterfaceId(ifid) = opt {
                    ipv6.ifid = *ifid;
                }
            }
            for opt in self.ipv6cp.peer_options() {
                if let Ipv6cpOpt::InterfaceId(ifid) = opt {
                    ipv6.peer_ifid = *ifid;
                }
            }
            info.ipv6 = Some(ipv6);
        }

        info
    }
}

fn parse<O: ProtocolOption>(data: &[u8]) -> Result<Packet<O>> {
    Packet::from_frame(CpFrame::deserialize(data)?)
}

// Not derivable, the secret store is a trait object.
impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("username", &self.username)
            .field("authenticated", &self.authenticated)
            .field("peer_name", &self.peer_name)
            .finish_non_exhaustive()
    }
}
