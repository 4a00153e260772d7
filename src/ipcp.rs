//! IP Control Protocol options as per RFC 1332, with the DNS extensions
//! of RFC 1877.

use std::net::Ipv4Addr;

use crate::proto::ProtocolOption;
use crate::wire::{self, RawOption};

const OPT_IP_COMPRESSION: u8 = 2;
const OPT_IP_ADDR: u8 = 3;
const OPT_PRIMARY_DNS: u8 = 129;
const OPT_SECONDARY_DNS: u8 = 131;

/// An IP Control Protocol option.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IpcpOpt {
    IpCompressionProtocol(u16),
    IpAddr(Ipv4Addr),
    PrimaryDns(Ipv4Addr),
    SecondaryDns(Ipv4Addr),
    Unhandled(RawOption),
}

impl ProtocolOption for IpcpOpt {
    const PROTOCOL: u16 = wire::IPCP;

    fn kind(&self) -> u8 {
        match self {
            Self::IpCompressionProtocol(_) => OPT_IP_COMPRESSION,
            Self::IpAddr(_) => OPT_IP_ADDR,
            Self::PrimaryDns(_) => OPT_PRIMARY_DNS,
            Self::SecondaryDns(_) => OPT_SECONDARY_DNS,
            Self::Unhandled(raw) => raw.kind,
        }
    }

    fn is_unknown(&self) -> bool {
        matches!(self, Self::Unhandled(..))
    }

    fn to_raw(&self) -> RawOption {
        match self {
            Self::IpCompressionProtocol(protocol) => {
                RawOption::new(OPT_IP_COMPRESSION, protocol.to_be_bytes().to_vec())
            }
            Self::IpAddr(addr) => RawOption::new(OPT_IP_ADDR, addr.octets().to_vec()),
            Self::PrimaryDns(addr) => RawOption::new(OPT_PRIMARY_DNS, addr.octets().to_vec()),
            Self::SecondaryDns(addr) => RawOption::new(OPT_SECONDARY_DNS, addr.octets().to_vec()),
            Self::Unhandled(raw) => raw.clone(),
        }
    }

    fn from_raw(raw: RawOption) -> Self {
        match (raw.kind, raw.value.as_slice()) {
            (OPT_IP_COMPRESSION, value) if value.len() >= 2 => {
                Self::IpCompressionProtocol(u16::from_be_bytes([value[0], value[1]]))
            }
            (OPT_IP_ADDR, &[a, b, c, d]) => Self::IpAddr(Ipv4Addr::new(a, b, c, d)),
            (OPT_PRIMARY_DNS, &[a, b, c, d]) => Self::PrimaryDns(Ipv4Addr::new(a, b, c, d)),
            (OPT_SECONDARY_DNS, &[a, b, c, d]) => Self::SecondaryDns(Ipv4Addr::new(a, b, c, d)),
            _ => Self::Unhandled(raw),
        }
    }
}
