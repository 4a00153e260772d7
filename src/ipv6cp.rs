//! IPv6 Control Protocol options as per RFC 5072.

use crate::proto::ProtocolOption;
use crate::wire::{self, RawOption};

const OPT_INTERFACE_ID: u8 = 1;

/// An IPv6 Control Protocol option.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Ipv6cpOpt {
    InterfaceId(u64),
    Unhandled(RawOption),
}

impl ProtocolOption for Ipv6cpOpt {
    const PROTOCOL: u16 = wire::IPV6CP;

    fn kind(&self) -> u8 {
        match self {
            Self::InterfaceId(_) => OPT_INTERFACE_ID,
            Self::Unhandled(raw) => raw.kind,
        }
    }

    fn is_unknown(&self) -> bool {
        matches!(self, Self::Unhandled(..))
    }

    fn to_raw(&self) -> RawOption {
        match self {
            Self::InterfaceId(ifid) => {
                RawOption::new(OPT_INTERFACE_ID, ifid.to_be_bytes().to_vec())
            }
            Self::Unhandled(raw) => raw.clone(),
        }
    }

    fn from_raw(raw: RawOption) -> Self {
        match (raw.kind, raw.value.as_slice()) {
            (OPT_INTERFACE_ID, value) if value.len() == 8 => {
                let mut ifid = [0; 8];
                ifid.copy_from_slice(value);
                Self::InterfaceId(u64::from_be_bytes(ifid))
            }
            _ => Self::Unhandled(raw),
        }
    }
}
