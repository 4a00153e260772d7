//! Link Control Protocol options as per RFC 1661 section 6.

use crate::proto::ProtocolOption;
use crate::wire::{self, RawOption};

const OPT_MRU: u8 = 1;
const OPT_AUTH_PROTOCOL: u8 = 3;
const OPT_QUALITY_PROTOCOL: u8 = 4;
const OPT_MAGIC_NUMBER: u8 = 5;
const OPT_PFC: u8 = 7;
const OPT_ACFC: u8 = 8;

const CHAP_MD5: u8 = 5;

/// An authentication protocol selectable via the LCP
/// Authentication-Protocol option.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthProto {
    Pap,
    ChapMd5,
    Eap,
}

/// A Link Control Protocol option.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LcpOpt {
    Mru(u16),
    AuthenticationProtocol(AuthProto),
    QualityProtocol(u16),
    MagicNumber(u32),
    ProtocolFieldCompression,
    AddrCtlFieldCompression,
    Unhandled(RawOption),
}

impl ProtocolOption for LcpOpt {
    const PROTOCOL: u16 = wire::LCP;

    fn kind(&self) -> u8 {
        match self {
            Self::Mru(_) => OPT_MRU,
            Self::AuthenticationProtocol(_) => OPT_AUTH_PROTOCOL,
            Self::QualityProtocol(_) => OPT_QUALITY_PROTOCOL,
            Self::MagicNumber(_) => OPT_MAGIC_NUMBER,
            Self::ProtocolFieldCompression => OPT_PFC,
            Self::AddrCtlFieldCompression => OPT_ACFC,
            Self::Unhandled(raw) => raw.kind,
        }
    }

    fn is_unknown(&self) -> bool {
        matches!(self, Self::Unhandled(..))
    }

    fn to_raw(&self) -> RawOption {
        match self {
            Self::Mru(mru) => RawOption::new(OPT_MRU, mru.to_be_bytes().to_vec()),
            Self::AuthenticationProtocol(auth) => {
                let value = match auth {
                    AuthProto::Pap => wire::PAP.to_be_bytes().to_vec(),
                    AuthProto::ChapMd5 => {
                        let mut value = wire::CHAP.to_be_bytes().to_vec();
                        value.push(CHAP_MD5);
                        value
                    }
                    AuthProto::Eap => wire::EAP.to_be_bytes().to_vec(),
                };
                RawOption::new(OPT_AUTH_PROTOCOL, value)
            }
            Self::QualityProtocol(protocol) => {
                RawOption::new(OPT_QUALITY_PROTOCOL, protocol.to_be_bytes().to_vec())
            }
            Self::MagicNumber(magic) => {
                RawOption::new(OPT_MAGIC_NUMBER, magic.to_be_bytes().to_vec())
            }
            Self::ProtocolFieldCompression => RawOption::new(OPT_PFC, Vec::default()),
            Self::AddrCtlFieldCompression => RawOption::new(OPT_ACFC, Vec::default()),
            Self::Unhandled(raw) => raw.clone(),
        }
    }

    fn from_raw(raw: RawOption) -> Self {
        match (raw.kind, raw.value.as_slice()) {
            (OPT_MRU, [hi, lo]) => Self::Mru(u16::from_be_bytes([*hi, *lo])),
            (OPT_AUTH_PROTOCOL, value) if value.len() >= 2 => {
                match (u16::from_be_bytes([value[0], value[1]]), &value[2..]) {
                    (wire::PAP, []) => Self::AuthenticationProtocol(AuthProto::Pap),
                    (wire::CHAP, [CHAP_MD5]) => Self::AuthenticationProtocol(AuthProto::ChapMd5),
                    (wire::EAP, []) => Self::AuthenticationProtocol(AuthProto::Eap),
                    // CHAP with an unsupported algorithm or an auth protocol
                    // we do not implement.
                    _ => Self::Unhandled(raw),
                }
            }
            (OPT_QUALITY_PROTOCOL, [hi, lo]) => {
                Self::QualityProtocol(u16::from_be_bytes([*hi, *lo]))
            }
            (OPT_MAGIC_NUMBER, [b0, b1, b2, b3]) => {
                Self::MagicNumber(u32::from_be_bytes([*b0, *b1, *b2, *b3]))
            }
            (OPT_PFC, []) => Self::ProtocolFieldCompression,
            (OPT_ACFC, []) => Self::AddrCtlFieldCompression,
            _ => Self::Unhandled(raw),
        }
    }
}
