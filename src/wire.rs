//! Wire codec for PPP control protocol packets.
//!
//! All control protocols share one header layout: a 1-byte code, a 1-byte
//! identifier and a 2-byte big endian length that includes the header itself.
//! Configure packets carry a sequence of type-length-value option descriptors.

use crate::{Error, Result};

pub const LCP: u16 = 0xc021;
pub const PAP: u16 = 0xc023;
pub const CHAP: u16 = 0xc223;
pub const EAP: u16 = 0xc227;
pub const IPCP: u16 = 0x8021;
pub const IPV6CP: u16 = 0x8057;
pub const CCP: u16 = 0x80fd;
pub const ECP: u16 = 0x8053;

pub const CONFIGURE_REQUEST: u8 = 1;
pub const CONFIGURE_ACK: u8 = 2;
pub const CONFIGURE_NAK: u8 = 3;
pub const CONFIGURE_REJECT: u8 = 4;
pub const TERMINATE_REQUEST: u8 = 5;
pub const TERMINATE_ACK: u8 = 6;
pub const CODE_REJECT: u8 = 7;
pub const PROTOCOL_REJECT: u8 = 8;
pub const ECHO_REQUEST: u8 = 9;
pub const ECHO_REPLY: u8 = 10;
pub const DISCARD_REQUEST: u8 = 11;

/// A control protocol packet with the code-specific payload left opaque.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CpFrame {
    pub code: u8,
    pub identifier: u8,
    pub payload: Vec<u8>,
}

impl CpFrame {
    pub fn new(code: u8, identifier: u8, payload: Vec<u8>) -> Self {
        Self {
            code,
            identifier,
            payload,
        }
    }

    /// Appends the wire encoding of the frame to `buf`.
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        let length = (4 + self.payload.len()) as u16;

        buf.push(self.code);
        buf.push(self.identifier);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Parses a frame from `buf`. Trailing padding beyond the length field
    /// is permitted and discarded, anything shorter than the header is not.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::Truncated {
                want: 4,
                got: buf.len(),
            });
        }

        let length = u16::from_be_bytes([buf[2], buf[3]]);
        if length < 4 || length as usize > buf.len() {
            return Err(Error::BadLength(length));
        }

        Ok(Self {
            code: buf[0],
            identifier: buf[1],
            payload: buf[4..length as usize].to_vec(),
        })
    }
}

/// A single option descriptor before protocol-specific interpretation:
/// a 1-byte type, a 1-byte length including both header bytes and a value.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawOption {
    pub kind: u8,
    pub value: Vec<u8>,
}

impl RawOption {
    pub fn new(kind: u8, value: Vec<u8>) -> Self {
        Self { kind, value }
    }
}

/// Parses a configure payload into its option descriptors.
/// Option types must be unique within one packet.
pub fn parse_options(payload: &[u8]) -> Result<Vec<RawOption>> {
    let mut options = Vec::new();
    let mut rest = payload;

    while !rest.is_empty() {
        if rest.len() < 2 {
            return Err(Error::Truncated {
                want: 2,
                got: rest.len(),
            });
        }

        let kind = rest[0];
        let length = rest[1];
        if length < 2 || length as usize > rest.len() {
            return Err(Error::BadOptionLength(length));
        }

        if options.iter().any(|option: &RawOption| option.kind == kind) {
            return Err(Error::DuplicateOption(kind));
        }

        options.push(RawOption {
            kind,
            value: rest[2..length as usize].to_vec(),
        });
        rest = &rest[length as usize..];
    }

    Ok(options)
}

/// Appends the wire encoding of a sequence of option descriptors to `buf`,
/// preserving order.
pub fn emit_options(options: &[RawOption], buf: &mut Vec<u8>) {
    for option in options {
        buf.push(option.kind);
        buf.push((2 + option.value.len()) as u8);
        buf.extend_from_slice(&option.value);
    }
}

/// A PAP Authenticate-Request payload as per RFC 1334 section 2.1.1.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AuthRequest {
    pub peer_id: String,
    pub passwd: String,
}

impl AuthRequest {
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<()> {
        push_string(&self.peer_id, buf)?;
        push_string(&self.passwd, buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let (peer_id, rest) = take_string(buf)?;
        let (passwd, rest) = take_string(rest)?;

        if !rest.is_empty() {
            return Err(Error::BadLength(rest.len() as u16));
        }

        Ok(Self { peer_id, passwd })
    }
}

/// A PAP Authenticate-Ack or Authenticate-Nak payload carrying a
/// human readable message.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AuthReply {
    pub message: String,
}

impl AuthReply {
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<()> {
        push_string(&self.message, buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        // Some implementations omit the message entirely.
        if buf.is_empty() {
            return Ok(Self::default());
        }

        let (message, _) = take_string(buf)?;
        Ok(Self { message })
    }
}

/// A CHAP Challenge or Response payload as per RFC 1994 section 4.1.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ChapValue {
    pub value: Vec<u8>,
    pub name: String,
}

impl ChapValue {
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.value.len() > u8::MAX as usize {
            return Err(Error::FieldTooLong(self.value.len()));
        }

        buf.push(self.value.len() as u8);
        buf.extend_from_slice(&self.value);
        buf.extend_from_slice(self.name.as_bytes());
        Ok(())
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::Truncated { want: 1, got: 0 });
        }

        let value_size = buf[0] as usize;
        if buf.len() < 1 + value_size {
            return Err(Error::Truncated {
                want: 1 + value_size,
                got: buf.len(),
            });
        }

        Ok(Self {
            value: buf[1..1 + value_size].to_vec(),
            name: String::from_utf8(buf[1 + value_size..].to_vec())
                .map_err(|_| Error::BadString)?,
        })
    }
}

fn push_string(s: &str, buf: &mut Vec<u8>) -> Result<()> {
    if s.len() > u8::MAX as usize {
        return Err(Error::FieldTooLong(s.len()));
    }

    buf.push(s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn take_string(buf: &[u8]) -> Result<(String, &[u8])> {
    if buf.is_empty() {
        return Err(Error::Truncated { want: 1, got: 0 });
    }

    let len = buf[0] as usize;
    if buf.len() < 1 + len {
        return Err(Error::Truncated {
            want: 1 + len,
            got: buf.len(),
        });
    }

    let s = String::from_utf8(buf[1..1 + len].to_vec()).map_err(|_| Error::BadString)?;
    Ok((s, &buf[1 + len..]))
}
