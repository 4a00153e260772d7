//! Encryption Control Protocol options as per RFC 1968, carrying an
//! MPPE-style cipher selection bitfield (RFC 3078 section 2).

use crate::mppe::KeyStrength;
use crate::proto::ProtocolOption;
use crate::wire::{self, RawOption};

const OPT_MPPE: u8 = 18;

const MPPE_H: u32 = 0x0100_0000; // stateless mode
const MPPE_L: u32 = 0x0000_0020; // 40-bit session keys
const MPPE_S: u32 = 0x0000_0040; // 128-bit session keys

/// An Encryption Control Protocol option.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EcpOpt {
    Mppe {
        strength: KeyStrength,
        stateless: bool,
    },
    Unhandled(RawOption),
}

impl ProtocolOption for EcpOpt {
    const PROTOCOL: u16 = wire::ECP;

    fn kind(&self) -> u8 {
        match self {
            Self::Mppe { .. } => OPT_MPPE,
            Self::Unhandled(raw) => raw.kind,
        }
    }

    fn is_unknown(&self) -> bool {
        matches!(self, Self::Unhandled(..))
    }

    fn to_raw(&self) -> RawOption {
        match self {
            Self::Mppe {
                strength,
                stateless,
            } => {
                let mut bits = match strength {
                    KeyStrength::Bits40 => MPPE_L,
                    KeyStrength::Bits128 => MPPE_S,
                };
                if *stateless {
                    bits |= MPPE_H;
                }

                RawOption::new(OPT_MPPE, bits.to_be_bytes().to_vec())
            }
            Self::Unhandled(raw) => raw.clone(),
        }
    }

    fn from_raw(raw: RawOption) -> Self {
        match (raw.kind, raw.value.as_slice()) {
            (OPT_MPPE, &[b0, b1, b2, b3]) => {
                let bits = u32::from_be_bytes([b0, b1, b2, b3]);
                let stateless = bits & MPPE_H != 0;

                // Exactly one strength bit must be set.
                match (bits & MPPE_S != 0, bits & MPPE_L != 0) {
                    (true, false) => Self::Mppe {
                        strength: KeyStrength::Bits128,
                        stateless,
                    },
                    (false, true) => Self::Mppe {
                        strength: KeyStrength::Bits40,
                        stateless,
                    },
                    _ => Self::Unhandled(raw),
                }
            }
            _ => Self::Unhandled(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_round_trip() {
        for option in [
            EcpOpt::Mppe {
                strength: KeyStrength::Bits128,
                stateless: false,
            },
            EcpOpt::Mppe {
                strength: KeyStrength::Bits40,
                stateless: true,
            },
        ] {
            assert_eq!(EcpOpt::from_raw(option.to_raw()), option);
        }
    }

    #[test]
    fn ambiguous_strength_is_unknown() {
        // Both strength bits set at once.
        let raw = RawOption::new(18, (MPPE_S | MPPE_L).to_be_bytes().to_vec());
        assert!(EcpOpt::from_raw(raw).is_unknown());

        // No strength bit at all.
        let raw = RawOption::new(18, MPPE_H.to_be_bytes().to_vec());
        assert!(EcpOpt::from_raw(raw).is_unknown());
    }
}
