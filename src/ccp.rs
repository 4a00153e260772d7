//! Compression Control Protocol options as per RFC 1962, covering the
//! Deflate (RFC 1979), BSD-Compress (RFC 1977) and Predictor-1 (RFC 1978)
//! algorithms.

use crate::proto::ProtocolOption;
use crate::wire::{self, RawOption};

const OPT_PREDICTOR1: u8 = 1;
const OPT_BSD_COMPRESS: u8 = 21;
const OPT_DEFLATE: u8 = 26;

const BSD_VERSION: u8 = 1;
const DEFLATE_METHOD: u8 = 8;
const DEFLATE_CHECK: u8 = 0;

/// A Compression Control Protocol option.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CcpOpt {
    Predictor1,
    /// BSD-Compress with the given code word size in bits (9..=15).
    BsdCompress(u8),
    /// Deflate with the given window size exponent (8..=15).
    Deflate(u8),
    Unhandled(RawOption),
}

impl ProtocolOption for CcpOpt {
    const PROTOCOL: u16 = wire::CCP;

    fn kind(&self) -> u8 {
        match self {
            Self::Predictor1 => OPT_PREDICTOR1,
            Self::BsdCompress(_) => OPT_BSD_COMPRESS,
            Self::Deflate(_) => OPT_DEFLATE,
            Self::Unhandled(raw) => raw.kind,
        }
    }

    fn is_unknown(&self) -> bool {
        matches!(self, Self::Unhandled(..))
    }

    fn to_raw(&self) -> RawOption {
        match self {
            Self::Predictor1 => RawOption::new(OPT_PREDICTOR1, Vec::default()),
            Self::BsdCompress(bits) => {
                RawOption::new(OPT_BSD_COMPRESS, vec![(BSD_VERSION << 5) | (bits & 0x1f)])
            }
            Self::Deflate(window) => RawOption::new(
                OPT_DEFLATE,
                vec![(window << 4) | DEFLATE_METHOD, DEFLATE_CHECK],
            ),
            Self::Unhandled(raw) => raw.clone(),
        }
    }

    fn from_raw(raw: RawOption) -> Self {
        match (raw.kind, raw.value.as_slice()) {
            (OPT_PREDICTOR1, []) => Self::Predictor1,
            (OPT_BSD_COMPRESS, [value]) if value >> 5 == BSD_VERSION => {
                Self::BsdCompress(value & 0x1f)
            }
            (OPT_DEFLATE, [window_method, DEFLATE_CHECK])
                if window_method & 0x0f == DEFLATE_METHOD =>
            {
                Self::Deflate(window_method >> 4)
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
            CcpOpt::Predictor1,
            CcpOpt::BsdCompress(12),
            CcpOpt::Deflate(15),
        ] {
            assert_eq!(CcpOpt::from_raw(option.to_raw()), option);
        }
    }

    #[test]
    fn bad_deflate_method_is_unknown() {
        let raw = RawOption::new(OPT_DEFLATE, vec![0xf7, 0]); // method 7, not deflate
        assert!(CcpOpt::from_raw(raw).is_unknown());
    }
}
