mod error;
pub use error::*;

mod proto;
pub use proto::*;

mod supervisor;
pub use supervisor::*;

pub mod ccp;
pub mod chap;
pub mod crypto;
pub mod eap;
pub mod ecp;
pub mod ipcp;
pub mod ipv6cp;
pub mod lcp;
pub mod mppe;
pub mod pap;
pub mod secret;
pub mod wire;
