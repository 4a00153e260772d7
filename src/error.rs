use std::io;

use tokio::sync::watch;

use thiserror::Error;

/// An external error that prevents a supervisor from functioning.
#[derive(Debug, Error)]
pub enum Error {
    #[error("packet transport channel is closed")]
    TransportClosed,
    #[error("link event channel is closed")]
    EventChannelClosed,

    #[error("packet truncated: want at least {want} bytes, got {got}")]
    Truncated { want: usize, got: usize },
    #[error("length field {0} inconsistent with packet size")]
    BadLength(u16),
    #[error("option length field {0} out of bounds")]
    BadOptionLength(u8),
    #[error("duplicate option type {0} in one configure packet")]
    DuplicateOption(u8),
    #[error("string field is not valid utf-8")]
    BadString,
    #[error("field of {0} bytes does not fit one length byte")]
    FieldTooLong(usize),

    #[error("no secret configured for peer {0}")]
    NoSecret(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("json (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("error receiving from tokio watch channel: {0}")]
    WatchRecv(#[from] watch::error::RecvError),
    #[error("error joining tokio task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// An alias for a [`std::result::Result`] with the [`enum@Error`] type of this crate.
pub type Result<T> = std::result::Result<T, Error>;
