//! Bus error type.

use std::time::Duration;

use thiserror::Error;

use meridian_protocol::CodecError;
use meridian_transport::TransportError;
use meridian_url::UrlError;

#[derive(Debug, Error)]
pub enum BusError {
    /// The bus has been shut down; blocked callers are woken with this.
    #[error("bus is dead")]
    BusDead,

    /// A bounded wait on a response elapsed.
    #[error("timed out after {0:?} waiting for a response")]
    Timeout(Duration),

    /// `run` was called while a dispatch loop already owns the inbound
    /// transport.
    #[error("bus is already running")]
    AlreadyRunning,

    /// A reply queue yielded a message kind that cannot answer the call
    /// that was waiting on it.
    #[error("unexpected {0} message on a reply queue")]
    Unexpected(&'static str),

    #[error(transparent)]
    Url(#[from] UrlError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
