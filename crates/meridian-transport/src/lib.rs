//! Pluggable frame transports for the meridian bus.
//!
//! The bus only requires the small [`Transport`] capability: bind a
//! listening endpoint, connect to a peer, exchange whole frames, close.
//! Scheme-specific logic lives exclusively in [`create_transport`].

pub mod frame;
mod inproc;
mod tcp;

use std::io;

use async_trait::async_trait;
use thiserror::Error;

pub use inproc::InprocTransport;
pub use tcp::TcpTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unsupported scheme in '{0}'")]
    UnsupportedScheme(String),

    #[error("bind failed on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("connect failed to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("endpoint '{0}' refused the connection")]
    ConnectionRefused(String),

    #[error("endpoint '{0}' is already bound")]
    AddrInUse(String),

    #[error("transport is not bound")]
    NotBound,

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Capability interface consumed by the bus.
///
/// Whole-frame semantics: one `send` produces exactly one `recv` on the
/// peer, and framing is the transport's responsibility. A transport is
/// either bound (server side) or connected (client side), never both.
#[async_trait]
pub trait Transport: Send {
    /// Begin listening at the configured address. Called once per instance.
    async fn bind(&mut self) -> Result<(), TransportError>;

    /// Establish outbound readiness to the configured peer address.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Send one whole frame.
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive one whole frame. Awaitable; cancel-safe so the bus can
    /// multiplex it against its shutdown signal.
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Release underlying resources. Safe to call once.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Select a concrete transport from an endpoint's scheme.
///
/// Accepts a bus string (`tcp://host:port`, `inproc://name`); any path
/// suffix is ignored. A missing scheme defaults to tcp.
pub fn create_transport(url: &str) -> Result<Box<dyn Transport>, TransportError> {
    let (scheme, rest) = url.split_once("://").unwrap_or(("tcp", url));
    let netloc = rest.split('/').next().unwrap_or(rest);

    match scheme {
        "tcp" => Ok(Box::new(TcpTransport::new(netloc))),
        "inproc" => Ok(Box::new(InprocTransport::new(format!("inproc://{netloc}")))),
        _ => Err(TransportError::UnsupportedScheme(url.to_string())),
    }
}
