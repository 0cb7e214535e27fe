//! TCP transport with push/pull semantics.
//!
//! A bound transport accepts any number of inbound connections and fans
//! every connection's frames into one receive channel, so the bus sees a
//! single ordered-enough stream regardless of how many peers talk to it.
//! A connected transport writes frames on one outbound stream.

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use async_trait::async_trait;

use crate::frame::{read_frame, write_frame};
use crate::{Transport, TransportError};

pub struct TcpTransport {
    addr: String,
    cancel: CancellationToken,
    incoming: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    writer: Option<OwnedWriteHalf>,
}

impl TcpTransport {
    /// `addr` is a bare `host:port` netloc.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            cancel: CancellationToken::new(),
            incoming: None,
            writer: None,
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        frames: mpsc::UnboundedSender<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "tcp: connection accepted");
                        tokio::spawn(Self::read_loop(stream, frames.clone(), cancel.clone()));
                    }
                    Err(e) => {
                        warn!("tcp: accept failed: {e}");
                    }
                },
            }
        }
    }

    async fn read_loop(
        mut stream: TcpStream,
        frames: mpsc::UnboundedSender<Vec<u8>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_frame(&mut stream) => match frame {
                    Ok(payload) => {
                        if frames.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("tcp: connection closed: {e}");
                        break;
                    }
                },
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(&mut self) -> Result<(), TransportError> {
        let listener =
            TcpListener::bind(&self.addr)
                .await
                .map_err(|source| TransportError::Bind {
                    addr: self.addr.clone(),
                    source,
                })?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::accept_loop(listener, tx, self.cancel.clone()));
        self.incoming = Some(rx);
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let stream =
            TcpStream::connect(&self.addr)
                .await
                .map_err(|source| TransportError::Connect {
                    addr: self.addr.clone(),
                    source,
                })?;

        let (read, write) = stream.into_split();
        // outbound connections never read; the write half keeps the
        // socket open on its own
        drop(read);
        self.writer = Some(write);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::NotConnected)?;
        write_frame(writer, frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let incoming = self.incoming.as_mut().ok_or(TransportError::NotBound)?;
        incoming.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.cancel.cancel();
        self.incoming = None;
        self.writer = None;
        Ok(())
    }
}
