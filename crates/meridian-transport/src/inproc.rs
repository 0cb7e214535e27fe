//! In-process transport backed by a global endpoint registry.
//!
//! Frames never leave the process: a bound endpoint owns the receive side
//! of an unbounded channel, and connecting peers clone the send side from
//! the registry. Connecting to a name nobody bound fails immediately with
//! `ConnectionRefused`, mirroring a dead TCP peer.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::mpsc;

use async_trait::async_trait;

use crate::{Transport, TransportError};

static ENDPOINTS: Lazy<DashMap<String, mpsc::UnboundedSender<Vec<u8>>>> = Lazy::new(DashMap::new);

pub struct InprocTransport {
    addr: String,
    bound: bool,
    incoming: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    peer: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl InprocTransport {
    /// `addr` is the full endpoint string, e.g. `inproc://busA`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            bound: false,
            incoming: None,
            peer: None,
        }
    }
}

#[async_trait]
impl Transport for InprocTransport {
    async fn bind(&mut self) -> Result<(), TransportError> {
        if ENDPOINTS.contains_key(&self.addr) {
            return Err(TransportError::AddrInUse(self.addr.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        ENDPOINTS.insert(self.addr.clone(), tx);
        self.incoming = Some(rx);
        self.bound = true;
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let tx = ENDPOINTS
            .get(&self.addr)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::ConnectionRefused(self.addr.clone()))?;
        self.peer = Some(tx);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let peer = self.peer.as_ref().ok_or(TransportError::NotConnected)?;
        peer.send(frame.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let incoming = self.incoming.as_mut().ok_or(TransportError::NotBound)?;
        incoming.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.bound {
            ENDPOINTS.remove(&self.addr);
            self.bound = false;
        }
        self.incoming = None;
        self.peer = None;
        Ok(())
    }
}

impl Drop for InprocTransport {
    fn drop(&mut self) {
        if self.bound {
            ENDPOINTS.remove(&self.addr);
        }
    }
}
