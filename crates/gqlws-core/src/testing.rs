//! In-memory transport for tests.
//!
//! [`MemoryTransport`] records every outbound call in order on an unbounded
//! channel; the paired [`MemoryPeer`] reads them back. Used by the engine
//! test suites of every crate in the workspace.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{ErrorNotice, ProtocolError};
use crate::messages::{ClientMessage, ServerMessage};
use crate::transport::{Transport, TransportError};

/// How long [`MemoryPeer::next`] waits before giving up.
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// One recorded outbound call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// `send(text)`
    Text(String),
    /// `signal_error(error)`
    Error(ErrorNotice),
    /// `close()`
    Closed,
}

impl Outbound {
    /// Wire form of a signaled error.
    pub fn notice(&self) -> Option<String> {
        match self {
            Self::Error(notice) => Some(notice.to_string()),
            _ => None,
        }
    }

    /// Decode a text frame as a server message.
    pub fn server_message(&self) -> Option<ServerMessage> {
        match self {
            Self::Text(text) => ServerMessage::decode(text).ok(),
            _ => None,
        }
    }

    /// Decode a text frame as a client message.
    pub fn client_message(&self) -> Option<ClientMessage> {
        match self {
            Self::Text(text) => ClientMessage::decode(text).ok(),
            _ => None,
        }
    }
}

/// Transport that records outbound calls instead of writing to a socket.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Create a transport and the peer that observes it.
    pub fn pair() -> (Arc<Self>, MemoryPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            tx,
            closed: AtomicBool::new(false),
        });
        (transport, MemoryPeer { rx })
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(Outbound::Text(text))
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Closed);
        }
    }

    async fn signal_error(&self, error: &ProtocolError) {
        let _ = self.tx.send(Outbound::Error(ErrorNotice::from(error)));
    }
}

/// Observer side of a [`MemoryTransport`].
pub struct MemoryPeer {
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl MemoryPeer {
    /// Next recorded call, or `None` after a short timeout.
    pub async fn next(&mut self) -> Option<Outbound> {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next recorded call decoded as a server message.
    pub async fn next_server_message(&mut self) -> Option<ServerMessage> {
        self.next().await.as_ref().and_then(Outbound::server_message)
    }

    /// Every call recorded so far, without waiting.
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }
}
