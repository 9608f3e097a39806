//! Transport capability consumed by both engines.
//!
//! A transport is any ordered duplex text channel. Outbound it offers
//! [`Transport::send`], [`Transport::close`] and [`Transport::signal_error`];
//! inbound it is a plain stream of [`InboundFrame`]s handed to the engine's
//! receive loop.
//!
//! Engines never own the transport. They hold a [`TransportHandle`], a weak
//! reference that turns every outbound call into a silent no-op once the
//! owner has dropped the transport.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};

use crate::errors::ProtocolError;
use crate::messages::WireMessage;

/// Failure to hand a frame to the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport was closed.
    #[error("transport closed")]
    Closed,
    /// The underlying channel rejected the frame.
    #[error("send failed: {0}")]
    Send(String),
}

/// Outbound side of a framed duplex text channel.
///
/// Implementations must be safe to call concurrently: operation tasks send
/// `data` frames while the dispatch path sends acks and errors.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame.
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Close the channel. Idempotent.
    async fn close(&self);

    /// Surface a protocol error to the peer.
    ///
    /// Delivery is the transport's concern; the engine does not retry.
    async fn signal_error(&self, error: &ProtocolError);
}

/// One inbound frame as delivered by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    /// Text frame.
    Text(String),
    /// Binary frame; accepted if it holds UTF-8 text.
    Binary(Vec<u8>),
}

impl InboundFrame {
    /// Extract the frame's text, failing with `invalidEncoding` for non-UTF-8 bytes.
    pub fn into_text(self) -> Result<String, ProtocolError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Binary(bytes) => {
                String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidEncoding)
            }
        }
    }
}

impl From<String> for InboundFrame {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for InboundFrame {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

/// Non-owning handle to a transport.
///
/// Cheap to clone; every clone refers to the same transport. Calls made
/// after the transport is dropped do nothing.
#[derive(Clone)]
pub struct TransportHandle {
    inner: Weak<dyn Transport>,
}

impl TransportHandle {
    /// Create a handle that does not keep `transport` alive.
    pub fn new<T: Transport + 'static>(transport: &Arc<T>) -> Self {
        let weak: Weak<T> = Arc::downgrade(transport);
        Self { inner: weak }
    }

    /// Create a handle from a type-erased transport.
    pub fn from_dyn(transport: &Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::downgrade(transport),
        }
    }

    /// Whether the transport still exists.
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Send a raw text frame. Returns `false` if nothing was sent.
    pub async fn send_text(&self, text: String) -> bool {
        let Some(transport) = self.inner.upgrade() else {
            trace!("transport gone, dropping outbound frame");
            return false;
        };
        match transport.send(text).await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "outbound frame not delivered");
                false
            }
        }
    }

    /// Encode and send a message. Returns `false` if nothing was sent.
    pub async fn send<M: WireMessage + Sync>(&self, message: &M) -> bool {
        self.send_text(message.to_frame()).await
    }

    /// Close the transport if it still exists.
    pub async fn close(&self) {
        if let Some(transport) = self.inner.upgrade() {
            transport.close().await;
        }
    }

    /// Signal a protocol error if the transport still exists.
    pub async fn signal_error(&self, error: &ProtocolError) {
        if let Some(transport) = self.inner.upgrade() {
            transport.signal_error(error).await;
        }
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}
