//! [`Transport`] over an axum WebSocket.
//!
//! Outbound frames go through a bounded channel to the session's writer
//! task, which owns the socket sink. Senders wait when the channel is full
//! so frames for one operation are never reordered or dropped.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, close_code};
use gqlws_core::errors::ProtocolError;
use gqlws_core::transport::{Transport, TransportError};
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound half of one WebSocket connection.
pub struct SocketTransport {
    tx: mpsc::Sender<Message>,
    closed: AtomicBool,
}

impl SocketTransport {
    /// Transport feeding the writer task behind `tx`.
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Whether `close()` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn push(&self, message: Message) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.push(Message::Text(text.into())).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "".into(),
        };
        if self.push(Message::Close(Some(frame))).await.is_err() {
            debug!("writer already gone, close frame dropped");
        }
    }

    /// Errors travel as a `"<code>: <message>"` text frame.
    async fn signal_error(&self, error: &ProtocolError) {
        if self.is_closed() {
            return;
        }
        if self.push(Message::Text(error.notice().into())).await.is_err() {
            debug!(code = %error.code(), "writer gone, error notice dropped");
        }
    }
}
