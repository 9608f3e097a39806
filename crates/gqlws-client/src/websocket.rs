//! WebSocket connection to a `graphql-ws` server over `tokio-tungstenite`.
//!
//! [`connect`] performs the upgrade requesting the `graphql-ws`
//! subprotocol and splits the socket: outbound frames go through a
//! [`WsTransport`] to a writer task, inbound frames come out as a stream
//! of [`InboundFrame`]s ready for [`crate::ClientEngine::run`].

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt, future};
use gqlws_core::SUBPROTOCOL;
use gqlws_core::errors::ProtocolError;
use gqlws_core::transport::{InboundFrame, Transport, TransportError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};

use crate::ClientError;

/// Capacity of the outbound frame queue.
const OUTBOUND_BUFFER: usize = 256;

/// Inbound frames from the server.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundFrame> + Send>>;

/// Outbound half of a client WebSocket connection.
pub struct WsTransport {
    tx: mpsc::Sender<Message>,
    closed: AtomicBool,
}

impl WsTransport {
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
impl Transport for WsTransport {
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
            code: CloseCode::Normal,
            reason: "".into(),
        };
        if self.push(Message::Close(Some(frame))).await.is_err() {
            debug!("writer already gone, close frame dropped");
        }
    }

    async fn signal_error(&self, error: &ProtocolError) {
        if self.is_closed() {
            return;
        }
        if self.push(Message::Text(error.notice().into())).await.is_err() {
            debug!(code = %error.code(), "writer gone, error notice dropped");
        }
    }
}

/// An established client connection.
pub struct WsConnection {
    /// Outbound side. Engines hold only a weak handle to it.
    pub transport: std::sync::Arc<WsTransport>,
    /// Inbound frames; ends on close frame or socket error.
    pub inbound: InboundStream,
    /// Subprotocol the server selected.
    pub subprotocol: Option<String>,
    /// Task draining the outbound queue into the socket.
    pub writer: JoinHandle<()>,
}

fn inbound_frame(message: Message) -> Option<InboundFrame> {
    match message {
        Message::Text(text) => Some(InboundFrame::Text(text.as_str().to_owned())),
        Message::Binary(bytes) => Some(InboundFrame::Binary(bytes.to_vec())),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
    }
}

/// Connect to `url`, requesting the `graphql-ws` subprotocol.
///
/// Fails if the server refuses the upgrade or selects another subprotocol.
pub async fn connect(url: &str) -> Result<WsConnection, ClientError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
    let _ = request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));

    let (socket, response) = match connect_async(request).await {
        Ok(connected) => connected,
        Err(WsError::Http(response)) => {
            return Err(ClientError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Err(e) => return Err(ClientError::Handshake(Box::new(e))),
    };

    let subprotocol = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if subprotocol.as_deref() != Some(SUBPROTOCOL) {
        return Err(ClientError::SubprotocolNotAccepted(subprotocol));
    }
    info!(url, "connected to graphql-ws server");

    let (mut ws_tx, ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let inbound = ws_rx
        .take_while(|message| future::ready(matches!(message, Ok(m) if !m.is_close())))
        .filter_map(|message| future::ready(message.ok().and_then(inbound_frame)));

    Ok(WsConnection {
        transport: std::sync::Arc::new(WsTransport {
            tx,
            closed: AtomicBool::new(false),
        }),
        inbound: Box::pin(inbound),
        subprotocol,
        writer,
    })
}
