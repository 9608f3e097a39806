//! Client side of the `graphql-ws` subprotocol.
//!
//! [`ClientEngine`] decodes server frames and routes them to a
//! [`ClientHandler`]. Every handler method receives a [`ClientSender`] so
//! it can answer (e.g. send `start` from `on_connection_ack`).

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use gqlws_core::errors::{ErrorNotice, ProtocolError};
use gqlws_core::graphql::{GraphQLError, GraphQLRequest, GraphQLResult, Payload};
use gqlws_core::messages::{ClientMessage, ServerMessage};
use gqlws_core::transport::{InboundFrame, TransportHandle};
use tracing::{debug, warn};

/// Outbound operations available to the application and its handler.
#[derive(Clone, Debug)]
pub struct ClientSender {
    transport: TransportHandle,
}

impl ClientSender {
    /// Sender writing to `transport`.
    pub fn new(transport: TransportHandle) -> Self {
        Self { transport }
    }

    /// Send `connection_init`. Returns `false` if nothing was sent.
    pub async fn send_connection_init(&self, payload: Option<Payload>) -> bool {
        self.transport
            .send(&ClientMessage::connection_init(payload))
            .await
    }

    /// Send `start` for `id`.
    pub async fn send_start(&self, id: impl Into<String>, request: GraphQLRequest) -> bool {
        self.transport
            .send(&ClientMessage::start(id, request))
            .await
    }

    /// Send `stop` for `id`.
    pub async fn send_stop(&self, id: impl Into<String>) -> bool {
        self.transport.send(&ClientMessage::stop(id)).await
    }

    /// Send `connection_terminate`.
    pub async fn send_connection_terminate(&self) -> bool {
        self.transport
            .send(&ClientMessage::ConnectionTerminate)
            .await
    }

    /// Close the transport.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}

/// Callbacks for server messages. Every method defaults to a no-op.
///
/// For each decoded message [`ClientHandler::on_message`] runs first, then
/// the method matching its type.
#[async_trait]
#[allow(unused_variables)]
pub trait ClientHandler: Send + Sync {
    /// Any decoded server message.
    async fn on_message(&self, sender: &ClientSender, message: &ServerMessage) {}

    /// `connection_ack`
    async fn on_connection_ack(&self, sender: &ClientSender, payload: Option<Payload>) {}

    /// `connection_error`
    async fn on_connection_error(&self, sender: &ClientSender, payload: Option<Payload>) {}

    /// `ka`
    async fn on_keep_alive(&self, sender: &ClientSender, payload: Option<Payload>) {}

    /// `data` for operation `id`.
    async fn on_data(&self, sender: &ClientSender, id: String, result: GraphQLResult) {}

    /// `error` for operation `id`; terminal for the id.
    async fn on_error(&self, sender: &ClientSender, id: String, errors: Vec<GraphQLError>) {}

    /// `complete` for operation `id`.
    async fn on_complete(&self, sender: &ClientSender, id: String) {}

    /// Out-of-band `44xx` error notice from the server.
    async fn on_error_notice(&self, sender: &ClientSender, notice: ErrorNotice) {}
}

#[async_trait]
impl<H: ClientHandler + ?Sized> ClientHandler for Arc<H> {
    async fn on_message(&self, sender: &ClientSender, message: &ServerMessage) {
        (**self).on_message(sender, message).await;
    }

    async fn on_connection_ack(&self, sender: &ClientSender, payload: Option<Payload>) {
        (**self).on_connection_ack(sender, payload).await;
    }

    async fn on_connection_error(&self, sender: &ClientSender, payload: Option<Payload>) {
        (**self).on_connection_error(sender, payload).await;
    }

    async fn on_keep_alive(&self, sender: &ClientSender, payload: Option<Payload>) {
        (**self).on_keep_alive(sender, payload).await;
    }

    async fn on_data(&self, sender: &ClientSender, id: String, result: GraphQLResult) {
        (**self).on_data(sender, id, result).await;
    }

    async fn on_error(&self, sender: &ClientSender, id: String, errors: Vec<GraphQLError>) {
        (**self).on_error(sender, id, errors).await;
    }

    async fn on_complete(&self, sender: &ClientSender, id: String) {
        (**self).on_complete(sender, id).await;
    }

    async fn on_error_notice(&self, sender: &ClientSender, notice: ErrorNotice) {
        (**self).on_error_notice(sender, notice).await;
    }
}

/// Protocol engine for one client connection.
pub struct ClientEngine<H> {
    handler: H,
    sender: ClientSender,
}

impl<H: ClientHandler> ClientEngine<H> {
    /// Engine routing frames received on `transport`'s connection to `handler`.
    pub fn new(transport: TransportHandle, handler: H) -> Self {
        Self {
            handler,
            sender: ClientSender::new(transport),
        }
    }

    /// Cloneable sender for outbound messages.
    pub fn sender(&self) -> ClientSender {
        self.sender.clone()
    }

    /// The handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Handle frames from `inbound` until it ends.
    pub async fn run<S>(&self, inbound: S)
    where
        S: Stream<Item = InboundFrame> + Send,
    {
        let mut inbound = std::pin::pin!(inbound);
        while let Some(frame) = inbound.next().await {
            self.handle_frame(frame).await;
        }
        debug!("server stream ended");
    }

    /// Handle one inbound frame.
    pub async fn handle_frame(&self, frame: InboundFrame) {
        match frame.into_text() {
            Ok(text) => self.handle_text(&text).await,
            Err(e) => self.signal(e).await,
        }
    }

    /// Handle one inbound text frame.
    pub async fn handle_text(&self, text: &str) {
        if let Some(notice) = ErrorNotice::parse(text) {
            warn!(code = notice.code, message = %notice.message, "server reported a protocol error");
            self.handler.on_error_notice(&self.sender, notice).await;
            return;
        }

        let message = match ServerMessage::peek_type(text)
            .and_then(|kind| ServerMessage::decode_as(text, kind))
        {
            Ok(message) => message,
            Err(e) => {
                self.signal(e).await;
                return;
            }
        };
        debug!(kind = %message.message_type(), id = message.id(), "received message");

        self.handler.on_message(&self.sender, &message).await;
        let sender = &self.sender;
        match message {
            ServerMessage::ConnectionAck { payload } => {
                self.handler.on_connection_ack(sender, payload).await;
            }
            ServerMessage::ConnectionError { payload } => {
                self.handler.on_connection_error(sender, payload).await;
            }
            ServerMessage::KeepAlive { payload } => {
                self.handler.on_keep_alive(sender, payload).await;
            }
            ServerMessage::Data { id, payload } => self.handler.on_data(sender, id, payload).await,
            ServerMessage::Error { id, payload } => {
                self.handler.on_error(sender, id, payload).await;
            }
            ServerMessage::Complete { id } => self.handler.on_complete(sender, id).await,
        }
    }

    async fn signal(&self, error: ProtocolError) {
        warn!(code = %error.code(), error = %error, "protocol error");
        self.sender.transport.signal_error(&error).await;
    }
}
