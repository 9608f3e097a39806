//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt, future};
use gqlws_core::auth::Authorizer;
use gqlws_core::execution::Executor;
use gqlws_core::transport::{InboundFrame, Transport, TransportHandle};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::transport::SocketTransport;
use crate::engine::{EngineOptions, ServerEngine};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// How long the writer may take to flush after the engine finished.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Everything a session needs besides the socket.
#[derive(Clone)]
pub struct SessionContext {
    /// GraphQL executor shared by all connections.
    pub executor: Arc<dyn Executor>,
    /// Checks `connection_init` payloads.
    pub authorizer: Arc<dyn Authorizer>,
    /// Per-connection engine options.
    pub options: EngineOptions,
    /// Capacity of the outbound frame queue.
    pub outbound_buffer: usize,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
}

/// Map a socket message to an engine frame. Control frames yield `None`.
fn inbound_frame(message: Message) -> Option<InboundFrame> {
    match message {
        Message::Text(text) => Some(InboundFrame::Text(text.as_str().to_owned())),
        Message::Binary(bytes) => Some(InboundFrame::Binary(bytes.to_vec())),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

/// Run a `graphql-ws` session for a connected client.
///
/// 1. Spawns the writer task draining the outbound queue into the socket
/// 2. Feeds inbound text/binary frames to a [`ServerEngine`]
/// 3. Stops on close frame, socket error or server shutdown
/// 4. Tears the engine down, closes the socket and records metrics
#[instrument(skip_all, fields(connection_id = %connection_id))]
pub async fn run_ws_session(socket: WebSocket, connection_id: String, ctx: SessionContext) {
    let (mut ws_tx, ws_rx) = socket.split();
    let (send_tx, mut send_rx) = mpsc::channel::<Message>(ctx.outbound_buffer.max(1));
    let transport = Arc::new(SocketTransport::new(send_tx));

    let connected_at = Instant::now();
    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let mut writer = tokio::spawn(async move {
        while let Some(message) = send_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut engine = ServerEngine::new(TransportHandle::new(&transport), ctx.executor)
        .with_authorizer(ctx.authorizer)
        .with_options(ctx.options)
        .with_connection_id(connection_id.as_str());

    let inbound = ws_rx
        .take_until(ctx.shutdown.cancelled_owned())
        .take_while(|message| {
            let open = match message {
                Ok(Message::Close(_)) => {
                    debug!("client sent close frame");
                    false
                }
                Ok(_) => true,
                Err(e) => {
                    debug!(error = %e, "socket read failed");
                    false
                }
            };
            future::ready(open)
        })
        .filter_map(|message| future::ready(message.ok().and_then(inbound_frame)));

    engine.run(inbound).await;

    transport.close().await;
    drop(transport);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        warn!("writer did not drain in time, aborting");
        writer.abort();
    }

    info!(
        duration_secs = connected_at.elapsed().as_secs(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connected_at.elapsed().as_secs_f64());
}
