//! # gqlws-client
//!
//! Client side of the `graphql-ws` subprotocol.
//!
//! - [`ClientEngine`]: decodes server frames and routes them to a [`ClientHandler`]
//! - [`ClientSender`]: `connection_init`, `start`, `stop`, `connection_terminate`
//! - [`websocket::connect`]: `tokio-tungstenite` connection negotiating `graphql-ws`

#![deny(unsafe_code)]

pub mod engine;
pub mod websocket;

pub use engine::{ClientEngine, ClientHandler, ClientSender};

use thiserror::Error;

/// Failure to establish a client connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The URL could not be turned into a WebSocket request.
    #[error("invalid websocket request: {0}")]
    InvalidRequest(String),
    /// The server answered the upgrade with a non-101 status.
    #[error("server rejected the upgrade with HTTP {status}")]
    Rejected {
        /// HTTP status code.
        status: u16,
    },
    /// The WebSocket handshake failed.
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] Box<tokio_tungstenite::tungstenite::Error>),
    /// The server selected no subprotocol or a different one.
    #[error("server did not accept the graphql-ws subprotocol (selected: {0:?})")]
    SubprotocolNotAccepted(Option<String>),
}
