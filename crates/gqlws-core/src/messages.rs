//! Wire messages of the `graphql-ws` subprotocol.
//!
//! Two families share one JSON framing, each a single object whose `type`
//! field is the discriminant:
//!
//! - [`ClientMessage`]: `connection_init`, `start`, `stop`, `connection_terminate`
//! - [`ServerMessage`]: `connection_ack`, `connection_error`, `ka`, `data`,
//!   `error`, `complete`
//!
//! Decoding happens in two steps. [`ClientMessage::peek_type`] reads only
//! the discriminant (failing with `noType` / `invalidType`), then
//! [`ClientMessage::decode_as`] decodes the body strictly against the
//! expected discriminant. Encoding never fails: see [`encode`].

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::ProtocolError;
use crate::graphql::{GraphQLError, GraphQLRequest, GraphQLResult, Payload};

// ─────────────────────────────────────────────────────────────────────────────
// Discriminants
// ─────────────────────────────────────────────────────────────────────────────

/// Discriminant of a client → server message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// `connection_init`
    ConnectionInit,
    /// `start`
    Start,
    /// `stop`
    Stop,
    /// `connection_terminate`
    ConnectionTerminate,
}

impl RequestType {
    /// Every request type.
    pub const ALL: [Self; 4] = [
        Self::ConnectionInit,
        Self::Start,
        Self::Stop,
        Self::ConnectionTerminate,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionInit => "connection_init",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::ConnectionTerminate => "connection_terminate",
        }
    }

    /// Look up a type by wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of a server → client message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// `connection_ack`
    ConnectionAck,
    /// `connection_error`
    ConnectionError,
    /// `ka`
    #[serde(rename = "ka")]
    KeepAlive,
    /// `data`
    Data,
    /// `error`
    Error,
    /// `complete`
    Complete,
}

impl ResponseType {
    /// Every response type.
    pub const ALL: [Self; 6] = [
        Self::ConnectionAck,
        Self::ConnectionError,
        Self::KeepAlive,
        Self::Data,
        Self::Error,
        Self::Complete,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionAck => "connection_ack",
            Self::ConnectionError => "connection_error",
            Self::KeepAlive => "ka",
            Self::Data => "data",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }

    /// Look up a type by wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client → server
// ─────────────────────────────────────────────────────────────────────────────

/// Request message sent by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the protocol session, optionally carrying auth parameters.
    ConnectionInit {
        /// Parameters handed to the authorizer.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },
    /// Starts an operation under a client-chosen id.
    Start {
        /// Operation id.
        id: String,
        /// The GraphQL request.
        payload: GraphQLRequest,
    },
    /// Stops the operation with this id.
    Stop {
        /// Operation id.
        id: String,
    },
    /// Ends the protocol session.
    ConnectionTerminate,
}

impl ClientMessage {
    /// `connection_init` with optional payload.
    pub fn connection_init(payload: Option<Payload>) -> Self {
        Self::ConnectionInit { payload }
    }

    /// `start` for `id`.
    pub fn start(id: impl Into<String>, payload: GraphQLRequest) -> Self {
        Self::Start {
            id: id.into(),
            payload,
        }
    }

    /// `stop` for `id`.
    pub fn stop(id: impl Into<String>) -> Self {
        Self::Stop { id: id.into() }
    }

    /// Discriminant of this message.
    pub fn message_type(&self) -> RequestType {
        match self {
            Self::ConnectionInit { .. } => RequestType::ConnectionInit,
            Self::Start { .. } => RequestType::Start,
            Self::Stop { .. } => RequestType::Stop,
            Self::ConnectionTerminate => RequestType::ConnectionTerminate,
        }
    }

    /// Operation id, for messages that carry one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Start { id, .. } | Self::Stop { id } => Some(id),
            Self::ConnectionInit { .. } | Self::ConnectionTerminate => None,
        }
    }

    /// Encode to a single-line JSON frame.
    pub fn encode(&self) -> String {
        encode(self, self.id())
    }

    /// Read only the discriminant of a frame.
    pub fn peek_type(text: &str) -> Result<RequestType, ProtocolError> {
        let name = peek_type_name(text)?;
        RequestType::from_wire(&name).ok_or(ProtocolError::InvalidType)
    }

    /// Decode a frame strictly as `expected`.
    ///
    /// Fails with `invalidRequestFormat(expected)` if the body does not
    /// match the shape of `expected` or its `type` names another variant.
    pub fn decode_as(text: &str, expected: RequestType) -> Result<Self, ProtocolError> {
        decode_strict(text, expected, Self::message_type)
            .ok_or(ProtocolError::InvalidRequestFormat(expected))
    }

    /// Peek the discriminant, then decode strictly against it.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let expected = Self::peek_type(text)?;
        Self::decode_as(text, expected)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → client
// ─────────────────────────────────────────────────────────────────────────────

/// Response message sent by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Initialization accepted.
    ConnectionAck {
        /// Optional server parameters.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },
    /// Connection-level failure.
    ConnectionError {
        /// Optional error details.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },
    /// Keep-alive tick.
    #[serde(rename = "ka")]
    KeepAlive {
        /// Optional payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },
    /// One execution result for an operation.
    Data {
        /// Operation id.
        id: String,
        /// Execution result.
        payload: GraphQLResult,
    },
    /// Operation failed; terminal for the id.
    Error {
        /// Operation id.
        id: String,
        /// Errors describing the failure.
        payload: Vec<GraphQLError>,
    },
    /// Operation finished; terminal for the id.
    Complete {
        /// Operation id.
        id: String,
    },
}

impl ServerMessage {
    /// `connection_ack` without payload.
    pub fn connection_ack() -> Self {
        Self::ConnectionAck { payload: None }
    }

    /// `ka` without payload.
    pub fn keep_alive() -> Self {
        Self::KeepAlive { payload: None }
    }

    /// `data` for `id`.
    pub fn data(id: impl Into<String>, payload: GraphQLResult) -> Self {
        Self::Data {
            id: id.into(),
            payload,
        }
    }

    /// `error` for `id`.
    pub fn error(id: impl Into<String>, payload: Vec<GraphQLError>) -> Self {
        Self::Error {
            id: id.into(),
            payload,
        }
    }

    /// `complete` for `id`.
    pub fn complete(id: impl Into<String>) -> Self {
        Self::Complete { id: id.into() }
    }

    /// Discriminant of this message.
    pub fn message_type(&self) -> ResponseType {
        match self {
            Self::ConnectionAck { .. } => ResponseType::ConnectionAck,
            Self::ConnectionError { .. } => ResponseType::ConnectionError,
            Self::KeepAlive { .. } => ResponseType::KeepAlive,
            Self::Data { .. } => ResponseType::Data,
            Self::Error { .. } => ResponseType::Error,
            Self::Complete { .. } => ResponseType::Complete,
        }
    }

    /// Operation id, for messages that carry one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Data { id, .. } | Self::Error { id, .. } | Self::Complete { id } => Some(id),
            Self::ConnectionAck { .. } | Self::ConnectionError { .. } | Self::KeepAlive { .. } => {
                None
            }
        }
    }

    /// Encode to a single-line JSON frame.
    pub fn encode(&self) -> String {
        encode(self, self.id())
    }

    /// Read only the discriminant of a frame.
    pub fn peek_type(text: &str) -> Result<ResponseType, ProtocolError> {
        let name = peek_type_name(text)?;
        ResponseType::from_wire(&name).ok_or(ProtocolError::InvalidType)
    }

    /// Decode a frame strictly as `expected`.
    pub fn decode_as(text: &str, expected: ResponseType) -> Result<Self, ProtocolError> {
        decode_strict(text, expected, Self::message_type)
            .ok_or(ProtocolError::InvalidResponseFormat(expected))
    }

    /// Peek the discriminant, then decode strictly against it.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let expected = Self::peek_type(text)?;
        Self::decode_as(text, expected)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding helpers
// ─────────────────────────────────────────────────────────────────────────────

/// A protocol message that can be written to a transport.
pub trait WireMessage: Serialize {
    /// Single-line JSON frame for this message.
    fn to_frame(&self) -> String;
}

impl WireMessage for ClientMessage {
    fn to_frame(&self) -> String {
        self.encode()
    }
}

impl WireMessage for ServerMessage {
    fn to_frame(&self) -> String {
        self.encode()
    }
}

/// Encode any message to JSON text.
///
/// On serialization failure the result is a well-formed `error` message
/// for `id` (empty for messages without one) describing the failure, so
/// the outbound channel only ever sees valid frames.
pub fn encode<M: Serialize>(message: &M, id: Option<&str>) -> String {
    match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(id, error = %e, "failed to encode message, sending encoding error instead");
            encoding_failure(id.unwrap_or_default(), &e.to_string())
        }
    }
}

/// Fallback frame emitted when a message cannot be encoded.
pub fn encoding_failure(id: &str, reason: &str) -> String {
    serde_json::json!({
        "type": ResponseType::Error.as_str(),
        "id": id,
        "payload": [{ "message": format!("Failed to encode message: {reason}") }],
    })
    .to_string()
}

/// Read the `type` field of a frame without decoding anything else.
fn peek_type_name(text: &str) -> Result<String, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::NoType)?;
    value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(ProtocolError::NoType)
}

/// Decode `text` as `M` and require its discriminant to equal `expected`.
fn decode_strict<M, K>(text: &str, expected: K, kind: fn(&M) -> K) -> Option<M>
where
    M: DeserializeOwned,
    K: PartialEq,
{
    serde_json::from_str::<M>(text)
        .ok()
        .filter(|message| kind(message) == expected)
}
