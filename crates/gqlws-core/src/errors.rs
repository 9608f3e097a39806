//! Protocol error taxonomy.
//!
//! Every failure the engines can signal to a peer is a [`ProtocolError`]
//! variant with a stable numeric [`ErrorCode`]. On the wire an error is
//! surfaced as an out-of-band notice of the form `"<code>: <message>"`,
//! which receivers recognise by its leading [`NOTICE_PREFIX`].

use std::fmt;

use thiserror::Error;

use crate::messages::{RequestType, ResponseType};

/// Leading characters shared by every error notice on the wire.
pub const NOTICE_PREFIX: &str = "44";

// ─────────────────────────────────────────────────────────────────────────────
// Error codes
// ─────────────────────────────────────────────────────────────────────────────

/// Stable numeric error codes, also usable as WebSocket close codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Generic
    /// Anything without a dedicated code.
    Miscellaneous,
    /// The execution engine reported an error.
    GraphQLError,
    /// The execution engine returned a single result where a stream was required.
    GraphQLNotStream,

    // Message format
    /// Frame was not valid UTF-8 text.
    InvalidEncoding,
    /// Frame has no `type` field.
    NoType,
    /// Frame `type` is not a known message type.
    InvalidType,
    /// Request body does not match its declared type.
    InvalidRequestFormat,
    /// Response body does not match its declared type.
    InvalidResponseFormat,

    // Lifecycle
    /// `connection_init` was rejected by the authorizer.
    Unauthorized,
    /// Operation attempted before a successful `connection_init`.
    NotInitialized,
    /// More than one `connection_init` on the same connection.
    TooManyInitializations,
    /// `start` issued for an id that already has an active operation.
    SubscriberAlreadyExists,
}

impl ErrorCode {
    /// Every code, in ascending numeric order.
    pub const ALL: [Self; 12] = [
        Self::Miscellaneous,
        Self::GraphQLError,
        Self::GraphQLNotStream,
        Self::InvalidEncoding,
        Self::NoType,
        Self::InvalidType,
        Self::InvalidRequestFormat,
        Self::InvalidResponseFormat,
        Self::Unauthorized,
        Self::NotInitialized,
        Self::TooManyInitializations,
        Self::SubscriberAlreadyExists,
    ];

    /// Numeric wire value.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Miscellaneous => 4400,
            Self::GraphQLError => 4401,
            Self::GraphQLNotStream => 4402,
            Self::InvalidEncoding => 4410,
            Self::NoType => 4411,
            Self::InvalidType => 4412,
            Self::InvalidRequestFormat => 4413,
            Self::InvalidResponseFormat => 4414,
            Self::Unauthorized => 4430,
            Self::NotInitialized => 4431,
            Self::TooManyInitializations => 4432,
            Self::SubscriberAlreadyExists => 4433,
        }
    }

    /// Look up a code by its numeric value.
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|code| code.as_u16() == value)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Protocol error
// ─────────────────────────────────────────────────────────────────────────────

/// A failure signaled to the peer through the transport's error capability.
///
/// `Display` yields the human-readable message only; [`ProtocolError::notice`]
/// yields the full wire form including the code.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Free-form error.
    #[error("{0}")]
    Miscellaneous(String),

    /// Error reported by the execution engine.
    #[error("{0}")]
    GraphQL(String),

    /// Execution engine returned a non-stream result for a subscription.
    #[error("Expected a subscription stream but received a single result")]
    GraphQLNotStream,

    /// Frame bytes were not valid UTF-8.
    #[error("Message was not encoded in UTF8")]
    InvalidEncoding,

    /// Frame has no `type` field.
    #[error("Message has no 'type' field")]
    NoType,

    /// Frame `type` is not recognised.
    #[error("Message 'type' is not a valid message type")]
    InvalidType,

    /// Request frame does not match the shape of its declared type.
    #[error("Request message doesn't match '{0}' JSON format")]
    InvalidRequestFormat(RequestType),

    /// Response frame does not match the shape of its declared type.
    #[error("Response message doesn't match '{0}' JSON format")]
    InvalidResponseFormat(ResponseType),

    /// Authorization of `connection_init` failed.
    #[error("Unauthorized")]
    Unauthorized,

    /// `start`/`stop` received before initialization.
    #[error("Connection not initialized")]
    NotInitialized,

    /// Second `connection_init` on an initialized connection.
    #[error("Too many initialization requests")]
    TooManyInitializations,

    /// `start` for an id whose operation is still running.
    #[error("Subscriber for {0} already exists")]
    SubscriberAlreadyExists(String),
}

impl ProtocolError {
    /// Numeric code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Miscellaneous(_) => ErrorCode::Miscellaneous,
            Self::GraphQL(_) => ErrorCode::GraphQLError,
            Self::GraphQLNotStream => ErrorCode::GraphQLNotStream,
            Self::InvalidEncoding => ErrorCode::InvalidEncoding,
            Self::NoType => ErrorCode::NoType,
            Self::InvalidType => ErrorCode::InvalidType,
            Self::InvalidRequestFormat(_) => ErrorCode::InvalidRequestFormat,
            Self::InvalidResponseFormat(_) => ErrorCode::InvalidResponseFormat,
            Self::Unauthorized => ErrorCode::Unauthorized,
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::TooManyInitializations => ErrorCode::TooManyInitializations,
            Self::SubscriberAlreadyExists(_) => ErrorCode::SubscriberAlreadyExists,
        }
    }

    /// Wire form: `"<code>: <message>"`.
    pub fn notice(&self) -> String {
        format!("{}: {self}", self.code())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error notices
// ─────────────────────────────────────────────────────────────────────────────

/// An out-of-band error notice received from the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorNotice {
    /// Numeric code as sent. Unknown values are kept verbatim.
    pub code: u16,
    /// Message text following the code.
    pub message: String,
}

impl ErrorNotice {
    /// Whether a text frame is an error notice rather than a JSON message.
    pub fn is_notice(text: &str) -> bool {
        text.starts_with(NOTICE_PREFIX)
    }

    /// Parse a text frame as an error notice.
    ///
    /// Returns `None` if the frame does not carry the notice prefix. A
    /// prefixed frame whose code cannot be parsed is reported as
    /// miscellaneous with the whole frame as message.
    pub fn parse(text: &str) -> Option<Self> {
        if !Self::is_notice(text) {
            return None;
        }
        let parsed = text.split_once(':').and_then(|(code, message)| {
            code.trim()
                .parse::<u16>()
                .ok()
                .map(|code| (code, message.trim_start().to_owned()))
        });
        Some(match parsed {
            Some((code, message)) => Self { code, message },
            None => Self {
                code: ErrorCode::Miscellaneous.as_u16(),
                message: text.to_owned(),
            },
        })
    }

    /// Known code, if the numeric value is part of the taxonomy.
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u16(self.code)
    }
}

impl From<&ProtocolError> for ErrorNotice {
    fn from(error: &ProtocolError) -> Self {
        Self {
            code: error.code().as_u16(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for ErrorNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
