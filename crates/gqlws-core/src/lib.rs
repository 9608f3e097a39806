//! # gqlws-core
//!
//! Shared vocabulary for both sides of the `graphql-ws` subprotocol.
//!
//! - **Messages**: [`messages::ClientMessage`] and [`messages::ServerMessage`],
//!   the tagged wire shapes, with strict per-discriminant decoding
//! - **GraphQL payloads**: request, result and error objects carried inside messages
//! - **Errors**: the numeric [`errors::ErrorCode`] taxonomy and [`errors::ProtocolError`]
//! - **Collaborators**: [`transport::Transport`], [`execution::Executor`] and
//!   [`auth::Authorizer`] traits the engines are wired against
//! - **Logging**: `tracing` subscriber setup shared by the binaries

#![deny(unsafe_code)]

pub mod auth;
pub mod errors;
pub mod execution;
pub mod graphql;
pub mod logging;
pub mod messages;
pub mod testing;
pub mod transport;

/// WebSocket subprotocol name negotiated during the upgrade handshake.
pub const SUBPROTOCOL: &str = "graphql-ws";
