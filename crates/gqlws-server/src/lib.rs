//! # gqlws-server
//!
//! Server side of the `graphql-ws` subprotocol.
//!
//! - Protocol engine: connection state machine, per-connection operation
//!   registry, query/mutation and subscription tasks
//! - Keep-alive: periodic `ka` frames after `connection_ack`
//! - `WebSocket` gateway: axum upgrade negotiating `graphql-ws`, bounded
//!   outbound queue, connection limit
//! - HTTP endpoints: health check, Prometheus metrics
//! - Configuration via `figment`, graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod health;
pub mod keepalive;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod websocket;

pub use config::{OneShotPolicy, ServerConfig};
pub use engine::{EngineOptions, ServerEngine};
pub use server::{GqlwsServer, ServerHandle};
