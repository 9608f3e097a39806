//! Execution engine collaborator.
//!
//! The protocol engine does not run GraphQL itself. It hands each `start`
//! payload to an [`Executor`], which decides whether the request is a
//! subscription and produces either one result or a pull-based
//! [`ResultStream`].

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::errors::ProtocolError;
use crate::graphql::{GraphQLError, GraphQLRequest, GraphQLResult};

/// Lazy, single-pass stream of subscription results.
///
/// Dropping the stream is how an operation stops pulling from the engine.
pub type ResultStream =
    Pin<Box<dyn Stream<Item = Result<GraphQLResult, ExecutionError>> + Send>>;

/// Failure reported by the execution engine.
#[derive(Clone, Debug, Error)]
pub enum ExecutionError {
    /// Engine-level failure described by a message.
    #[error("{0}")]
    Engine(String),

    /// Failure already shaped as a GraphQL error.
    #[error("{}", .0.message)]
    GraphQL(GraphQLError),

    /// `subscribe` produced a single result instead of a stream.
    #[error("Expected a subscription stream but received a single result")]
    NotAStream,
}

impl ExecutionError {
    /// Error object sent in the `error` payload for the operation.
    pub fn to_graphql_error(&self) -> GraphQLError {
        match self {
            Self::GraphQL(error) => error.clone(),
            Self::Engine(_) | Self::NotAStream => GraphQLError::new(self.to_string()),
        }
    }

    /// Taxonomy entry used when logging the failure.
    pub fn to_protocol_error(&self) -> ProtocolError {
        match self {
            Self::NotAStream => ProtocolError::GraphQLNotStream,
            Self::Engine(_) | Self::GraphQL(_) => ProtocolError::GraphQL(self.to_string()),
        }
    }
}

/// The GraphQL execution engine as seen by the server engine.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Whether `request` names a subscription operation.
    fn is_subscription(&self, request: &GraphQLRequest) -> bool;

    /// Run a query or mutation to a single result.
    async fn execute(&self, request: GraphQLRequest) -> Result<GraphQLResult, ExecutionError>;

    /// Start a subscription and return its result stream.
    async fn subscribe(&self, request: GraphQLRequest) -> Result<ResultStream, ExecutionError>;
}
