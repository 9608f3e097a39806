//! Authorization of `connection_init` payloads.

use async_trait::async_trait;
use thiserror::Error;

use crate::graphql::Payload;

/// Rejection returned by an [`Authorizer`].
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct AuthError {
    /// Why the payload was rejected. Logged, never sent to the peer.
    pub reason: String,
}

impl AuthError {
    /// Rejection with a reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Decides whether a connection may initialize.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    /// Check the `connection_init` payload.
    async fn authorize(&self, payload: Option<&Payload>) -> Result<(), AuthError>;
}

/// Accepts every connection. The default.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _payload: Option<&Payload>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Adapts a synchronous closure into an [`Authorizer`].
pub struct FnAuthorizer<F>(F);

/// Build an authorizer from a closure.
pub fn authorize_with<F>(f: F) -> FnAuthorizer<F>
where
    F: Fn(Option<&Payload>) -> Result<(), AuthError> + Send + Sync + 'static,
{
    FnAuthorizer(f)
}

#[async_trait]
impl<F> Authorizer for FnAuthorizer<F>
where
    F: Fn(Option<&Payload>) -> Result<(), AuthError> + Send + Sync + 'static,
{
    async fn authorize(&self, payload: Option<&Payload>) -> Result<(), AuthError> {
        (self.0)(payload)
    }
}
