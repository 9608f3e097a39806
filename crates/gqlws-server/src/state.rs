//! Connection lifecycle state machine.
//!
//! ```text
//! Uninitialized --connection_init (authorized)--> Initialized
//! Initialized   --connection_terminate / close--> Terminated
//! Uninitialized --close-----------------------> Terminated
//! ```
//!
//! There is no way back to `Uninitialized`; `Terminated` is final.

use gqlws_core::errors::ProtocolError;

/// Lifecycle state of one connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No successful `connection_init` yet.
    #[default]
    Uninitialized,
    /// Exactly one `connection_init` was accepted.
    Initialized,
    /// Terminated by the client or by transport loss.
    Terminated,
}

/// Guards which messages are acceptable in the current state.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: ConnectionState,
}

impl StateMachine {
    /// Fresh machine in `Uninitialized`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection accepted its `connection_init`.
    pub fn is_initialized(&self) -> bool {
        self.state == ConnectionState::Initialized
    }

    /// Whether the connection has been torn down.
    pub fn is_terminated(&self) -> bool {
        self.state == ConnectionState::Terminated
    }

    /// Check that a `connection_init` may be attempted.
    ///
    /// Authorization runs only after this succeeds; the transition itself
    /// happens in [`StateMachine::complete_init`].
    pub fn check_init(&self) -> Result<(), ProtocolError> {
        match self.state {
            ConnectionState::Uninitialized => Ok(()),
            ConnectionState::Initialized | ConnectionState::Terminated => {
                Err(ProtocolError::TooManyInitializations)
            }
        }
    }

    /// Record an authorized `connection_init`.
    pub fn complete_init(&mut self) -> Result<(), ProtocolError> {
        self.check_init()?;
        self.state = ConnectionState::Initialized;
        Ok(())
    }

    /// Check that operation messages (`start`, `stop`) are acceptable.
    pub fn require_initialized(&self) -> Result<(), ProtocolError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(ProtocolError::NotInitialized)
        }
    }

    /// Move to `Terminated`. Returns `false` if already terminated.
    pub fn terminate(&mut self) -> bool {
        if self.is_terminated() {
            return false;
        }
        self.state = ConnectionState::Terminated;
        true
    }
}
