//! Per-connection registry of running operations.
//!
//! Maps a client-chosen operation id to the cancellation token and task of
//! the operation running under it. Only the connection's dispatch path
//! registers and cancels; an operation task may remove its own entry when
//! its stream ends. Entries carry a sequence number so a task can never
//! remove a newer operation that reused its id.
//!
//! Whoever removes an entry owns the id's terminal transition: the task
//! emits `complete`/`error` only if [`SubscriptionRegistry::finish`]
//! succeeds, and an explicit cancel emits nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gqlws_core::errors::ProtocolError;
use metrics::gauge;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::OPERATIONS_ACTIVE;

/// How long a cancelled task may take to observe its token before it is aborted.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Proof of registration handed to the operation task.
#[derive(Debug, Clone)]
pub struct OperationTicket {
    id: String,
    seq: u64,
    token: CancellationToken,
}

impl OperationTicket {
    /// Operation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token cancelled when the operation is stopped.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the operation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct Operation {
    seq: u64,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Registry of active operations for one connection.
#[derive(Default)]
pub struct SubscriptionRegistry {
    operations: DashMap<String, Operation>,
    next_seq: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an operation for `id`.
    ///
    /// Fails with `subscriberAlreadyExists` while another operation with the
    /// same id is active; the existing operation is left untouched.
    pub fn register(&self, id: &str) -> Result<OperationTicket, ProtocolError> {
        match self.operations.entry(id.to_owned()) {
            Entry::Occupied(_) => Err(ProtocolError::SubscriberAlreadyExists(id.to_owned())),
            Entry::Vacant(slot) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let token = CancellationToken::new();
                let _ = slot.insert(Operation {
                    seq,
                    token: token.clone(),
                    task: None,
                });
                gauge!(OPERATIONS_ACTIVE).increment(1.0);
                Ok(OperationTicket {
                    id: id.to_owned(),
                    seq,
                    token,
                })
            }
        }
    }

    /// Attach the spawned task to its registration.
    ///
    /// If the operation already finished the handle is simply dropped.
    pub fn attach(&self, ticket: &OperationTicket, task: JoinHandle<()>) {
        if let Some(mut op) = self.operations.get_mut(&ticket.id) {
            if op.seq == ticket.seq {
                op.task = Some(task);
            }
        }
    }

    /// Deregister an operation whose stream ended on its own.
    ///
    /// Returns `false` if the operation was cancelled first, in which case
    /// the caller must not emit a terminal message.
    pub fn finish(&self, ticket: &OperationTicket) -> bool {
        let removed = self
            .operations
            .remove_if(&ticket.id, |_, op| op.seq == ticket.seq)
            .is_some();
        if removed {
            gauge!(OPERATIONS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Cancel and remove the operation for `id`, waiting for its task to stop.
    ///
    /// Unknown ids are a no-op. Returns whether an operation was cancelled.
    pub async fn cancel(&self, id: &str) -> bool {
        let Some((_, op)) = self.operations.remove(id) else {
            debug!(id, "cancel for unknown operation ignored");
            return false;
        };
        gauge!(OPERATIONS_ACTIVE).decrement(1.0);
        op.token.cancel();
        join_cancelled(id, op.task).await;
        true
    }

    /// Cancel and remove every operation, waiting for all tasks to stop.
    ///
    /// Returns the number of operations cancelled.
    pub async fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.operations.iter().map(|e| e.key().clone()).collect();
        let removed: Vec<(String, Operation)> = ids
            .into_iter()
            .filter_map(|id| self.operations.remove(&id))
            .collect();

        for (_, op) in &removed {
            op.token.cancel();
        }
        let count = removed.len();
        #[allow(clippy::cast_precision_loss)]
        let removed_gauge = count as f64;
        gauge!(OPERATIONS_ACTIVE).decrement(removed_gauge);
        for (id, op) in removed {
            join_cancelled(&id, op.task).await;
        }
        count
    }

    /// Whether an operation is active for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.operations.contains_key(id)
    }

    /// Number of active operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether no operation is active.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Ids of active operations (sorted).
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.operations.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

async fn join_cancelled(id: &str, task: Option<JoinHandle<()>>) {
    let Some(mut task) = task else { return };
    if tokio::time::timeout(CANCEL_GRACE, &mut task).await.is_err() {
        warn!(id, "operation task ignored cancellation, aborting");
        task.abort();
    }
}
