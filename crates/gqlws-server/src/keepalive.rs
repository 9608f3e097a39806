//! Periodic `ka` keep-alive frames.
//!
//! Started once a connection is acknowledged. The first `ka` goes out
//! immediately, then one per interval until the connection's keep-alive
//! token is cancelled or the transport goes away.

use std::time::Duration;

use gqlws_core::messages::ServerMessage;
use gqlws_core::transport::TransportHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Outcome of the keep-alive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveResult {
    /// The keep-alive was cancelled by the connection.
    Cancelled,
    /// The transport stopped accepting frames.
    TransportGone,
}

/// Send `ka` frames on `transport` every `interval`.
pub async fn run_keep_alive(
    transport: TransportHandle,
    interval: Duration,
    cancel: CancellationToken,
) -> KeepAliveResult {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let frame = ServerMessage::keep_alive().encode();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return KeepAliveResult::Cancelled;
            }
            _ = ticker.tick() => {
                if !transport.send_text(frame.clone()).await {
                    return KeepAliveResult::TransportGone;
                }
                trace!("keep-alive sent");
            }
        }
    }
}
