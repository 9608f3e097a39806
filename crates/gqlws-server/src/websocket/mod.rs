//! WebSocket gateway: socket-backed transport and per-connection session loop.

pub mod session;
pub mod transport;
