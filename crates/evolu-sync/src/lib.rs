//! # Evolu Sync
//!
//! The client side of the engine: the [`Replica`] (local mutations,
//! history projection, clock), the [`Transport`] seam with its WebSocket
//! implementation, and the [`spawn_sync`] orchestrator that keeps one
//! reconciliation session per owner running against a relay with retry,
//! backoff, and a status observable. [`serve_peer`] runs the responder
//! role over the same storage for relay-less peer-to-peer sync.

pub mod orchestrator;
pub mod replica;
pub mod transport;

pub use orchestrator::{
    backoff_delay, serve_peer, spawn_sync, SyncHandle, SyncOptions, SyncState, SyncStatus,
    BACKOFF_BASE, BACKOFF_CAP, DEFAULT_SESSION_PERMITS, ROUND_TIMEOUT,
};
pub use replica::{QuerySubscribers, Replica};
pub use transport::{
    ChannelTransport, Connector, Transport, WebSocketConnector, WebSocketTransport,
};
