//! # Evolu Protocol
//!
//! The synchronization protocol: framed request/response messages, the
//! range-based set-reconciliation engine, and the initiator/responder
//! session state machines. Everything here is transport-agnostic and
//! storage-agnostic; IO lives in `evolu-sync` and `evolu-relay`, and
//! persistence behind the [`MessageStore`] trait.

pub mod framing;
pub mod messages;
pub mod reconcile;
pub mod session;
pub mod store;

pub use framing::{open_frame, seal_frame};
pub use messages::{
    DecodeError, ErrorCode, ProtocolMessage, RangeEntry, RangePayload, PROTOCOL_VERSION,
};
pub use reconcile::{FrameOutcome, ReconcileConfig, Reconciler, WriteGuard};
pub use session::{
    respond, InitiatorSession, ResponderStep, SessionPhase, SessionStep, MAX_ROUNDS,
};
pub use store::{MemoryStore, MessageStore};
