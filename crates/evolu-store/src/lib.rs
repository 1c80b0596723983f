//! # Evolu Store
//!
//! SQLite persistence for the sync engine: the append-only encrypted
//! message log with its timestamp index (range counts, XOR fingerprints,
//! rank queries), the relay write-key table, the client-side history
//! projection with last-writer-wins reads, the upload queue, and the
//! dedicated storage worker thread.

mod error;
mod schema;
pub mod store;
pub mod worker;

pub use store::SqliteStore;
pub use worker::StorageHandle;
