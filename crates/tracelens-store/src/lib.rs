//! # tracelens-store
//!
//! Durable, append-only persistence for checkpoints and spans in one SQLite
//! database (WAL mode). Repositories under [`repositories`] are stateless
//! and take a `&Connection`; [`TraceStore`] composes them into transactional
//! operations with per-thread write serialization and a time budget.

pub mod connection;
pub mod errors;
pub mod repositories;
pub mod row_helpers;
pub mod schema;
pub mod store;

pub use connection::{ConnectionConfig, ConnectionPool, PooledConnection};
pub use errors::{Result, StoreError};
pub use store::{ForkRequest, PutCheckpoint, ThreadSnapshot, TraceStore, Written};
