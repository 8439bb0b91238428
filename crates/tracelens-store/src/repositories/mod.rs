//! Stateless repositories over the `checkpoints` and `spans` tables.
//!
//! Every method takes a `&Connection` (or a transaction, which derefs to
//! one), so callers decide the transaction boundaries.

pub mod checkpoint;
pub mod span;
pub mod thread;

pub use checkpoint::{CheckpointLink, CheckpointRepo, ForkOrigin, InsertCheckpoint, ThreadTail};
pub use span::SpanRepo;
pub use thread::ThreadRepo;
