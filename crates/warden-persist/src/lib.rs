//! Storage backends for warden claims and the write-behind queue that feeds
//! them.
//!
//! - [`RonStore`]: RON files under a data directory.
//! - [`MemoryStore`]: in-memory records with an availability switch.
//! - [`WriteBehindQueue`]: applies committed changes on a worker thread with
//!   [`RetryPolicy`]-driven exponential backoff.

mod backoff;
mod memory;
mod ron_store;
mod write_behind;

pub use backoff::{Backoff, RetryPolicy};
pub use memory::MemoryStore;
pub use ron_store::RonStore;
pub use write_behind::{DeadLetter, WriteBehindQueue};
