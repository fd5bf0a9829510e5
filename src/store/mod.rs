//! Store implementations.
//!
//! Production deployments plug a database-backed [`Store`](crate::core::Store)
//! in; [`MemoryStore`] backs the tests and the development binary.

mod memory;
mod seed;

pub use memory::{MemoryStore, QueueEntry};
pub use seed::{Seed, SeedBase, SeedClient, SeedSubscription};
