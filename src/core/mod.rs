//! Core types, constants, and the durable store boundary.
//!
//! Everything here is runtime-free; the async layers build on these types.

mod constants;
mod error;
mod traits;

pub use constants::*;
pub use error::*;
pub use traits::*;
