//! Wire formats for both populations.
//!
//! - **Base**: length-prefixed binary frames ([`frame`]), always encrypted on
//!   the socket ([`codec`]): AES-128-CBC with a random first block and an
//!   RFC 4493 CMAC over the ciphertext
//! - **Client**: newline-delimited JSON ([`json`]) carrying the same header
//!   flags as booleans
//!
//! Nothing here performs I/O; the connection handlers feed read buffers in
//! and write the returned bytes out.

mod codec;
mod frame;
mod json;

pub use codec::{IvSource, build_encrypted, chain_block, unpack_encrypted};
pub use frame::{Header, Message, build_plain, extract_frame, split_frame, unpack_plain};
pub use json::{AuthResult, ClientMessage, JsonHeader, split_line};
