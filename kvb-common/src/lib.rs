// kvb-common - Shared wire types and errors for the key-value backend
//
// This crate defines the RESP2 codec, command argument types and the error
// taxonomy used by the client and backend crates.

pub mod error;
pub mod resp;
pub mod slot;
pub mod value;

// Re-export for convenience
pub use error::*;
pub use resp::{encode_command, encode_value, RespDecoder};
pub use slot::{key_slot, SLOT_COUNT};
pub use value::*;
