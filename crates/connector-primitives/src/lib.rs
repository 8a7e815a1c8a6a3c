//! Primitive types shared by the UTXO connector.
//!
//! - Outpoint storage keys (`txid || VARINT(vout)`).
//! - Packed chain-location pointers.
//! - Address keys derived from output scripts.

mod address;
mod outpoint;
mod pointer;

pub use address::{AddressKey, ScriptType};
pub use outpoint::{KeyError, decode_varint, encode_varint, key_to_outpoint, outpoint_to_key};
pub use pointer::{MAX_HEIGHT, MAX_INDEX, Pointer, PointerError};
