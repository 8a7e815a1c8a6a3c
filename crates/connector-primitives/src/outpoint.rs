//! Outpoint storage keys.
//!
//! A key is the 32 raw txid bytes followed by the output index written as the
//! reference node's chainstate VARINT, so that a key recomputed from daemon data
//! matches the stored one byte for byte.

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Txid};

/// Errors produced when decoding an outpoint key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Outpoint key too short: {0} bytes")]
    TooShort(usize),

    #[error("Truncated VARINT")]
    TruncatedVarInt,

    #[error("VARINT overflows u64")]
    VarIntOverflow,

    #[error("Output index {0} does not fit in u32")]
    IndexOutOfRange(u64),

    #[error("{0} trailing bytes after outpoint key")]
    TrailingBytes(usize),
}

/// Appends `n` to `out` as a VARINT (MSB base-128, each continuation byte
/// carrying an implicit +1 so that every value has exactly one encoding).
pub fn encode_varint(mut n: u64, out: &mut Vec<u8>) {
    let mut tmp = [0u8; 10];
    let mut len = 0;
    loop {
        tmp[len] = (n & 0x7f) as u8 | if len > 0 { 0x80 } else { 0x00 };
        if n <= 0x7f {
            break;
        }
        n = (n >> 7) - 1;
        len += 1;
    }
    out.extend(tmp[..=len].iter().rev());
}

/// Decodes a VARINT from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_varint(bytes: &[u8]) -> Result<(u64, usize), KeyError> {
    let mut n: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if n > (u64::MAX >> 7) {
            return Err(KeyError::VarIntOverflow);
        }
        n = (n << 7) | u64::from(byte & 0x7f);
        if byte & 0x80 == 0 {
            return Ok((n, i + 1));
        }
        n = n.checked_add(1).ok_or(KeyError::VarIntOverflow)?;
    }
    Err(KeyError::TruncatedVarInt)
}

/// Convert OutPoint to storage key.
pub fn outpoint_to_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 5);
    key.extend_from_slice(outpoint.txid.as_byte_array());
    encode_varint(u64::from(outpoint.vout), &mut key);
    key
}

/// Parse storage key back to OutPoint.
pub fn key_to_outpoint(key: &[u8]) -> Result<OutPoint, KeyError> {
    if key.len() < 33 {
        return Err(KeyError::TooShort(key.len()));
    }

    let mut txid_bytes = [0u8; 32];
    txid_bytes.copy_from_slice(&key[..32]);

    let (vout, consumed) = decode_varint(&key[32..])?;
    let trailing = key.len() - 32 - consumed;
    if trailing != 0 {
        return Err(KeyError::TrailingBytes(trailing));
    }
    let vout = u32::try_from(vout).map_err(|_| KeyError::IndexOutOfRange(vout))?;

    Ok(OutPoint {
        txid: Txid::from_byte_array(txid_bytes),
        vout,
    })
}
