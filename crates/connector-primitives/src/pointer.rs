//! Packed chain-location pointers.
//!
//! ```text
//!  63        39 38        20   19   18         0
//! +------------+------------+------+------------+
//! |   height   |  tx_index  | flag |   index    |
//! +------------+------------+------+------------+
//! ```
//!
//! The flag bit is set for outputs and clear for inputs. Pointers order by
//! height, then transaction position, so the largest pointer for a key is its
//! most recent occurrence.

use serde::{Deserialize, Serialize};

const INDEX_BITS: u32 = 19;
const TX_INDEX_SHIFT: u32 = 20;
const HEIGHT_SHIFT: u32 = 39;
const OUTPUT_FLAG: u64 = 1 << INDEX_BITS;

/// Largest transaction position or input/output index a pointer can carry.
pub const MAX_INDEX: u32 = (1 << INDEX_BITS) - 1;

/// Largest height that keeps the pointer within a signed 64-bit column.
pub const MAX_HEIGHT: u32 = (1 << (63 - HEIGHT_SHIFT)) - 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PointerError {
    #[error("Height {0} exceeds pointer range")]
    Height(u32),

    #[error("Transaction index {0} exceeds pointer range")]
    TxIndex(u32),

    #[error("Input/output index {0} exceeds pointer range")]
    Index(u32),

    #[error("Negative pointer value {0}")]
    Negative(i64),
}

/// Location of an output (or input) in the confirmed chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pointer(u64);

impl Pointer {
    /// Pointer to output `out_index` of the transaction at `tx_index` in block `height`.
    pub fn output(height: u32, tx_index: u32, out_index: u32) -> Result<Self, PointerError> {
        Self::pack(height, tx_index, out_index).map(|raw| Self(raw | OUTPUT_FLAG))
    }

    /// Pointer to input `in_index` of the transaction at `tx_index` in block `height`.
    pub fn input(height: u32, tx_index: u32, in_index: u32) -> Result<Self, PointerError> {
        Self::pack(height, tx_index, in_index).map(Self)
    }

    fn pack(height: u32, tx_index: u32, index: u32) -> Result<u64, PointerError> {
        if height > MAX_HEIGHT {
            return Err(PointerError::Height(height));
        }
        if tx_index > MAX_INDEX {
            return Err(PointerError::TxIndex(tx_index));
        }
        if index > MAX_INDEX {
            return Err(PointerError::Index(index));
        }
        Ok((u64::from(height) << HEIGHT_SHIFT)
            | (u64::from(tx_index) << TX_INDEX_SHIFT)
            | u64::from(index))
    }

    /// Raw packed value.
    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn height(self) -> u32 {
        (self.0 >> HEIGHT_SHIFT) as u32
    }

    pub fn tx_index(self) -> u32 {
        ((self.0 >> TX_INDEX_SHIFT) & u64::from(MAX_INDEX)) as u32
    }

    /// Input or output index within the transaction.
    pub fn index(self) -> u32 {
        (self.0 & u64::from(MAX_INDEX)) as u32
    }

    pub fn is_output(self) -> bool {
        self.0 & OUTPUT_FLAG != 0
    }
}

impl From<Pointer> for i64 {
    fn from(pointer: Pointer) -> Self {
        // Height is capped at `MAX_HEIGHT`, the sign bit is never set.
        pointer.0 as i64
    }
}

impl TryFrom<i64> for Pointer {
    type Error = PointerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u64::try_from(value)
            .map(Self)
            .map_err(|_| PointerError::Negative(value))
    }
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_output() { "out" } else { "in" };
        write!(
            f,
            "#{}:{}:{}{}",
            self.height(),
            self.tx_index(),
            kind,
            self.index()
        )
    }
}
