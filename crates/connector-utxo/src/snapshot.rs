//! Exact-undo record of one applied block.

use crate::error::Result;
use crate::types::{P2pkRow, SpendRow, UnconfirmedUtxoRow, UtxoRow};
use bitcoin::Txid;
use serde::{Deserialize, Serialize};

/// Every row `apply_block` removed or inserted for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSnapshot {
    pub height: u32,
    pub coinbase_tx_id: Txid,
    /// Confirmed outputs spent by the block.
    pub confirmed_removed: Vec<UtxoRow>,
    /// Unconfirmed outputs promoted to confirmed storage.
    pub unconfirmed_promoted: Vec<UnconfirmedUtxoRow>,
    /// Mempool spends confirmed by the block.
    pub spends_confirmed: Vec<SpendRow>,
    /// Outputs of transactions conflicting with the block.
    pub invalidated_outputs: Vec<UnconfirmedUtxoRow>,
    /// Spends of transactions conflicting with the block, or of their outputs.
    pub invalidated_spends: Vec<SpendRow>,
    /// Unconfirmed pay-to-pubkey rows moved to the permanent map.
    pub p2pk_promoted: Vec<P2pkRow>,
    /// Addresses the block added to the permanent map.
    pub p2pk_inserted: Vec<Vec<u8>>,
}

/// Stored layout of a snapshot. New layouts get a new variant.
#[derive(Deserialize)]
enum VersionedSnapshot {
    V1(BlockSnapshot),
}

#[derive(Serialize)]
enum VersionedSnapshotRef<'a> {
    V1(&'a BlockSnapshot),
}

impl BlockSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&VersionedSnapshotRef::V1(self))?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let VersionedSnapshot::V1(snapshot) = bincode::deserialize(data)?;
        Ok(snapshot)
    }
}
