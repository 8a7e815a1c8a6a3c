//! Row types for the connector tables.

use crate::error::{Error, Result};
use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Txid};
use connector_primitives::{Pointer, key_to_outpoint, outpoint_to_key};
use serde::{Deserialize, Serialize};

/// Raw `connector_utxo` row: `(outpoint, pointer, address, amount)`.
pub(crate) type RawUtxo = (Vec<u8>, i64, Vec<u8>, i64);
/// Raw `connector_unconfirmed_utxo` row: `(outpoint, tx_id, address, amount)`.
pub(crate) type RawUnconfirmedUtxo = (Vec<u8>, Vec<u8>, Vec<u8>, i64);
/// Raw `connector_unconfirmed_stxo` row:
/// `(outpoint, sequence, out_tx_id, tx_id, input_index, address)`.
pub(crate) type RawSpend = (Vec<u8>, i64, Vec<u8>, Vec<u8>, i64, Vec<u8>);
/// Raw `connector_unconfirmed_p2pk_map` row: `(tx_id, address, script)`.
pub(crate) type RawP2pk = (Vec<u8>, Vec<u8>, Vec<u8>);

pub(crate) fn parse_txid(bytes: &[u8]) -> Result<Txid> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidTxid(format!("invalid length {}", bytes.len())))?;
    Ok(Txid::from_byte_array(arr))
}

pub(crate) fn txid_bytes(txid: &Txid) -> &[u8] {
    txid.as_byte_array().as_slice()
}

fn to_u32(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::InvalidAmount(value))
}

fn to_amount(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::InvalidAmount(value))
}

/// Cached state of a confirmed output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub pointer: Pointer,
    /// Value in satoshis.
    pub amount: u64,
    pub address: Vec<u8>,
}

/// A confirmed unspent output as stored in `connector_utxo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoRow {
    pub outpoint: OutPoint,
    pub pointer: Pointer,
    pub address: Vec<u8>,
    pub amount: u64,
}

impl UtxoRow {
    pub fn entry(&self) -> UtxoEntry {
        UtxoEntry {
            pointer: self.pointer,
            amount: self.amount,
            address: self.address.clone(),
        }
    }

    pub(crate) fn to_raw(&self) -> RawUtxo {
        (
            outpoint_to_key(&self.outpoint),
            i64::from(self.pointer),
            self.address.clone(),
            self.amount as i64,
        )
    }
}

impl TryFrom<RawUtxo> for UtxoRow {
    type Error = Error;

    fn try_from((outpoint, pointer, address, amount): RawUtxo) -> Result<Self> {
        Ok(Self {
            outpoint: key_to_outpoint(&outpoint)?,
            pointer: Pointer::try_from(pointer)?,
            address,
            amount: to_amount(amount)?,
        })
    }
}

/// An output created by a mempool transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnconfirmedUtxoRow {
    pub outpoint: OutPoint,
    /// Transaction that created the output.
    pub tx_id: Txid,
    pub address: Vec<u8>,
    pub amount: u64,
}

impl TryFrom<RawUnconfirmedUtxo> for UnconfirmedUtxoRow {
    type Error = Error;

    fn try_from((outpoint, tx_id, address, amount): RawUnconfirmedUtxo) -> Result<Self> {
        Ok(Self {
            outpoint: key_to_outpoint(&outpoint)?,
            tx_id: parse_txid(&tx_id)?,
            address,
            amount: to_amount(amount)?,
        })
    }
}

/// A mempool transaction input spending `outpoint`.
///
/// Several mempool transactions may spend the same outpoint; `sequence`
/// disambiguates them and together with `outpoint` forms the row identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpendRow {
    pub outpoint: OutPoint,
    pub sequence: u32,
    /// Transaction that created the spent output.
    pub out_tx_id: Txid,
    /// Spending transaction.
    pub tx_id: Txid,
    pub input_index: u32,
    pub address: Vec<u8>,
}

impl TryFrom<RawSpend> for SpendRow {
    type Error = Error;

    fn try_from(
        (outpoint, sequence, out_tx_id, tx_id, input_index, address): RawSpend,
    ) -> Result<Self> {
        Ok(Self {
            outpoint: key_to_outpoint(&outpoint)?,
            sequence: to_u32(sequence)?,
            out_tx_id: parse_txid(&out_tx_id)?,
            tx_id: parse_txid(&tx_id)?,
            input_index: to_u32(input_index)?,
            address,
        })
    }
}

/// Pay-to-pubkey mapping of a mempool transaction, awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct P2pkRow {
    pub tx_id: Txid,
    pub address: Vec<u8>,
    pub script: Vec<u8>,
}

impl TryFrom<RawP2pk> for P2pkRow {
    type Error = Error;

    fn try_from((tx_id, address, script): RawP2pk) -> Result<Self> {
        Ok(Self {
            tx_id: parse_txid(&tx_id)?,
            address,
            script,
        })
    }
}

/// Confirmed pay-to-pubkey mapping: address key to the full locking script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressScript {
    pub address: Vec<u8>,
    pub script: Vec<u8>,
}

/// Output state served from the unconfirmed set's loaded cache.
///
/// `pointer` is `None` for outputs created by mempool transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedOutput {
    pub pointer: Option<Pointer>,
    pub amount: u64,
    pub address: Vec<u8>,
}

/// A mempool spend of a loaded outpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendRef {
    pub tx_id: Txid,
    pub sequence: u32,
}
