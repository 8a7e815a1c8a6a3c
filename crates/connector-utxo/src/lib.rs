//! UTXO connector engine.
//!
//! Maintains the unspent output set of an indexing backend:
//!
//! - [`UtxoCache`]: in-memory cache of confirmed outputs with a checkpoint/commit
//!   cycle flushing aged entries to the store, and daemon-based recovery of
//!   outputs missing from both.
//! - [`UnconfirmedSet`]: mempool outputs and spends, promoted into confirmed
//!   storage when a block is applied and restored when it is rolled back.
//!
//! Persistence goes through [`ConnectorDatabase`] (SQLite); the chain daemon is
//! reached through the [`DaemonClient`] trait.

mod cache;
mod config;
mod daemon;
mod db;
mod error;
mod guard;
mod mru;
mod queries;
mod restore;
mod snapshot;
mod types;
mod unconfirmed;

pub use cache::{CacheStats, UtxoCache};
pub use config::{UnconfirmedConfig, UtxoCacheConfig};
pub use daemon::{
    BitcoindClient, BlockTxids, DaemonClient, RpcError, RpcRequest, RpcResult, VerboseTransaction,
    VerboseTxOut,
};
pub use db::{ConnectorDatabase, RowCounts, Watermarks};
pub use error::{Error, Result};
pub use mru::MruCache;
pub use restore::BlockRestoreCache;
pub use snapshot::BlockSnapshot;
pub use types::{
    AddressScript, LoadedOutput, P2pkRow, SpendRef, SpendRow, UnconfirmedUtxoRow, UtxoEntry,
    UtxoRow,
};
pub use unconfirmed::{AppliedBlock, MempoolRows, RolledBackBlock, UnconfirmedSet};
