use bitcoin::Txid;
use connector_primitives::{KeyError, PointerError};

/// Errors that can occur in the UTXO connector.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Daemon transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error("Daemon returned {got} results for {expected} requests")]
    BatchLength { expected: usize, got: usize },

    #[error("Daemon response missing for request #{0}")]
    MissingResponse(usize),

    #[error("Invalid outpoint key in database: {0}")]
    Key(#[from] KeyError),

    #[error("Invalid pointer: {0}")]
    Pointer(#[from] PointerError),

    #[error("Invalid txid in database: {0}")]
    InvalidTxid(String),

    #[error("Value {0} out of range")]
    InvalidAmount(i64),

    #[error("Block at height {0} has no transactions")]
    EmptyBlock(u32),

    #[error("Transaction {0} is not part of the applied block")]
    UnknownTransaction(Txid),

    #[error("No block snapshot left to roll back")]
    NoSnapshot,

    #[error("Snapshot stored at height {stored} describes height {encoded}")]
    SnapshotMismatch { stored: u32, encoded: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
