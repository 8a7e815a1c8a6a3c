//! SQLite storage for the connector.

use crate::error::Result;
use crate::queries;
use crate::types::{AddressScript, UtxoRow};
use bitcoin::OutPoint;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// The two durable heights tracked by the confirmed cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Watermarks {
    /// Checkpoint height up to which confirmed outputs are durable.
    pub last_block: u32,
    /// Height of the last block processed when the latest commit ran.
    pub last_cached_block: u32,
}

/// Row counts of the connector tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowCounts {
    pub utxo: u64,
    pub unconfirmed_utxo: u64,
    pub unconfirmed_stxo: u64,
    pub p2pk_map: u64,
    pub snapshots: u64,
    /// Height of the newest block that can be rolled back.
    pub last_snapshot: Option<u32>,
}

/// Everything one commit writes, applied in a single transaction.
#[derive(Debug, Default)]
pub(crate) struct CommitBatch {
    pub saved: Vec<UtxoRow>,
    pub deleted: Vec<OutPoint>,
    pub p2pk_map: Vec<AddressScript>,
    pub last_block: u32,
    pub last_cached_block: u32,
}

/// SQLite database backing the confirmed and unconfirmed sets.
#[derive(Clone)]
pub struct ConnectorDatabase {
    pool: SqlitePool,
}

impl ConnectorDatabase {
    /// Opens or creates the connector database at the given file path.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("cache_size", "-64000") // 64MB cache
            .pragma("synchronous", "NORMAL");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;

        tracing::debug!(path = %path.display(), "Opened connector database");

        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS connector_utxo (
                outpoint BLOB PRIMARY KEY,
                pointer INTEGER NOT NULL,
                address BLOB NOT NULL,
                amount INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_utxo_address ON connector_utxo(address);

            CREATE TABLE IF NOT EXISTS connector_unconfirmed_utxo (
                outpoint BLOB PRIMARY KEY,
                tx_id BLOB NOT NULL,
                address BLOB NOT NULL,
                amount INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_unconfirmed_utxo_tx ON connector_unconfirmed_utxo(tx_id);

            CREATE TABLE IF NOT EXISTS connector_unconfirmed_stxo (
                outpoint BLOB NOT NULL,
                sequence INTEGER NOT NULL,
                out_tx_id BLOB NOT NULL,
                tx_id BLOB NOT NULL,
                input_index INTEGER NOT NULL,
                address BLOB NOT NULL,
                UNIQUE (outpoint, sequence)
            );
            CREATE INDEX IF NOT EXISTS idx_unconfirmed_stxo_tx ON connector_unconfirmed_stxo(tx_id);

            CREATE TABLE IF NOT EXISTS connector_p2pk_map (
                address BLOB PRIMARY KEY,
                script BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS connector_unconfirmed_p2pk_map (
                tx_id BLOB NOT NULL,
                address BLOB NOT NULL,
                script BLOB NOT NULL,
                PRIMARY KEY (tx_id, address)
            );

            -- Exact-undo record of the last applied blocks
            CREATE TABLE IF NOT EXISTS connector_block_state_checkpoint (
                height INTEGER PRIMARY KEY,
                data BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS connector_utxo_state (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO connector_utxo_state (name, value) VALUES ('last_block', 0);
            INSERT OR IGNORE INTO connector_utxo_state (name, value) VALUES ('last_cached_block', 0);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a database transaction.
    pub async fn begin_transaction(&self) -> Result<sqlx::Transaction<'static, sqlx::Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Reads the durable watermarks.
    pub async fn watermarks(&self) -> Result<Watermarks> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT name, value FROM connector_utxo_state \
             WHERE name IN ('last_block', 'last_cached_block')",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut watermarks = Watermarks::default();
        for (name, value) in rows {
            match name.as_str() {
                "last_block" => watermarks.last_block = value as u32,
                "last_cached_block" => watermarks.last_cached_block = value as u32,
                _ => {}
            }
        }
        Ok(watermarks)
    }

    /// Counts the rows of every connector table.
    pub async fn row_counts(&self) -> Result<RowCounts> {
        let (utxo, unconfirmed_utxo, unconfirmed_stxo, p2pk_map, snapshots, last_snapshot): (
            i64,
            i64,
            i64,
            i64,
            i64,
            Option<i64>,
        ) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM connector_utxo),
                (SELECT COUNT(*) FROM connector_unconfirmed_utxo),
                (SELECT COUNT(*) FROM connector_unconfirmed_stxo),
                (SELECT COUNT(*) FROM connector_p2pk_map),
                (SELECT COUNT(*) FROM connector_block_state_checkpoint),
                (SELECT MAX(height) FROM connector_block_state_checkpoint)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(RowCounts {
            utxo: utxo as u64,
            unconfirmed_utxo: unconfirmed_utxo as u64,
            unconfirmed_stxo: unconfirmed_stxo as u64,
            p2pk_map: p2pk_map as u64,
            snapshots: snapshots as u64,
            last_snapshot: last_snapshot.map(|h| h as u32),
        })
    }

    /// Fetches confirmed outputs by outpoint. Missing outpoints are skipped.
    pub async fn fetch_utxos(&self, outpoints: &[OutPoint]) -> Result<Vec<UtxoRow>> {
        let mut conn = self.pool.acquire().await?;
        queries::fetch_utxos(&mut conn, outpoints).await
    }

    /// Writes one commit batch atomically.
    pub(crate) async fn commit_batch(&self, batch: &CommitBatch) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        queries::delete_utxos(&mut tx, &batch.deleted).await?;
        queries::insert_utxos(&mut tx, &batch.saved).await?;
        queries::insert_p2pk_map(&mut tx, &batch.p2pk_map).await?;
        queries::update_watermarks(&mut tx, batch.last_block, batch.last_cached_block).await?;

        tx.commit().await?;
        Ok(())
    }
}
