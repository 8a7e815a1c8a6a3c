//! Batched statements over the connector tables.
//!
//! Every helper takes a bare connection so it can run either on a pooled
//! connection or inside a caller-owned transaction. Key lists and row lists are
//! split into chunks of [`BIND_CHUNK`] to stay below SQLite's bind-parameter limit.

use crate::error::Result;
use crate::types::{
    AddressScript, P2pkRow, RawP2pk, RawSpend, RawUnconfirmedUtxo, RawUtxo, SpendRow,
    UnconfirmedUtxoRow, UtxoRow, txid_bytes,
};
use bitcoin::{OutPoint, Txid};
use connector_primitives::outpoint_to_key;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashSet;

/// Maximum number of rows (or keys) bound by a single statement.
pub(crate) const BIND_CHUNK: usize = 500;

const UTXO_COLUMNS: &str = "outpoint, pointer, address, amount";
const UNCONFIRMED_UTXO_COLUMNS: &str = "outpoint, tx_id, address, amount";
const SPEND_COLUMNS: &str = "outpoint, sequence, out_tx_id, tx_id, input_index, address";
const P2PK_COLUMNS: &str = "tx_id, address, script";

fn outpoint_keys(outpoints: &[OutPoint]) -> Vec<Vec<u8>> {
    outpoints.iter().map(outpoint_to_key).collect()
}

fn txid_keys(tx_ids: &[Txid]) -> Vec<Vec<u8>> {
    tx_ids.iter().map(|txid| txid_bytes(txid).to_vec()).collect()
}

/// Runs `{head} WHERE {column} IN (...) {tail}` for each chunk of `keys`,
/// collecting the returned rows.
async fn select_in<R>(
    conn: &mut SqliteConnection,
    head: &str,
    column: &str,
    tail: &str,
    keys: &[Vec<u8>],
) -> Result<Vec<R>>
where
    R: for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> + Send + Unpin,
{
    let mut rows = Vec::new();
    for chunk in keys.chunks(BIND_CHUNK) {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(head);
        query.push(" WHERE ").push(column).push(" IN (");
        let mut separated = query.separated(", ");
        for key in chunk {
            separated.push_bind(key.as_slice());
        }
        separated.push_unseparated(") ");
        query.push(tail);
        rows.extend(query.build_query_as::<R>().fetch_all(&mut *conn).await?);
    }
    Ok(rows)
}

// ========== Confirmed outputs ==========

pub(crate) async fn fetch_utxos(
    conn: &mut SqliteConnection,
    outpoints: &[OutPoint],
) -> Result<Vec<UtxoRow>> {
    let head = format!("SELECT {UTXO_COLUMNS} FROM connector_utxo");
    let rows: Vec<RawUtxo> =
        select_in(conn, &head, "outpoint", "", &outpoint_keys(outpoints)).await?;
    rows.into_iter().map(UtxoRow::try_from).collect()
}

pub(crate) async fn insert_utxos(conn: &mut SqliteConnection, rows: &[UtxoRow]) -> Result<()> {
    for chunk in rows.chunks(BIND_CHUNK) {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("INSERT OR REPLACE INTO connector_utxo ({UTXO_COLUMNS}) "));
        query.push_values(chunk, |mut b, row| {
            let (outpoint, pointer, address, amount) = row.to_raw();
            b.push_bind(outpoint)
                .push_bind(pointer)
                .push_bind(address)
                .push_bind(amount);
        });
        query.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Deletes confirmed outputs, returning the rows that existed.
pub(crate) async fn delete_utxos(
    conn: &mut SqliteConnection,
    outpoints: &[OutPoint],
) -> Result<Vec<UtxoRow>> {
    let tail = format!("RETURNING {UTXO_COLUMNS}");
    let rows: Vec<RawUtxo> = select_in(
        conn,
        "DELETE FROM connector_utxo",
        "outpoint",
        &tail,
        &outpoint_keys(outpoints),
    )
    .await?;
    rows.into_iter().map(UtxoRow::try_from).collect()
}

// ========== Unconfirmed outputs ==========

pub(crate) async fn fetch_unconfirmed_utxos(
    conn: &mut SqliteConnection,
    outpoints: &[OutPoint],
) -> Result<Vec<UnconfirmedUtxoRow>> {
    let head = format!("SELECT {UNCONFIRMED_UTXO_COLUMNS} FROM connector_unconfirmed_utxo");
    let rows: Vec<RawUnconfirmedUtxo> =
        select_in(conn, &head, "outpoint", "", &outpoint_keys(outpoints)).await?;
    rows.into_iter().map(UnconfirmedUtxoRow::try_from).collect()
}

pub(crate) async fn insert_unconfirmed_utxos(
    conn: &mut SqliteConnection,
    rows: &[UnconfirmedUtxoRow],
) -> Result<()> {
    for chunk in rows.chunks(BIND_CHUNK) {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT OR REPLACE INTO connector_unconfirmed_utxo ({UNCONFIRMED_UTXO_COLUMNS}) "
        ));
        query.push_values(chunk, |mut b, row| {
            b.push_bind(outpoint_to_key(&row.outpoint))
                .push_bind(txid_bytes(&row.tx_id).to_vec())
                .push_bind(row.address.clone())
                .push_bind(row.amount as i64);
        });
        query.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// Deletes every unconfirmed output created by one of `tx_ids`.
pub(crate) async fn delete_unconfirmed_utxos_by_tx(
    conn: &mut SqliteConnection,
    tx_ids: &[Txid],
) -> Result<Vec<UnconfirmedUtxoRow>> {
    let tail = format!("RETURNING {UNCONFIRMED_UTXO_COLUMNS}");
    let rows: Vec<RawUnconfirmedUtxo> = select_in(
        conn,
        "DELETE FROM connector_unconfirmed_utxo",
        "tx_id",
        &tail,
        &txid_keys(tx_ids),
    )
    .await?;
    rows.into_iter().map(UnconfirmedUtxoRow::try_from).collect()
}

// ========== Unconfirmed spends ==========

pub(crate) async fn fetch_spends(
    conn: &mut SqliteConnection,
    outpoints: &[OutPoint],
) -> Result<Vec<SpendRow>> {
    let head = format!("SELECT {SPEND_COLUMNS} FROM connector_unconfirmed_stxo");
    let rows: Vec<RawSpend> = select_in(
        conn,
        &head,
        "outpoint",
        "ORDER BY sequence",
        &outpoint_keys(outpoints),
    )
    .await?;
    rows.into_iter().map(SpendRow::try_from).collect()
}

/// Inserts spends, skipping rows whose `(outpoint, sequence)` is taken.
/// Returns the rows actually stored.
pub(crate) async fn insert_spends_ignoring_conflicts(
    conn: &mut SqliteConnection,
    rows: &[SpendRow],
) -> Result<Vec<SpendRow>> {
    let mut inserted = Vec::with_capacity(rows.len());
    for chunk in rows.chunks(BIND_CHUNK) {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO connector_unconfirmed_stxo ({SPEND_COLUMNS}) "
        ));
        query.push_values(chunk, |mut b, row| {
            b.push_bind(outpoint_to_key(&row.outpoint))
                .push_bind(i64::from(row.sequence))
                .push_bind(txid_bytes(&row.out_tx_id).to_vec())
                .push_bind(txid_bytes(&row.tx_id).to_vec())
                .push_bind(i64::from(row.input_index))
                .push_bind(row.address.clone());
        });
        query.push(format!(
            " ON CONFLICT(outpoint, sequence) DO NOTHING RETURNING {SPEND_COLUMNS}"
        ));
        let rows: Vec<RawSpend> = query.build_query_as().fetch_all(&mut *conn).await?;
        for row in rows {
            inserted.push(SpendRow::try_from(row)?);
        }
    }
    Ok(inserted)
}

/// Inserts spends, moving each colliding row to the next free sequence number
/// of its outpoint.
pub(crate) async fn insert_spends(conn: &mut SqliteConnection, rows: Vec<SpendRow>) -> Result<()> {
    let mut pending = rows;
    while !pending.is_empty() {
        let inserted: HashSet<SpendRow> = insert_spends_ignoring_conflicts(conn, &pending)
            .await?
            .into_iter()
            .collect();
        pending = pending
            .into_iter()
            .filter(|row| !inserted.contains(row))
            .map(|mut row| {
                row.sequence += 1;
                row
            })
            .collect();
    }
    Ok(())
}

/// Deletes spends made by one of `tx_ids`.
pub(crate) async fn delete_spends_by_tx(
    conn: &mut SqliteConnection,
    tx_ids: &[Txid],
) -> Result<Vec<SpendRow>> {
    let tail = format!("RETURNING {SPEND_COLUMNS}");
    let rows: Vec<RawSpend> = select_in(
        conn,
        "DELETE FROM connector_unconfirmed_stxo",
        "tx_id",
        &tail,
        &txid_keys(tx_ids),
    )
    .await?;
    rows.into_iter().map(SpendRow::try_from).collect()
}

/// Deletes every spend of one of `outpoints`.
pub(crate) async fn delete_spends_by_outpoint(
    conn: &mut SqliteConnection,
    outpoints: &[OutPoint],
) -> Result<Vec<SpendRow>> {
    let tail = format!("RETURNING {SPEND_COLUMNS}");
    let rows: Vec<RawSpend> = select_in(
        conn,
        "DELETE FROM connector_unconfirmed_stxo",
        "outpoint",
        &tail,
        &outpoint_keys(outpoints),
    )
    .await?;
    rows.into_iter().map(SpendRow::try_from).collect()
}

// ========== Pay-to-pubkey maps ==========

pub(crate) async fn insert_unconfirmed_p2pk(
    conn: &mut SqliteConnection,
    rows: &[P2pkRow],
) -> Result<()> {
    for chunk in rows.chunks(BIND_CHUNK) {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT OR IGNORE INTO connector_unconfirmed_p2pk_map ({P2PK_COLUMNS}) "
        ));
        query.push_values(chunk, |mut b, row| {
            b.push_bind(txid_bytes(&row.tx_id).to_vec())
                .push_bind(row.address.clone())
                .push_bind(row.script.clone());
        });
        query.build().execute(&mut *conn).await?;
    }
    Ok(())
}

pub(crate) async fn delete_unconfirmed_p2pk_by_tx(
    conn: &mut SqliteConnection,
    tx_ids: &[Txid],
) -> Result<Vec<P2pkRow>> {
    let tail = format!("RETURNING {P2PK_COLUMNS}");
    let rows: Vec<RawP2pk> = select_in(
        conn,
        "DELETE FROM connector_unconfirmed_p2pk_map",
        "tx_id",
        &tail,
        &txid_keys(tx_ids),
    )
    .await?;
    rows.into_iter().map(P2pkRow::try_from).collect()
}

/// Inserts address-script mappings, ignoring addresses already mapped.
/// Returns the addresses newly inserted.
pub(crate) async fn insert_p2pk_map(
    conn: &mut SqliteConnection,
    rows: &[AddressScript],
) -> Result<Vec<Vec<u8>>> {
    let mut inserted = Vec::new();
    for chunk in rows.chunks(BIND_CHUNK) {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO connector_p2pk_map (address, script) ");
        query.push_values(chunk, |mut b, row| {
            b.push_bind(row.address.clone()).push_bind(row.script.clone());
        });
        query.push(" ON CONFLICT(address) DO NOTHING RETURNING address");
        let rows: Vec<(Vec<u8>,)> = query.build_query_as().fetch_all(&mut *conn).await?;
        inserted.extend(rows.into_iter().map(|(address,)| address));
    }
    Ok(inserted)
}

pub(crate) async fn delete_p2pk_map(
    conn: &mut SqliteConnection,
    addresses: &[Vec<u8>],
) -> Result<()> {
    for chunk in addresses.chunks(BIND_CHUNK) {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM connector_p2pk_map WHERE address IN (");
        let mut separated = query.separated(", ");
        for address in chunk {
            separated.push_bind(address.as_slice());
        }
        separated.push_unseparated(
            ") AND NOT EXISTS (SELECT 1 FROM connector_utxo \
             WHERE connector_utxo.address = connector_p2pk_map.address)",
        );
        query.build().execute(&mut *conn).await?;
    }
    Ok(())
}

// ========== Mempool and snapshots ==========

pub(crate) async fn clear_mempool(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DELETE FROM connector_unconfirmed_utxo")
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM connector_unconfirmed_stxo")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn put_snapshot(
    conn: &mut SqliteConnection,
    height: u32,
    data: &[u8],
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO connector_block_state_checkpoint (height, data) VALUES (?, ?)",
    )
    .bind(i64::from(height))
    .bind(data)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Removes and returns the snapshot with the highest height.
pub(crate) async fn pop_latest_snapshot(
    conn: &mut SqliteConnection,
) -> Result<Option<(u32, Vec<u8>)>> {
    let row: Option<(i64, Vec<u8>)> = sqlx::query_as(
        "SELECT height, data FROM connector_block_state_checkpoint ORDER BY height DESC LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?;

    let Some((height, data)) = row else {
        return Ok(None);
    };

    sqlx::query("DELETE FROM connector_block_state_checkpoint WHERE height = ?")
        .bind(height)
        .execute(&mut *conn)
        .await?;

    Ok(Some((height as u32, data)))
}

// ========== Watermarks ==========

pub(crate) async fn update_watermarks(
    conn: &mut SqliteConnection,
    last_block: u32,
    last_cached_block: u32,
) -> Result<()> {
    sqlx::query("UPDATE connector_utxo_state SET value = ? WHERE name = 'last_block'")
        .bind(i64::from(last_block))
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE connector_utxo_state SET value = ? WHERE name = 'last_cached_block'")
        .bind(i64::from(last_cached_block))
        .execute(&mut *conn)
        .await?;
    Ok(())
}
