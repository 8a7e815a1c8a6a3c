//! Mempool outputs and spends.
//!
//! Rows live in `connector_unconfirmed_utxo` and `connector_unconfirmed_stxo`.
//! [`UnconfirmedSet::apply_block`] promotes a block's rows to confirmed storage
//! and drops every mempool transaction that conflicts with it, recording a
//! [`BlockSnapshot`] that [`UnconfirmedSet::rollback_block`] replays in reverse.

use crate::config::UnconfirmedConfig;
use crate::db::ConnectorDatabase;
use crate::error::{Error, Result};
use crate::queries;
use crate::snapshot::BlockSnapshot;
use crate::types::{
    AddressScript, LoadedOutput, P2pkRow, SpendRef, SpendRow, UnconfirmedUtxoRow, UtxoRow,
};
use bitcoin::{OutPoint, Txid};
use connector_primitives::Pointer;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use schnellru::{ByLength, LruMap};
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type LoadWave = Shared<BoxFuture<'static, ()>>;

/// Mempool-derived rows committed together by [`UnconfirmedSet::commit_mempool`].
#[derive(Debug, Clone, Default)]
pub struct MempoolRows {
    pub outputs: Vec<UnconfirmedUtxoRow>,
    pub spends: Vec<SpendRow>,
    pub p2pk: Vec<P2pkRow>,
}

/// Result of [`UnconfirmedSet::apply_block`].
#[derive(Debug, Clone)]
pub struct AppliedBlock {
    /// Unconfirmed outputs dropped because their transaction conflicts with the block.
    pub invalidated_outputs: Vec<UnconfirmedUtxoRow>,
    pub invalidated_spends: Vec<SpendRow>,
    /// Mempool transactions evicted by the block.
    pub invalid_txs: HashSet<Txid>,
    /// Mempool spends the block confirmed.
    pub spends: Vec<SpendRow>,
    /// Addresses touched by each transaction, keyed by position in the block.
    pub tx_filters: BTreeMap<u32, Vec<Vec<u8>>>,
    pub coinbase_tx_id: Txid,
}

/// Result of [`UnconfirmedSet::rollback_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolledBackBlock {
    pub height: u32,
    pub coinbase_tx_id: Txid,
}

struct Inner {
    db: ConnectorDatabase,
    load_buffer: Mutex<Vec<OutPoint>>,
    loaded_outputs: Mutex<LruMap<OutPoint, LoadedOutput, ByLength>>,
    loaded_spends: Mutex<LruMap<OutPoint, Vec<SpendRef>, ByLength>>,
    /// Store round trips issued by [`Inner::load_batch`].
    load_waves: AtomicU64,
}

impl Inner {
    async fn load_batch(self: Arc<Self>) {
        let mut keys = std::mem::take(&mut *self.load_buffer.lock());
        keys.sort_unstable();
        keys.dedup();
        if keys.is_empty() {
            return;
        }

        self.load_waves.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.fetch_into_caches(&keys).await {
            tracing::error!(?err, count = keys.len(), "Failed to load unconfirmed UTXO data");
            self.load_buffer.lock().extend(keys);
        }
    }

    async fn fetch_into_caches(&self, keys: &[OutPoint]) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;

        let unconfirmed = queries::fetch_unconfirmed_utxos(&mut conn, keys).await?;
        let found: HashSet<OutPoint> = unconfirmed.iter().map(|row| row.outpoint).collect();
        let remaining: Vec<OutPoint> = keys
            .iter()
            .filter(|outpoint| !found.contains(outpoint))
            .copied()
            .collect();
        let confirmed = if remaining.is_empty() {
            Vec::new()
        } else {
            queries::fetch_utxos(&mut conn, &remaining).await?
        };
        let spends = queries::fetch_spends(&mut conn, keys).await?;
        drop(conn);

        {
            let mut outputs = self.loaded_outputs.lock();
            for row in unconfirmed {
                outputs.insert(
                    row.outpoint,
                    LoadedOutput {
                        pointer: None,
                        amount: row.amount,
                        address: row.address,
                    },
                );
            }
            for row in confirmed {
                outputs.insert(
                    row.outpoint,
                    LoadedOutput {
                        pointer: Some(row.pointer),
                        amount: row.amount,
                        address: row.address,
                    },
                );
            }
        }

        let mut grouped: HashMap<OutPoint, Vec<SpendRef>> = HashMap::new();
        for row in spends {
            grouped.entry(row.outpoint).or_default().push(SpendRef {
                tx_id: row.tx_id,
                sequence: row.sequence,
            });
        }

        let mut loaded_spends = self.loaded_spends.lock();
        for (outpoint, mut list) in grouped {
            list.sort_by_key(|spend| spend.sequence);
            loaded_spends.insert(outpoint, list);
        }

        Ok(())
    }
}

/// Tracker of not-yet-confirmed outputs and spends.
#[derive(Clone)]
pub struct UnconfirmedSet {
    inner: Arc<Inner>,
    in_flight: Arc<Mutex<Option<LoadWave>>>,
}

impl UnconfirmedSet {
    pub fn new(db: ConnectorDatabase, config: UnconfirmedConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                load_buffer: Mutex::new(Vec::new()),
                loaded_outputs: Mutex::new(LruMap::new(ByLength::new(
                    config.loaded_outputs_cache_size,
                ))),
                loaded_spends: Mutex::new(LruMap::new(ByLength::new(
                    config.loaded_spends_cache_size,
                ))),
                load_waves: AtomicU64::new(0),
            }),
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Queues an outpoint for the next [`Self::load_pending`].
    pub fn queue_load(&self, outpoint: OutPoint) {
        self.inner.load_buffer.lock().push(outpoint);
    }

    /// Loads every queued outpoint into the loaded caches.
    ///
    /// At most one load runs at a time. A caller arriving while a load is
    /// outstanding waits for it, then starts another if keys were queued in
    /// the meantime. Store failures are logged and the batch is queued again.
    pub async fn load_pending(&self) {
        loop {
            let (wave, joined) = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.as_ref() {
                    Some(wave) if wave.peek().is_none() => (wave.clone(), true),
                    _ => {
                        let wave = self.inner.clone().load_batch().boxed().shared();
                        *in_flight = Some(wave.clone());
                        (wave, false)
                    }
                }
            };

            wave.await;

            if !joined || self.inner.load_buffer.lock().is_empty() {
                break;
            }
        }
    }

    /// Number of batch loads that reached the store.
    pub fn load_waves(&self) -> u64 {
        self.inner.load_waves.load(Ordering::Relaxed)
    }

    /// Output state loaded for `outpoint`, confirmed or not.
    pub fn loaded_output(&self, outpoint: &OutPoint) -> Option<LoadedOutput> {
        self.inner.loaded_outputs.lock().get(outpoint).cloned()
    }

    /// Mempool spends loaded for `outpoint`, ordered by sequence.
    pub fn loaded_spends(&self, outpoint: &OutPoint) -> Option<Vec<SpendRef>> {
        self.inner.loaded_spends.lock().get(outpoint).cloned()
    }

    /// Stores mempool-derived rows within the caller's transaction.
    ///
    /// A spend whose `(outpoint, sequence)` is already taken is retried with
    /// the next sequence number until it is stored.
    pub async fn commit_mempool(
        &self,
        rows: MempoolRows,
        conn: &mut SqliteConnection,
    ) -> Result<()> {
        queries::insert_unconfirmed_utxos(conn, &rows.outputs).await?;
        queries::insert_unconfirmed_p2pk(conn, &rows.p2pk).await?;
        queries::insert_spends(conn, rows.spends).await?;
        Ok(())
    }

    /// Promotes the effects of the block at `height` with transactions
    /// `tx_ids` (in block order, coinbase first).
    ///
    /// Must run inside a transaction: on error the caller rolls back.
    pub async fn apply_block(
        &self,
        tx_ids: &[Txid],
        height: u32,
        conn: &mut SqliteConnection,
    ) -> Result<AppliedBlock> {
        let Some(&coinbase_tx_id) = tx_ids.first() else {
            return Err(Error::EmptyBlock(height));
        };
        let positions: HashMap<Txid, u32> = tx_ids
            .iter()
            .enumerate()
            .map(|(index, txid)| (*txid, index as u32))
            .collect();
        let position = |txid: &Txid| {
            positions
                .get(txid)
                .copied()
                .ok_or(Error::UnknownTransaction(*txid))
        };

        let mut tx_filters: BTreeMap<u32, Vec<Vec<u8>>> = BTreeMap::new();

        // Pay-to-pubkey mappings become permanent.
        let p2pk_promoted = queries::delete_unconfirmed_p2pk_by_tx(conn, tx_ids).await?;
        let mapping: Vec<AddressScript> = p2pk_promoted
            .iter()
            .map(|row| AddressScript {
                address: row.address.clone(),
                script: row.script.clone(),
            })
            .collect();
        let p2pk_inserted = queries::insert_p2pk_map(conn, &mapping).await?;

        // Created outputs move to confirmed storage.
        let unconfirmed_promoted = queries::delete_unconfirmed_utxos_by_tx(conn, tx_ids).await?;
        let mut confirmed = Vec::with_capacity(unconfirmed_promoted.len());
        for row in &unconfirmed_promoted {
            let tx_index = position(&row.tx_id)?;
            confirmed.push(UtxoRow {
                outpoint: row.outpoint,
                pointer: Pointer::output(height, tx_index, row.outpoint.vout)?,
                address: row.address.clone(),
                amount: row.amount,
            });
            tx_filters
                .entry(tx_index)
                .or_default()
                .push(row.address.clone());
        }
        queries::insert_utxos(conn, &confirmed).await?;

        // Confirmed spends consume their outputs.
        let spends = queries::delete_spends_by_tx(conn, tx_ids).await?;
        let mut spent = Vec::with_capacity(spends.len());
        let mut seen = HashSet::with_capacity(spends.len());
        for spend in &spends {
            if seen.insert(spend.outpoint) {
                spent.push(spend.outpoint);
            }
            tx_filters
                .entry(position(&spend.tx_id)?)
                .or_default()
                .push(spend.address.clone());
        }
        // Outputs created and spent within this block are not restored by rollback.
        let confirmed_removed: Vec<UtxoRow> = queries::delete_utxos(conn, &spent)
            .await?
            .into_iter()
            .filter(|row| row.pointer.height() < height)
            .collect();

        // Any other mempool spend of those outputs is a double spend.
        let mut invalidated_spends = queries::delete_spends_by_outpoint(conn, &spent).await?;
        let mut invalidated_outputs = Vec::new();
        let mut invalid_txs: HashSet<Txid> = HashSet::new();
        let mut frontier: Vec<Txid> = invalidated_spends.iter().map(|spend| spend.tx_id).collect();
        frontier.retain(|txid| invalid_txs.insert(*txid));

        while !frontier.is_empty() {
            invalidated_spends.extend(queries::delete_spends_by_tx(conn, &frontier).await?);

            let removed = queries::delete_unconfirmed_utxos_by_tx(conn, &frontier).await?;
            let outpoints: Vec<OutPoint> = removed.iter().map(|row| row.outpoint).collect();
            invalidated_outputs.extend(removed);

            let dependent = queries::delete_spends_by_outpoint(conn, &outpoints).await?;
            frontier = dependent.iter().map(|spend| spend.tx_id).collect();
            frontier.retain(|txid| invalid_txs.insert(*txid));
            invalidated_spends.extend(dependent);
        }

        if !invalid_txs.is_empty() {
            tracing::debug!(
                height,
                invalid_txs = invalid_txs.len(),
                "Block invalidated conflicting mempool transactions"
            );
        }

        let applied = AppliedBlock {
            invalidated_outputs: invalidated_outputs.clone(),
            invalidated_spends: invalidated_spends.clone(),
            invalid_txs,
            spends: spends.clone(),
            tx_filters,
            coinbase_tx_id,
        };

        let snapshot = BlockSnapshot {
            height,
            coinbase_tx_id,
            confirmed_removed,
            unconfirmed_promoted,
            spends_confirmed: spends,
            invalidated_outputs,
            invalidated_spends,
            p2pk_promoted,
            p2pk_inserted,
        };
        queries::put_snapshot(conn, height, &snapshot.encode()?).await?;

        Ok(applied)
    }

    /// Reverses the most recently applied block.
    ///
    /// Must run inside a transaction. Outputs of the block's coinbase are not
    /// returned to the mempool.
    pub async fn rollback_block(&self, conn: &mut SqliteConnection) -> Result<RolledBackBlock> {
        let (stored, data) = queries::pop_latest_snapshot(conn)
            .await?
            .ok_or(Error::NoSnapshot)?;
        let snapshot = BlockSnapshot::decode(&data)?;
        if snapshot.height != stored {
            return Err(Error::SnapshotMismatch {
                stored,
                encoded: snapshot.height,
            });
        }

        queries::insert_unconfirmed_p2pk(conn, &snapshot.p2pk_promoted).await?;

        let created: Vec<OutPoint> = snapshot
            .unconfirmed_promoted
            .iter()
            .map(|row| row.outpoint)
            .collect();
        queries::delete_utxos(conn, &created).await?;

        let restored: Vec<UnconfirmedUtxoRow> = snapshot
            .unconfirmed_promoted
            .into_iter()
            .filter(|row| row.tx_id != snapshot.coinbase_tx_id)
            .chain(snapshot.invalidated_outputs)
            .collect();
        queries::insert_unconfirmed_utxos(conn, &restored).await?;

        let spends: Vec<SpendRow> = snapshot
            .spends_confirmed
            .into_iter()
            .chain(snapshot.invalidated_spends)
            .collect();
        queries::insert_spends(conn, spends).await?;

        queries::insert_utxos(conn, &snapshot.confirmed_removed).await?;

        // Mappings still referenced by a confirmed output, such as one the
        // confirmed cache back-filled since, stay in place.
        queries::delete_p2pk_map(conn, &snapshot.p2pk_inserted).await?;

        tracing::debug!(height = stored, "Rolled back block");

        Ok(RolledBackBlock {
            height: stored,
            coinbase_tx_id: snapshot.coinbase_tx_id,
        })
    }

    /// Drops every unconfirmed output and spend.
    pub async fn flush_mempool(&self) -> Result<()> {
        tracing::info!("Flushing mempool ...");

        let mut tx = self.inner.db.begin_transaction().await?;
        queries::clear_mempool(&mut tx).await?;
        tx.commit().await?;

        self.inner.loaded_outputs.lock().clear();
        self.inner.loaded_spends.lock().clear();

        Ok(())
    }
}
