//! In-memory cache of confirmed unspent outputs.
//!
//! New outputs enter the cache on [`UtxoCache::set`] and leave it either when
//! spent ([`UtxoCache::get`]) or when a checkpoint evicts them into the
//! pending-saved buffer, from which [`UtxoCache::commit`] writes them to the
//! store. An outpoint is resident in at most one of the cache, the
//! pending-saved buffer and the store.
//!
//! Lookups that miss both the cache and the buffer are collected, bulk-loaded
//! from the store by [`UtxoCache::load_missed`] and, failing that, rebuilt from
//! the chain daemon by [`UtxoCache::resolve_via_daemon`].

use crate::config::UtxoCacheConfig;
use crate::daemon::{BlockTxids, DaemonClient, RpcRequest, VerboseTransaction};
use crate::db::{CommitBatch, ConnectorDatabase};
use crate::error::{Error, Result};
use crate::guard::{InFlight, InFlightGuard};
use crate::mru::MruCache;
use crate::restore::{BlockRestoreCache, RestoreBlock};
use crate::types::{AddressScript, UtxoEntry, UtxoRow};
use bitcoin::{BlockHash, OutPoint, Txid};
use connector_primitives::{AddressKey, Pointer};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counters describing cache behaviour since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    /// Calls to [`UtxoCache::get`].
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    /// Outputs written to the store by successful commits.
    pub saved: u64,
    /// Outpoints deleted from the store by successful commits.
    pub deleted: u64,
    /// Outputs recovered by [`UtxoCache::load_missed`] or the daemon.
    pub loaded: u64,
    /// Cumulative time spent in store lookups.
    pub read_time: Duration,
}

/// Confirmed UTXO cache with checkpoint/commit persistence.
pub struct UtxoCache {
    db: ConnectorDatabase,
    daemon: Arc<dyn DaemonClient>,
    config: UtxoCacheConfig,

    cache: MruCache<OutPoint, UtxoEntry>,
    restore_blocks: BlockRestoreCache,

    missed: HashSet<OutPoint>,
    missed_failed: Vec<OutPoint>,
    loaded: HashMap<OutPoint, UtxoEntry>,

    /// Entries evicted by a checkpoint and not yet committed.
    pending_saved: HashMap<OutPoint, UtxoEntry>,
    p2pk_map: Vec<AddressScript>,

    /// Spent outpoints living outside the cache, collected since the last checkpoint.
    scheduled_to_delete: Vec<OutPoint>,
    /// Deletes handed to the next commit.
    pending_deleted: Vec<OutPoint>,

    checkpoint: u32,
    last_checkpoint: Option<u32>,
    checkpoints: BTreeSet<u32>,
    last_block: u32,
    checkpoint_pending: bool,

    save_process: InFlight,
    write_to_db: InFlight,
    /// Holds `save_process` from checkpoint creation until the commit attempt.
    flush_ticket: Option<InFlightGuard>,

    stats: CacheStats,
}

impl UtxoCache {
    pub fn new(
        db: ConnectorDatabase,
        daemon: Arc<dyn DaemonClient>,
        config: UtxoCacheConfig,
    ) -> Self {
        Self {
            restore_blocks: BlockRestoreCache::new(config.restore_blocks_cache_size),
            db,
            daemon,
            config,
            cache: MruCache::new(),
            missed: HashSet::new(),
            missed_failed: Vec::new(),
            loaded: HashMap::new(),
            pending_saved: HashMap::new(),
            p2pk_map: Vec::new(),
            scheduled_to_delete: Vec::new(),
            pending_deleted: Vec::new(),
            checkpoint: 0,
            last_checkpoint: None,
            checkpoints: BTreeSet::new(),
            last_block: 0,
            checkpoint_pending: false,
            save_process: InFlight::default(),
            write_to_db: InFlight::default(),
            flush_ticket: None,
            stats: CacheStats::default(),
        }
    }

    /// Consumes the output at `outpoint`.
    ///
    /// An output found in the pending-saved buffer is scheduled for deletion
    /// from the store. A miss is remembered for [`Self::load_missed`].
    pub fn get(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.stats.requests += 1;

        let entry = match self.cache.remove(outpoint) {
            Some(entry) => Some(entry),
            None => {
                let entry = self.pending_saved.remove(outpoint);
                if entry.is_some() {
                    self.scheduled_to_delete.push(*outpoint);
                }
                entry
            }
        };

        if entry.is_some() {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
            self.missed.insert(*outpoint);
        }

        entry
    }

    /// Inserts or overwrites an output, marking it most recently used.
    pub fn set(&mut self, outpoint: OutPoint, pointer: Pointer, amount: u64, address: Vec<u8>) {
        self.cache.insert(
            outpoint,
            UtxoEntry {
                pointer,
                amount,
                address,
            },
        );
    }

    /// Bulk-loads missed outpoints from the store.
    ///
    /// Found outputs become available through [`Self::get_loaded`]; the rest
    /// are queued for [`Self::resolve_via_daemon`]. Store failures are logged
    /// and the misses kept for the next attempt.
    pub async fn load_missed(&mut self) {
        if self.missed.is_empty() {
            return;
        }

        let missed: Vec<OutPoint> = self.missed.drain().collect();
        let started = Instant::now();

        match self.db.fetch_utxos(&missed).await {
            Ok(rows) => {
                self.stats.read_time += started.elapsed();

                let mut found = HashSet::with_capacity(rows.len());
                for row in rows {
                    found.insert(row.outpoint);
                    self.loaded.insert(row.outpoint, row.entry());
                }
                self.stats.loaded += found.len() as u64;

                let before = self.missed_failed.len();
                self.missed_failed
                    .extend(missed.into_iter().filter(|outpoint| !found.contains(outpoint)));

                tracing::debug!(
                    loaded = found.len(),
                    unresolved = self.missed_failed.len() - before,
                    "Loaded missed UTXOs from store"
                );
            }
            Err(err) => {
                tracing::error!(?err, count = missed.len(), "Failed to load missed UTXOs");
                self.missed.extend(missed);
            }
        }
    }

    /// Rebuilds outputs absent from the store using the chain daemon.
    ///
    /// Returns the outpoints the daemon could not account for. A daemon or
    /// decoding failure aborts the pass and re-queues every outpoint not yet
    /// resolved.
    pub async fn resolve_via_daemon(&mut self) -> Result<Vec<OutPoint>> {
        if self.missed_failed.is_empty() {
            return Ok(Vec::new());
        }

        let queue = std::mem::take(&mut self.missed_failed);
        let batch_size = self.config.daemon_batch_size.max(1);
        let mut unresolved = Vec::new();

        for (n, chunk) in queue.chunks(batch_size).enumerate() {
            let mut chunk_unresolved = Vec::new();
            if let Err(err) = self.resolve_chunk(chunk, &mut chunk_unresolved).await {
                self.missed_failed = unresolved;
                self.missed_failed.extend_from_slice(&queue[n * batch_size..]);
                return Err(err);
            }
            unresolved.extend(chunk_unresolved);
        }

        if !unresolved.is_empty() {
            tracing::warn!(
                count = unresolved.len(),
                "Outpoints missing from both store and daemon"
            );
        }

        Ok(unresolved)
    }

    /// Resolves one batch of outpoints.
    ///
    /// Recovered outputs are only published once the whole chunk succeeded,
    /// so a failed chunk can be re-queued as a unit.
    async fn resolve_chunk(
        &mut self,
        chunk: &[OutPoint],
        unresolved: &mut Vec<OutPoint>,
    ) -> Result<()> {
        let requests = chunk
            .iter()
            .map(|outpoint| RpcRequest::get_raw_transaction(&outpoint.txid))
            .collect();
        let results = self.daemon.batch(requests).await?;
        check_batch_len(chunk.len(), results.len())?;

        let mut transactions = Vec::with_capacity(chunk.len());
        let mut missing = Vec::new();
        for (outpoint, result) in chunk.iter().zip(results) {
            match result {
                Ok(value) => {
                    let tx: VerboseTransaction = serde_json::from_value(value)?;
                    transactions.push((*outpoint, tx));
                }
                Err(err) => {
                    tracing::warn!(%outpoint, %err, "Daemon has no transaction for outpoint");
                    missing.push(*outpoint);
                }
            }
        }

        let mut hashes: Vec<BlockHash> = transactions
            .iter()
            .filter_map(|(_, tx)| tx.blockhash)
            .filter(|hash| !self.restore_blocks.contains(hash))
            .collect();
        hashes.sort_unstable();
        hashes.dedup();

        if !hashes.is_empty() {
            let requests = hashes.iter().map(RpcRequest::get_block).collect();
            let results = self.daemon.batch(requests).await?;
            check_batch_len(hashes.len(), results.len())?;
            for (hash, result) in hashes.iter().zip(results) {
                match result {
                    Ok(value) => {
                        let block: BlockTxids = serde_json::from_value(value)?;
                        self.restore_blocks
                            .insert(block.hash, RestoreBlock::new(block.height, &block.tx));
                    }
                    Err(err) => tracing::warn!(%hash, %err, "Daemon has no block"),
                }
            }
        }

        let mut restored = Vec::with_capacity(transactions.len());
        for (outpoint, tx) in transactions {
            match self.restore_output(&outpoint, &tx)? {
                Some(output) => restored.push((outpoint, output)),
                None => missing.push(outpoint),
            }
        }

        self.stats.loaded += restored.len() as u64;
        for (outpoint, (entry, p2pk)) in restored {
            if let Some(mapping) = p2pk {
                self.p2pk_map.push(mapping);
            }
            self.loaded.insert(outpoint, entry);
        }
        unresolved.extend(missing);

        Ok(())
    }

    fn restore_output(
        &mut self,
        outpoint: &OutPoint,
        tx: &VerboseTransaction,
    ) -> Result<Option<(UtxoEntry, Option<AddressScript>)>> {
        let Some(block_hash) = tx.blockhash else {
            return Ok(None);
        };
        let Some(output) = tx.vout.iter().find(|output| output.n == outpoint.vout) else {
            return Ok(None);
        };
        let Some((height, tx_index)) = self.locate(&block_hash, &tx.txid) else {
            return Ok(None);
        };

        let pointer = Pointer::output(height, tx_index, outpoint.vout)?;
        let (address, p2pk_script) =
            AddressKey::from_script(&output.script_pubkey.hex).into_parts();
        let p2pk = p2pk_script.map(|script| AddressScript {
            address: address.clone(),
            script,
        });

        let entry = UtxoEntry {
            pointer,
            amount: output.value.to_sat(),
            address,
        };
        Ok(Some((entry, p2pk)))
    }

    fn locate(&mut self, block_hash: &BlockHash, txid: &Txid) -> Option<(u32, u32)> {
        let block = self.restore_blocks.get(block_hash)?;
        let tx_index = *block.positions.get(txid)?;
        Some((block.height, tx_index))
    }

    /// Takes an output recovered by [`Self::load_missed`] or
    /// [`Self::resolve_via_daemon`], scheduling its deletion from the store.
    pub fn get_loaded(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        let entry = self.loaded.remove(outpoint)?;
        self.scheduled_to_delete.push(*outpoint);
        Some(entry)
    }

    /// Registers a height at which a checkpoint may be cut.
    pub fn add_checkpoint(&mut self, height: u32) {
        self.checkpoints.insert(height);
    }

    /// Queues an address-script mapping for the next commit.
    pub fn add_p2pk_mapping(&mut self, address: Vec<u8>, script: Vec<u8>) {
        self.p2pk_map.push(AddressScript { address, script });
    }

    fn eviction_target(&self) -> usize {
        let soft_limit = self.config.cache_size * 9 / 10;
        if self.pending_saved.len() > soft_limit {
            self.config.cache_size
        } else {
            soft_limit
        }
    }

    /// Moves aged cache entries into the pending-saved buffer.
    ///
    /// Entries at or below the first registered checkpoint mark are always
    /// evicted. Further marks are consumed while the cache stays above its
    /// target size and `floor`, when given, has reached them.
    pub fn create_checkpoint(&mut self, last_block: u32, floor: Option<u32>) {
        self.last_block = last_block;

        let current = self.checkpoint;
        self.checkpoints.retain(|mark| *mark > current);

        let Some(&first) = self.checkpoints.first() else {
            return;
        };
        if self.cache.is_empty() || floor.is_some_and(|floor| floor < first) {
            return;
        }
        let Some(ticket) = self.save_process.try_enter() else {
            tracing::debug!("UTXO flush in progress, checkpoint skipped");
            return;
        };

        self.checkpoints.remove(&first);
        let mut mark = first;

        while let Some((_, entry)) = self.cache.peek_oldest() {
            if entry.pointer.height() > mark {
                if self.cache.len() < self.eviction_target() {
                    break;
                }
                match self.checkpoints.first().copied() {
                    Some(next) if floor.is_none_or(|floor| floor >= next) => {
                        self.checkpoints.remove(&next);
                        mark = next;
                        continue;
                    }
                    _ => break,
                }
            }

            if let Some((outpoint, entry)) = self.cache.pop_oldest() {
                self.pending_saved.insert(outpoint, entry);
            }
        }

        self.last_checkpoint = Some(self.checkpoint);
        self.checkpoint = mark;

        let scheduled = std::mem::take(&mut self.scheduled_to_delete);
        self.pending_deleted.extend(scheduled);
        self.checkpoint_pending = true;
        self.flush_ticket = Some(ticket);

        tracing::debug!(
            checkpoint = self.checkpoint,
            cache_size = self.cache.len(),
            pending_saved = self.pending_saved.len(),
            pending_deleted = self.pending_deleted.len(),
            "Created UTXO checkpoint"
        );
    }

    /// Writes the pending-saved buffer, pending deletes and address mappings
    /// in one store transaction and advances the durable watermarks.
    ///
    /// Does nothing unless a checkpoint is pending. On failure the buffers are
    /// kept and the error logged; calling `commit` again retries.
    pub async fn commit(&mut self) {
        if !self.checkpoint_pending {
            return;
        }
        let Some(_writing) = self.write_to_db.try_enter() else {
            return;
        };
        let _ticket = self.flush_ticket.take();

        if self.pending_saved.is_empty()
            && self.pending_deleted.is_empty()
            && self.p2pk_map.is_empty()
        {
            self.checkpoint_pending = false;
            return;
        }

        let batch = CommitBatch {
            saved: self
                .pending_saved
                .iter()
                .map(|(outpoint, entry)| UtxoRow {
                    outpoint: *outpoint,
                    pointer: entry.pointer,
                    address: entry.address.clone(),
                    amount: entry.amount,
                })
                .collect(),
            deleted: self.pending_deleted.clone(),
            p2pk_map: self.p2pk_map.clone(),
            last_block: self.checkpoint,
            last_cached_block: self.last_block,
        };

        let started = Instant::now();
        match self.db.commit_batch(&batch).await {
            Ok(()) => {
                self.stats.saved += batch.saved.len() as u64;
                self.stats.deleted += batch.deleted.len() as u64;
                self.pending_saved.clear();
                self.pending_deleted.clear();
                self.p2pk_map.clear();
                self.checkpoint_pending = false;

                tracing::debug!(
                    checkpoint = self.checkpoint,
                    saved = batch.saved.len(),
                    deleted = batch.deleted.len(),
                    elapsed = ?started.elapsed(),
                    "UTXO checkpoint saved"
                );
            }
            Err(err) => {
                tracing::error!(
                    ?err,
                    checkpoint = self.checkpoint,
                    "Failed to save UTXO checkpoint"
                );
            }
        }
    }

    /// Ratio of hits to lookups, zero before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        if self.stats.requests == 0 {
            0.0
        } else {
            self.stats.hits as f64 / self.stats.requests as f64
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Height up to which cache contents have been handed to the store.
    pub fn checkpoint(&self) -> u32 {
        self.checkpoint
    }

    /// Checkpoint preceding the current one; `None` before the first checkpoint.
    pub fn last_checkpoint(&self) -> Option<u32> {
        self.last_checkpoint
    }

    pub fn last_block(&self) -> u32 {
        self.last_block
    }

    pub fn pending_saved_len(&self) -> usize {
        self.pending_saved.len()
    }

    /// Whether a checkpoint awaits a successful [`Self::commit`].
    pub fn is_commit_pending(&self) -> bool {
        self.checkpoint_pending
    }
}

fn check_batch_len(expected: usize, got: usize) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(Error::BatchLength { expected, got })
    }
}
