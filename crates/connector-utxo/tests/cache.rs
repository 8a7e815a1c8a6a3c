mod common;

use bitcoin::OutPoint;
use common::{
    MockDaemon, TestDb, block_hash, count, open_db, p2pk_script, p2pkh, p2pkh_script,
    stored_amount, txid,
};
use connector_primitives::{AddressKey, MAX_HEIGHT, Pointer};
use connector_utxo::{
    ConnectorDatabase, Error, UtxoCache, UtxoCacheConfig, UtxoEntry, Watermarks,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn config(cache_size: usize) -> UtxoCacheConfig {
    UtxoCacheConfig {
        cache_size,
        ..Default::default()
    }
}

fn new_cache(db: &ConnectorDatabase, cache_size: usize) -> UtxoCache {
    UtxoCache::new(db.clone(), Arc::new(MockDaemon::default()), config(cache_size))
}

/// Two outputs per block for each of `heights`, set in block order.
fn fill(cache: &mut UtxoCache, heights: &[u32]) -> Vec<(OutPoint, u64)> {
    let mut outputs = Vec::new();
    for &height in heights {
        for vout in 0..2 {
            let outpoint = OutPoint::new(txid(height as u8), vout);
            let amount = u64::from(height) * 1_000 + u64::from(vout);
            cache.set(
                outpoint,
                Pointer::output(height, 1, vout).unwrap(),
                amount,
                p2pkh(height as u8),
            );
            cache.add_checkpoint(height);
            outputs.push((outpoint, amount));
        }
    }
    outputs
}

#[tokio::test]
async fn test_get_returns_last_set_tuple_once() {
    let TestDb { db, _dir, .. } = open_db().await;
    let mut cache = new_cache(&db, 100);

    let outpoint = OutPoint::new(txid(0xab), 0);
    let pointer = Pointer::output(700_000, 2, 0).unwrap();
    assert_eq!(pointer.raw(), (700_000u64 << 39) | (2 << 20) | (1 << 19));
    let address = p2pkh(0xaa);

    cache.set(outpoint, Pointer::output(1, 1, 1).unwrap(), 1, vec![0]);
    cache.set(outpoint, pointer, 5_000_000_000, address.clone());

    assert_eq!(
        cache.get(&outpoint),
        Some(UtxoEntry {
            pointer,
            amount: 5_000_000_000,
            address,
        })
    );
    assert_eq!(cache.get(&outpoint), None);

    let stats = cache.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(cache.hit_rate(), 0.5);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_checkpoint_drains_marks_until_target() {
    let TestDb { db, _dir, .. } = open_db().await;
    // Target is 3 entries (90% of 4).
    let mut cache = new_cache(&db, 4);
    let outputs = fill(&mut cache, &[1, 2, 3]);

    cache.create_checkpoint(3, None);

    assert_eq!(cache.checkpoint(), 2);
    assert_eq!(cache.last_checkpoint(), Some(0));
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.pending_saved_len(), 4);
    assert!(cache.is_commit_pending());

    // Evicted outputs are still served from the pending-saved buffer.
    assert_eq!(cache.get(&outputs[0].0).map(|e| e.amount), Some(outputs[0].1));
    assert_eq!(cache.pending_saved_len(), 3);

    cache.commit().await;
    assert!(!cache.is_commit_pending());
    assert_eq!(count(&db, "connector_utxo").await, 3);
    assert_eq!(stored_amount(&db, &outputs[0].0).await, None);
    assert_eq!(stored_amount(&db, &outputs[3].0).await, Some(outputs[3].1 as i64));
    assert_eq!(
        db.watermarks().await.unwrap(),
        Watermarks {
            last_block: 2,
            last_cached_block: 3,
        }
    );
    assert_eq!(cache.stats().saved, 3);
}

#[tokio::test]
async fn test_checkpoint_respects_floor() {
    let TestDb { db, _dir, .. } = open_db().await;
    let mut cache = new_cache(&db, 4);
    fill(&mut cache, &[1, 2, 3]);

    // Floor below the first mark: nothing happens.
    cache.create_checkpoint(3, Some(0));
    assert_eq!(cache.checkpoint(), 0);
    assert_eq!(cache.last_checkpoint(), None);
    assert!(!cache.is_commit_pending());
    assert_eq!(cache.len(), 6);

    // Floor at the first mark: the cache stays above target but may not advance.
    cache.create_checkpoint(3, Some(1));
    assert_eq!(cache.checkpoint(), 1);
    assert_eq!(cache.len(), 4);

    // A second checkpoint waits for the pending flush.
    cache.create_checkpoint(3, None);
    assert_eq!(cache.checkpoint(), 1);

    cache.commit().await;
    cache.create_checkpoint(3, None);
    assert_eq!(cache.checkpoint(), 2);
    assert_eq!(cache.last_checkpoint(), Some(1));
}

#[tokio::test]
async fn test_commit_with_empty_buffer_writes_nothing() {
    let TestDb { db, _dir, .. } = open_db().await;
    let mut cache = new_cache(&db, 100);

    // Nothing to do before any checkpoint.
    cache.commit().await;

    cache.set(
        OutPoint::new(txid(5), 0),
        Pointer::output(5, 0, 0).unwrap(),
        10,
        p2pkh(5),
    );
    cache.add_checkpoint(1);
    cache.create_checkpoint(5, None);
    assert_eq!(cache.checkpoint(), 1);
    assert_eq!(cache.pending_saved_len(), 0);
    assert!(cache.is_commit_pending());

    cache.commit().await;

    assert!(!cache.is_commit_pending());
    assert_eq!(count(&db, "connector_utxo").await, 0);
    assert_eq!(db.watermarks().await.unwrap(), Watermarks::default());
}

#[tokio::test]
async fn test_failed_commit_keeps_buffers_for_retry() {
    let TestDb { db, path, _dir } = open_db().await;
    let mut cache = new_cache(&db, 4);
    fill(&mut cache, &[1, 2, 3]);
    cache.create_checkpoint(3, None);
    let pending = cache.pending_saved_len();

    sqlx::query("DROP TABLE connector_utxo_state")
        .execute(db.pool())
        .await
        .unwrap();

    cache.commit().await;
    assert!(cache.is_commit_pending());
    assert_eq!(cache.pending_saved_len(), pending);
    assert_eq!(count(&db, "connector_utxo").await, 0);

    // Reopening recreates the missing table.
    ConnectorDatabase::open(&path).await.unwrap();

    cache.commit().await;
    assert!(!cache.is_commit_pending());
    assert_eq!(count(&db, "connector_utxo").await, pending as i64);
    assert_eq!(db.watermarks().await.unwrap().last_block, 2);
}

#[tokio::test]
async fn test_value_conserved_across_checkpoint_and_commit() {
    let TestDb { db, _dir, .. } = open_db().await;
    let mut cache = new_cache(&db, 6);
    let outputs = fill(&mut cache, &[1, 2, 3, 4, 5]);
    let total: u64 = outputs.iter().map(|(_, amount)| amount).sum();

    cache.create_checkpoint(5, None);
    cache.commit().await;
    assert!(count(&db, "connector_utxo").await > 0);

    let mut recovered = 0;
    let mut missed = Vec::new();
    for (outpoint, _) in &outputs {
        match cache.get(outpoint) {
            Some(entry) => recovered += entry.amount,
            None => missed.push(*outpoint),
        }
    }
    assert!(!missed.is_empty());

    cache.load_missed().await;
    for outpoint in &missed {
        recovered += cache.get_loaded(outpoint).unwrap().amount;
    }
    assert_eq!(recovered, total);

    // Consumed outputs leave the store at the next commit.
    cache.set(
        OutPoint::new(txid(9), 0),
        Pointer::output(9, 0, 0).unwrap(),
        1,
        p2pkh(9),
    );
    cache.add_checkpoint(9);
    cache.create_checkpoint(9, None);
    assert_eq!(cache.checkpoint(), 4);
    cache.commit().await;
    assert_eq!(count(&db, "connector_utxo").await, 0);
    assert_eq!(cache.stats().deleted, missed.len() as u64);
}

#[tokio::test]
async fn test_resolve_via_daemon_rebuilds_outputs() {
    let TestDb { db, _dir, .. } = open_db().await;

    let coinbase = txid(0xc0);
    let spent_tx = txid(0x51);
    let mut daemon = MockDaemon::default();
    daemon.add_transaction(
        spent_tx,
        block_hash(7),
        &[(25_000, p2pkh_script(3)), (5_000_000_000, p2pk_script())],
    );
    daemon.add_block(block_hash(7), 170, &[coinbase, spent_tx]);
    let daemon = Arc::new(daemon);

    let mut cache = UtxoCache::new(db.clone(), daemon.clone(), config(100));

    let p2pkh_out = OutPoint::new(spent_tx, 0);
    let p2pk_out = OutPoint::new(spent_tx, 1);
    let unknown = OutPoint::new(txid(0xee), 0);
    for outpoint in [p2pkh_out, p2pk_out, unknown] {
        assert!(cache.get(&outpoint).is_none());
    }

    cache.load_missed().await;
    let unresolved = cache.resolve_via_daemon().await.unwrap();
    assert_eq!(unresolved, vec![unknown]);

    let entry = cache.get_loaded(&p2pkh_out).unwrap();
    assert_eq!(entry.pointer, Pointer::output(170, 1, 0).unwrap());
    assert_eq!(entry.amount, 25_000);
    assert_eq!(entry.address, p2pkh(3));

    let entry = cache.get_loaded(&p2pk_out).unwrap();
    assert_eq!(entry.pointer, Pointer::output(170, 1, 1).unwrap());
    assert_eq!(entry.amount, 5_000_000_000);
    assert_eq!(
        entry.address,
        AddressKey::from_script(&p2pk_script()).as_bytes()
    );
    assert!(cache.get_loaded(&unknown).is_none());

    // The pay-to-pubkey mapping is written by the next commit.
    cache.set(
        OutPoint::new(txid(1), 0),
        Pointer::output(171, 0, 0).unwrap(),
        1,
        p2pkh(1),
    );
    cache.add_checkpoint(171);
    cache.create_checkpoint(171, None);
    cache.commit().await;
    assert_eq!(count(&db, "connector_p2pk_map").await, 1);
}

#[tokio::test]
async fn test_daemon_failure_requeues_outpoints() {
    let TestDb { db, _dir, .. } = open_db().await;

    let tx = txid(0x42);
    let mut daemon = MockDaemon::default();
    daemon.add_transaction(tx, block_hash(1), &[(700, p2pkh_script(1))]);
    daemon.add_block(block_hash(1), 10, &[txid(0), tx]);
    daemon.fail.store(true, Ordering::SeqCst);
    let daemon = Arc::new(daemon);

    let mut cache = UtxoCache::new(db.clone(), daemon.clone(), config(100));
    let outpoint = OutPoint::new(tx, 0);
    assert!(cache.get(&outpoint).is_none());
    cache.load_missed().await;

    assert!(cache.resolve_via_daemon().await.is_err());
    assert!(cache.get_loaded(&outpoint).is_none());

    daemon.fail.store(false, Ordering::SeqCst);
    assert!(cache.resolve_via_daemon().await.unwrap().is_empty());
    assert_eq!(cache.get_loaded(&outpoint).map(|e| e.amount), Some(700));
}

#[tokio::test]
async fn test_over_budget_checkpoint_keeps_full_capacity() {
    let TestDb { db, _dir, .. } = open_db().await;

    // Target is 3 entries (90% of 4), or 4 once more than 3 are pending.
    let checkpoint_with = |first_block: u32| {
        let mut cache = new_cache(&db, 4);
        let mut n = 0u8;
        for (height, outputs) in [(1, first_block), (2, 3)] {
            for _ in 0..outputs {
                n += 1;
                cache.set(
                    OutPoint::new(txid(n), 0),
                    Pointer::output(height, 1, 0).unwrap(),
                    1,
                    p2pkh(n),
                );
            }
            cache.add_checkpoint(height);
        }
        cache.create_checkpoint(2, None);
        cache
    };

    // 3 pending: the soft target applies and the cache drains to mark 2.
    let cache = checkpoint_with(3);
    assert_eq!(cache.checkpoint(), 2);
    assert_eq!(cache.len(), 0);

    // 4 pending: the target is the full capacity, 3 cached entries fit.
    let cache = checkpoint_with(4);
    assert_eq!(cache.checkpoint(), 1);
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.pending_saved_len(), 4);
}

#[tokio::test]
async fn test_short_daemon_batch_requeues_chunk() {
    let TestDb { db, _dir, .. } = open_db().await;

    let tx = txid(0x42);
    let mut daemon = MockDaemon::default();
    daemon.add_transaction(
        tx,
        block_hash(1),
        &[(700, p2pkh_script(1)), (800, p2pkh_script(2))],
    );
    daemon.add_block(block_hash(1), 10, &[txid(0), tx]);
    daemon.truncate.store(true, Ordering::SeqCst);
    let daemon = Arc::new(daemon);

    let mut cache = UtxoCache::new(db.clone(), daemon.clone(), config(100));
    let outpoints = [OutPoint::new(tx, 0), OutPoint::new(tx, 1)];
    for outpoint in &outpoints {
        assert!(cache.get(outpoint).is_none());
    }
    cache.load_missed().await;

    assert!(matches!(
        cache.resolve_via_daemon().await,
        Err(Error::BatchLength {
            expected: 2,
            got: 1
        })
    ));
    assert!(outpoints.iter().all(|o| cache.get_loaded(o).is_none()));

    daemon.truncate.store(false, Ordering::SeqCst);
    assert!(cache.resolve_via_daemon().await.unwrap().is_empty());
    assert_eq!(cache.get_loaded(&outpoints[0]).map(|e| e.amount), Some(700));
    assert_eq!(cache.get_loaded(&outpoints[1]).map(|e| e.amount), Some(800));
    assert_eq!(cache.stats().loaded, 2);
}

#[tokio::test]
async fn test_failed_chunk_publishes_no_outputs() {
    let TestDb { db, _dir, .. } = open_db().await;

    let good = txid(0x61);
    let bad = txid(0x62);
    let mut daemon = MockDaemon::default();
    daemon.add_transaction(good, block_hash(1), &[(5_000_000_000, p2pk_script())]);
    daemon.add_block(block_hash(1), 10, &[txid(0), good]);
    daemon.add_transaction(bad, block_hash(2), &[(1, p2pkh_script(2))]);
    daemon.add_block(block_hash(2), MAX_HEIGHT + 1, &[txid(0), bad]);
    let daemon = Arc::new(daemon);

    let mut cache = UtxoCache::new(db.clone(), daemon, config(100));
    let good_out = OutPoint::new(good, 0);
    for outpoint in [good_out, OutPoint::new(bad, 0)] {
        assert!(cache.get(&outpoint).is_none());
    }
    cache.load_missed().await;

    assert!(matches!(
        cache.resolve_via_daemon().await,
        Err(Error::Pointer(_))
    ));
    assert!(cache.get_loaded(&good_out).is_none());
    assert_eq!(cache.stats().loaded, 0);

    // No pay-to-pubkey mapping was queued for the abandoned chunk.
    cache.set(
        OutPoint::new(txid(1), 0),
        Pointer::output(11, 0, 0).unwrap(),
        1,
        p2pkh(1),
    );
    cache.add_checkpoint(11);
    cache.create_checkpoint(11, None);
    cache.commit().await;
    assert_eq!(count(&db, "connector_p2pk_map").await, 0);
}
