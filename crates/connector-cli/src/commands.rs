pub mod tools;

use crate::cli::{CacheParams, DaemonParams, Error, Result};
use bitcoin::OutPoint;
use connector_utxo::{ConnectorDatabase, UnconfirmedSet, UtxoCache};
use std::sync::Arc;

pub async fn status(db: &ConnectorDatabase) -> Result<()> {
    let watermarks = db.watermarks().await?;
    let counts = db.row_counts().await?;

    println!("last block:          {}", watermarks.last_block);
    println!("last cached block:   {}", watermarks.last_cached_block);
    println!("confirmed utxo:      {}", counts.utxo);
    println!("unconfirmed utxo:    {}", counts.unconfirmed_utxo);
    println!("unconfirmed spends:  {}", counts.unconfirmed_stxo);
    println!("p2pk mappings:       {}", counts.p2pk_map);
    match counts.last_snapshot {
        Some(height) => println!("block snapshots:     {} (newest #{height})", counts.snapshots),
        None => println!("block snapshots:     0"),
    }

    Ok(())
}

pub(crate) fn parse_outpoint(input: &str) -> Result<OutPoint> {
    input
        .parse()
        .map_err(|err| Error::Input(format!("Invalid outpoint {input}: {err}")))
}

pub async fn resolve(
    db: ConnectorDatabase,
    daemon: &DaemonParams,
    cache: &CacheParams,
    outpoints: &[String],
) -> Result<()> {
    let outpoints = outpoints
        .iter()
        .map(|input| parse_outpoint(input))
        .collect::<Result<Vec<_>>>()?;

    let mut utxo_cache = UtxoCache::new(db, Arc::new(daemon.client()), cache.utxo_config());

    // The cache starts empty, so every lookup is a miss queued for loading.
    for outpoint in &outpoints {
        utxo_cache.get(outpoint);
    }
    utxo_cache.load_missed().await;
    let unresolved = utxo_cache.resolve_via_daemon().await?;

    for outpoint in &outpoints {
        match utxo_cache.get_loaded(outpoint) {
            Some(entry) => println!(
                "{outpoint} height={} tx_index={} amount={} address={}",
                entry.pointer.height(),
                entry.pointer.tx_index(),
                entry.amount,
                hex::encode(&entry.address),
            ),
            None => println!("{outpoint} unresolved"),
        }
    }

    if !unresolved.is_empty() {
        tracing::warn!(count = unresolved.len(), "Some outpoints could not be resolved");
    }

    Ok(())
}

pub async fn flush_mempool(db: ConnectorDatabase, cache: &CacheParams) -> Result<()> {
    UnconfirmedSet::new(db, cache.unconfirmed_config())
        .flush_mempool()
        .await?;
    Ok(())
}

pub async fn rollback_blocks(db: ConnectorDatabase, cache: &CacheParams, count: u32) -> Result<()> {
    let set = UnconfirmedSet::new(db.clone(), cache.unconfirmed_config());

    let mut tx = db.begin_transaction().await?;
    for _ in 0..count {
        let block = set.rollback_block(&mut tx).await?;
        tracing::info!(
            height = block.height,
            coinbase = %block.coinbase_tx_id,
            "Rolled back block"
        );
    }
    tx.commit().await.map_err(connector_utxo::Error::from)?;

    Ok(())
}
