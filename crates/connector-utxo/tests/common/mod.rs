#![allow(dead_code)]

use bitcoin::hashes::Hash;
use bitcoin::{Amount, BlockHash, OutPoint, PubkeyHash, ScriptBuf, Txid};
use connector_primitives::{AddressKey, outpoint_to_key};
use connector_utxo::{
    ConnectorDatabase, DaemonClient, Error, RpcError, RpcRequest, RpcResult, UtxoRow,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::TempDir;

pub struct TestDb {
    pub db: ConnectorDatabase,
    pub path: PathBuf,
    pub _dir: TempDir,
}

pub async fn open_db() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("connector.sqlite");
    let db = ConnectorDatabase::open(&path).await.unwrap();
    TestDb {
        db,
        path,
        _dir: dir,
    }
}

pub fn txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

pub fn block_hash(n: u8) -> BlockHash {
    BlockHash::from_byte_array([n; 32])
}

pub fn p2pkh_script(n: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([n; 20]))
}

pub fn p2pkh(n: u8) -> Vec<u8> {
    AddressKey::from_script(&p2pkh_script(n)).as_bytes().to_vec()
}

/// Genesis coinbase output script.
pub fn p2pk_script() -> ScriptBuf {
    ScriptBuf::from_bytes(
        hex::decode(
            "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac",
        )
        .unwrap(),
    )
}

pub async fn insert_confirmed(db: &ConnectorDatabase, row: &UtxoRow) {
    sqlx::query(
        "INSERT INTO connector_utxo (outpoint, pointer, address, amount) VALUES (?, ?, ?, ?)",
    )
    .bind(outpoint_to_key(&row.outpoint))
    .bind(i64::from(row.pointer))
    .bind(&row.address)
    .bind(row.amount as i64)
    .execute(db.pool())
    .await
    .unwrap();
}

pub async fn count(db: &ConnectorDatabase, table: &str) -> i64 {
    let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(db.pool())
        .await
        .unwrap();
    n
}

pub async fn stored_amount(db: &ConnectorDatabase, outpoint: &OutPoint) -> Option<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT amount FROM connector_utxo WHERE outpoint = ?")
        .bind(outpoint_to_key(outpoint))
        .fetch_optional(db.pool())
        .await
        .unwrap();
    row.map(|(amount,)| amount)
}

/// Byte-level contents of every table `apply_block` touches.
#[derive(Debug, PartialEq, Eq)]
pub struct TableState {
    pub utxo: Vec<(Vec<u8>, i64, Vec<u8>, i64)>,
    pub unconfirmed_utxo: Vec<(Vec<u8>, Vec<u8>, Vec<u8>, i64)>,
    pub unconfirmed_stxo: Vec<(Vec<u8>, i64, Vec<u8>, Vec<u8>, i64, Vec<u8>)>,
    pub p2pk_map: Vec<(Vec<u8>, Vec<u8>)>,
    pub unconfirmed_p2pk_map: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)>,
    pub snapshots: Vec<(i64,)>,
}

pub async fn table_state(db: &ConnectorDatabase) -> TableState {
    let pool = db.pool();
    TableState {
        utxo: sqlx::query_as(
            "SELECT outpoint, pointer, address, amount FROM connector_utxo ORDER BY outpoint",
        )
        .fetch_all(pool)
        .await
        .unwrap(),
        unconfirmed_utxo: sqlx::query_as(
            "SELECT outpoint, tx_id, address, amount \
             FROM connector_unconfirmed_utxo ORDER BY outpoint",
        )
        .fetch_all(pool)
        .await
        .unwrap(),
        unconfirmed_stxo: sqlx::query_as(
            "SELECT outpoint, sequence, out_tx_id, tx_id, input_index, address \
             FROM connector_unconfirmed_stxo ORDER BY outpoint, sequence",
        )
        .fetch_all(pool)
        .await
        .unwrap(),
        p2pk_map: sqlx::query_as("SELECT address, script FROM connector_p2pk_map ORDER BY address")
            .fetch_all(pool)
            .await
            .unwrap(),
        unconfirmed_p2pk_map: sqlx::query_as(
            "SELECT tx_id, address, script \
             FROM connector_unconfirmed_p2pk_map ORDER BY tx_id, address",
        )
        .fetch_all(pool)
        .await
        .unwrap(),
        snapshots: sqlx::query_as(
            "SELECT height FROM connector_block_state_checkpoint ORDER BY height",
        )
        .fetch_all(pool)
        .await
        .unwrap(),
    }
}

/// In-process daemon serving canned `getrawtransaction` / `getblock` answers.
#[derive(Default)]
pub struct MockDaemon {
    transactions: HashMap<String, Value>,
    blocks: HashMap<String, Value>,
    pub fail: AtomicBool,
    /// Answer every batch with its last result missing.
    pub truncate: AtomicBool,
    pub batches: AtomicUsize,
}

impl MockDaemon {
    /// Registers a confirmed transaction whose outputs are `(satoshis, script)`.
    pub fn add_transaction(&mut self, txid: Txid, block: BlockHash, outputs: &[(u64, ScriptBuf)]) {
        let vout: Vec<Value> = outputs
            .iter()
            .enumerate()
            .map(|(n, (sat, script))| {
                json!({
                    "value": Amount::from_sat(*sat).to_btc(),
                    "n": n,
                    "scriptPubKey": { "hex": script.to_hex_string() },
                })
            })
            .collect();
        self.transactions.insert(
            txid.to_string(),
            json!({ "txid": txid.to_string(), "blockhash": block.to_string(), "vout": vout }),
        );
    }

    pub fn add_block(&mut self, hash: BlockHash, height: u32, txids: &[Txid]) {
        let tx: Vec<String> = txids.iter().map(Txid::to_string).collect();
        self.blocks.insert(
            hash.to_string(),
            json!({ "hash": hash.to_string(), "height": height, "tx": tx }),
        );
    }
}

#[async_trait::async_trait]
impl DaemonClient for MockDaemon {
    async fn batch(&self, requests: Vec<RpcRequest>) -> connector_utxo::Result<Vec<RpcResult>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::MissingResponse(0));
        }

        let mut results: Vec<RpcResult> = requests
            .iter()
            .map(|request| {
                let key = request
                    .params
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let table = match request.method.as_str() {
                    "getrawtransaction" => &self.transactions,
                    "getblock" => &self.blocks,
                    _ => {
                        return Err(RpcError {
                            code: -32601,
                            message: "Method not found".into(),
                        });
                    }
                };
                table.get(key).cloned().ok_or(RpcError {
                    code: -5,
                    message: "No such mempool or blockchain transaction".into(),
                })
            })
            .collect();

        if self.truncate.load(Ordering::SeqCst) {
            results.pop();
        }
        Ok(results)
    }
}
