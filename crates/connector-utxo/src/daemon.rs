//! Batched JSON-RPC access to the chain daemon.

use crate::error::{Error, Result};
use bitcoin::{Amount, BlockHash, ScriptBuf, Txid};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

/// Error object returned by the daemon for a single request of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, thiserror::Error)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Outcome of one request of a batch.
pub type RpcResult = std::result::Result<Value, RpcError>;

/// A single JSON-RPC call.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// `getrawtransaction <txid> 1`
    pub fn get_raw_transaction(txid: &Txid) -> Self {
        Self::new("getrawtransaction", vec![json!(txid.to_string()), json!(1)])
    }

    /// `getblock <hash>` (verbosity 1, transaction ids only)
    pub fn get_block(hash: &BlockHash) -> Self {
        Self::new("getblock", vec![json!(hash.to_string())])
    }
}

/// Order-preserving batch interface to the chain daemon.
///
/// The returned vector has one entry per request, in request order.
#[async_trait::async_trait]
pub trait DaemonClient: Send + Sync {
    async fn batch(&self, requests: Vec<RpcRequest>) -> Result<Vec<RpcResult>>;
}

/// Output of a verbose `getrawtransaction`.
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseTxOut {
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub value: Amount,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pubkey: ScriptPubKey,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPubKey {
    pub hex: ScriptBuf,
}

/// The fields of a verbose `getrawtransaction` response used for recovery.
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseTransaction {
    pub txid: Txid,
    /// Absent while the transaction is unconfirmed.
    pub blockhash: Option<BlockHash>,
    pub vout: Vec<VerboseTxOut>,
}

/// The fields of a `getblock` (verbosity 1) response used for recovery.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTxids {
    pub hash: BlockHash,
    pub height: u32,
    pub tx: Vec<Txid>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: usize,
    result: Option<Value>,
    error: Option<RpcError>,
}

/// Places batch responses back in request order.
fn order_responses(expected: usize, responses: Vec<RpcResponse>) -> Result<Vec<RpcResult>> {
    if responses.len() != expected {
        return Err(Error::BatchLength {
            expected,
            got: responses.len(),
        });
    }

    let mut ordered: Vec<Option<RpcResult>> = (0..expected).map(|_| None).collect();
    for response in responses {
        let Some(slot) = ordered.get_mut(response.id) else {
            return Err(Error::MissingResponse(response.id));
        };
        *slot = Some(match response.error {
            Some(err) => Err(err),
            None => Ok(response.result.unwrap_or(Value::Null)),
        });
    }

    ordered
        .into_iter()
        .enumerate()
        .map(|(id, result)| result.ok_or(Error::MissingResponse(id)))
        .collect()
}

/// HTTP JSON-RPC client for a bitcoind-compatible daemon.
pub struct BitcoindClient {
    client: Client,
    url: String,
    auth: Option<(String, String)>,
}

impl BitcoindClient {
    /// Create a new instance of [`BitcoindClient`].
    pub fn new(url: impl Into<String>, auth: Option<(String, String)>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            auth,
        }
    }
}

#[async_trait::async_trait]
impl DaemonClient for BitcoindClient {
    async fn batch(&self, requests: Vec<RpcRequest>) -> Result<Vec<RpcResult>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let body: Vec<Value> = requests
            .iter()
            .enumerate()
            .map(|(id, request)| {
                json!({
                    "jsonrpc": "1.0",
                    "id": id,
                    "method": request.method,
                    "params": request.params,
                })
            })
            .collect();

        let mut builder = self.client.post(&self.url).json(&body);
        if let Some((user, password)) = &self.auth {
            builder = builder.basic_auth(user, Some(password));
        }

        let responses: Vec<RpcResponse> = builder.send().await?.error_for_status()?.json().await?;

        tracing::trace!(requests = requests.len(), "Daemon batch completed");

        order_responses(requests.len(), responses)
    }
}
