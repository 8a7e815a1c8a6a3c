use crate::commands::tools::Tools;
use crate::commands::{flush_mempool, resolve, rollback_blocks, status};
use clap::Parser;
use connector_utxo::{BitcoindClient, ConnectorDatabase, UnconfirmedConfig, UtxoCacheConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Connector(#[from] connector_utxo::Error),

    #[error("Invalid input: {0}")]
    Input(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Show durable watermarks and table sizes.
    Status,

    /// Look outpoints up in the store, then in the daemon.
    ///
    /// Read-only: nothing is written back to the store.
    Resolve {
        /// Outpoints as `txid:vout`.
        #[arg(required = true)]
        outpoints: Vec<String>,
    },

    /// Drop every unconfirmed output and spend.
    FlushMempool,

    /// Undo the most recently applied blocks.
    RollbackBlock {
        /// Number of blocks to undo, newest first.
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// Utility tools.
    #[command(subcommand)]
    Tools(Tools),
}

/// Chain daemon connection.
#[derive(Debug, Clone, clap::Args)]
pub struct DaemonParams {
    /// JSON-RPC endpoint of the chain daemon.
    #[arg(long, default_value = "http://127.0.0.1:8332")]
    pub rpc_url: String,

    #[arg(long)]
    pub rpc_user: Option<String>,

    #[arg(long)]
    pub rpc_password: Option<String>,
}

impl DaemonParams {
    pub fn client(&self) -> BitcoindClient {
        let auth = self.rpc_user.clone().map(|user| {
            let password = self.rpc_password.clone().unwrap_or_default();
            (user, password)
        });
        BitcoindClient::new(self.rpc_url.clone(), auth)
    }
}

/// Cache sizing.
#[derive(Debug, Clone, clap::Args)]
pub struct CacheParams {
    /// Confirmed UTXO cache size, in entries.
    #[arg(long, default_value_t = 1_000_000)]
    pub utxo_cache_size: usize,

    /// Outpoints resolved per daemon batch.
    #[arg(long, default_value_t = 50)]
    pub daemon_batch_size: usize,

    /// Capacity of each of the unconfirmed set's loaded caches.
    #[arg(long, default_value_t = 100_000)]
    pub loaded_cache_size: u32,
}

impl CacheParams {
    pub fn utxo_config(&self) -> UtxoCacheConfig {
        UtxoCacheConfig {
            cache_size: self.utxo_cache_size,
            daemon_batch_size: self.daemon_batch_size,
            ..Default::default()
        }
    }

    pub fn unconfirmed_config(&self) -> UnconfirmedConfig {
        UnconfirmedConfig {
            loaded_outputs_cache_size: self.loaded_cache_size,
            loaded_spends_cache_size: self.loaded_cache_size,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "connector", version, about = "UTXO connector administration")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path of the connector SQLite database.
    #[arg(long, default_value = "connector.sqlite")]
    pub database: PathBuf,

    /// Log filter, overridden by `RUST_LOG` when set.
    #[arg(short, long, default_value = "info")]
    pub log: String,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub daemon: DaemonParams,

    #[allow(missing_docs)]
    #[clap(flatten)]
    pub cache: CacheParams,
}

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse and run command line arguments
pub async fn run() -> Result<()> {
    let Cli {
        command,
        database,
        log,
        daemon,
        cache,
    } = Cli::parse();

    init_logging(&log);

    match command {
        Command::Tools(tools) => tools.run(),
        Command::Status => status(&ConnectorDatabase::open(&database).await?).await,
        Command::Resolve { outpoints } => {
            let db = ConnectorDatabase::open(&database).await?;
            resolve(db, &daemon, &cache, &outpoints).await
        }
        Command::FlushMempool => {
            let db = ConnectorDatabase::open(&database).await?;
            flush_mempool(db, &cache).await
        }
        Command::RollbackBlock { count } => {
            let db = ConnectorDatabase::open(&database).await?;
            rollback_blocks(db, &cache, count).await
        }
    }
}
