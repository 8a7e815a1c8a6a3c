//! Tunables for the confirmed cache and the unconfirmed set.

/// Configuration of [`crate::UtxoCache`].
#[derive(Debug, Clone)]
pub struct UtxoCacheConfig {
    /// Number of entries the cache may hold before checkpoints start draining
    /// blocks beyond the mandatory checkpoint.
    pub cache_size: usize,
    /// Capacity of the block cache used while recovering outputs from the daemon.
    pub restore_blocks_cache_size: u32,
    /// Number of outpoints resolved per daemon batch.
    pub daemon_batch_size: usize,
}

impl Default for UtxoCacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 1_000_000,
            restore_blocks_cache_size: 1000,
            daemon_batch_size: 50,
        }
    }
}

/// Configuration of [`crate::UnconfirmedSet`].
#[derive(Debug, Clone)]
pub struct UnconfirmedConfig {
    pub loaded_outputs_cache_size: u32,
    pub loaded_spends_cache_size: u32,
}

impl Default for UnconfirmedConfig {
    fn default() -> Self {
        Self {
            loaded_outputs_cache_size: 100_000,
            loaded_spends_cache_size: 100_000,
        }
    }
}
