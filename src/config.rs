use std::error::Error;

use serde::Deserialize;

/// Typed, explicitly-constructed configuration for the indexer.
///
/// Built once in `main` via [`AppConfig::from_env`] and threaded through to
/// the RPC client, writer, and orchestrator constructors. There is no
/// process-wide singleton to reach for from elsewhere in the crate.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    pub db_max_connections: usize,

    pub rpc_url: String,
    pub rpc_ws_url: Option<String>,
    pub rpc_timeout_ms: u64,
    pub rpc_retries: u32,

    pub chain_id: u64,

    pub indexer_start_block: u64,
    pub indexer_batch_size: u64,
    pub indexer_parallel_batches: usize,
    pub indexer_block_delay_ms: u64,
    pub indexer_enable_reorg_check: bool,
    pub indexer_poll_interval_ms: u64,

    pub log_level: String,
    pub log_format: String,
    pub log_file: Option<String>,
}

impl AppConfig {
    /// Loads configuration from environment variables, applying the same
    /// defaults as the variable table it mirrors.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let builder = config::Config::builder()
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_name", "pulsechain_explorer")?
            .set_default("db_user", "postgres")?
            .set_default("db_password", "")?
            .set_default("db_max_connections", 20)?
            .set_default("rpc_url", "https://rpc.pulsechain.com")?
            .set_default("rpc_ws_url", "wss://rpc.pulsechain.com")?
            .set_default("rpc_timeout_ms", 30_000)?
            .set_default("rpc_retries", 3)?
            .set_default("chain_id", 369)?
            .set_default("indexer_start_block", 0)?
            .set_default("indexer_batch_size", 50)?
            .set_default("indexer_parallel_batches", 5)?
            .set_default("indexer_block_delay_ms", 0)?
            .set_default("indexer_enable_reorg_check", true)?
            .set_default("indexer_poll_interval_ms", 12_000)?
            .set_default("log_level", "info")?
            .set_default("log_format", "pretty")?
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .separator("__"),
            )
            .build()?;

        let cfg: AppConfig = builder
            .try_deserialize()
            .map_err(|e| format!("invalid configuration: {e}"))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.rpc_url.is_empty() {
            return Err("RPC_URL must not be empty".into());
        }
        if self.indexer_batch_size == 0 {
            return Err("INDEXER_BATCH_SIZE must be at least 1".into());
        }
        if self.indexer_parallel_batches == 0 {
            return Err("INDEXER_PARALLEL_BATCHES must be at least 1".into());
        }
        Ok(())
    }

    pub fn db_connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.db_host, self.db_port, self.db_name, self.db_user, self.db_password
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        std::env::remove_var("RPC_URL");
        let cfg = AppConfig::from_env().expect("defaults should be valid");
        assert_eq!(cfg.chain_id, 369);
        assert_eq!(cfg.indexer_batch_size, 50);
        assert_eq!(cfg.indexer_parallel_batches, 5);
    }
}
