use std::sync::Arc;
use std::time::Duration;

use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::client::RpcClient as AlloyTransportClient;
use alloy::rpc::types::BlockTransactionsKind;
use alloy::transports::http::Http;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

use crate::clock::{exp_backoff_secs, Clock, SystemClock};
use crate::error::IndexerError;
use crate::metrics::{self, Timer};
use crate::types::RemoteBlock;

/// Translates height-range requests into JSON-RPC calls against the chain
/// endpoint, hiding transport failures behind bounded retry.
///
/// An object-safe async trait so the orchestrator can be constructed against
/// a fake implementation in tests instead of a live endpoint.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Current chain tip height. Fails only once retries are exhausted.
    async fn head_height(&self) -> Result<u64, IndexerError>;

    /// Fetches the block at height `n`. Returns `None`, not an error, when
    /// the endpoint reports no such block (future or pruned height).
    async fn get_block(&self, n: u64) -> Result<Option<RemoteBlock>, IndexerError>;

    /// Fetches heights `from..=to` inclusive. Each height must yield a
    /// block or the whole call fails — a gap inside the range is a fault.
    async fn get_range(&self, from: u64, to: u64) -> Result<Vec<RemoteBlock>, IndexerError>;

    /// Fetches an arbitrary set of heights with at most `concurrency` in
    /// flight at once. Heights returning `None` are silently dropped.
    async fn get_set(
        &self,
        heights: &[u64],
        concurrency: usize,
    ) -> Result<Vec<RemoteBlock>, IndexerError>;

    /// Single liveness probe; never raises.
    async fn healthy(&self) -> bool;

    /// Releases any persistent transport. Idempotent.
    async fn close(&self);
}

/// `RpcClient` implementation backed by an `alloy` HTTP JSON-RPC provider.
pub struct AlloyRpcClient {
    provider: Box<dyn Provider + Send + Sync>,
    retries: u32,
    clock: Arc<dyn Clock>,
}

impl AlloyRpcClient {
    /// Builds the client and verifies the endpoint's chain id matches
    /// `expected_chain_id`. An optional websocket endpoint is probed once
    /// for logging only — its failure is never fatal, and it is not used
    /// for anything afterwards. `timeout_ms` bounds every individual RPC
    /// call (spec §6); a stalled endpoint fails the call and falls into the
    /// retry/backoff path below instead of blocking its batch forever.
    pub async fn connect(
        rpc_url: &str,
        ws_url: Option<&str>,
        expected_chain_id: u64,
        retries: u32,
        timeout_ms: u64,
    ) -> Result<Self, IndexerError> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| IndexerError::Config(format!("invalid RPC_URL {rpc_url}: {e}")))?;

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| IndexerError::Config(format!("failed to build http client: {e}")))?;
        let transport = Http::with_client(http_client, url);
        let rpc_client = AlloyTransportClient::new(transport, false);
        let provider = ProviderBuilder::new().on_client(rpc_client);

        let observed = provider
            .get_chain_id()
            .await
            .map_err(|e| IndexerError::transport("eth_chainId", e))?;
        if observed != expected_chain_id {
            return Err(IndexerError::Config(format!(
                "configured chain id {expected_chain_id} does not match endpoint chain id {observed}"
            )));
        }

        if let Some(ws) = ws_url {
            match ws.parse::<Url>() {
                Ok(_) => debug!(ws_url = ws, "optional websocket endpoint configured (unused)"),
                Err(e) => warn!(ws_url = ws, error = %e, "ignoring invalid websocket endpoint"),
            }
        }

        Ok(Self {
            provider: Box::new(provider),
            retries,
            clock: Arc::new(SystemClock),
        })
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn fetch_block(&self, n: u64) -> Result<Option<RemoteBlock>, IndexerError> {
        let timer = Timer::new();
        let block = self
            .provider
            .get_block_by_number(n.into(), BlockTransactionsKind::Hashes)
            .await
            .map_err(|e| IndexerError::transport("eth_getBlockByNumber", e))?;
        metrics::record_rpc_call_duration("eth_getBlockByNumber", timer.elapsed_secs());

        let Some(block) = block else {
            return Ok(None);
        };

        let number = block.header.number;
        if number != n {
            return Err(IndexerError::SchemaMismatch(format!(
                "requested height {n} but endpoint returned {number}"
            )));
        }

        let raw = serde_json::to_value(&block)
            .map_err(|e| IndexerError::Transform(format!("failed to re-encode block: {e}")))?;
        let remote: RemoteBlock = serde_json::from_value(raw)
            .map_err(|e| IndexerError::SchemaMismatch(format!("block {n} missing fields: {e}")))?;
        Ok(Some(remote))
    }
}

#[async_trait]
impl RpcClient for AlloyRpcClient {
    async fn head_height(&self) -> Result<u64, IndexerError> {
        let mut last_err = None;
        for attempt in 0..=self.retries {
            let timer = Timer::new();
            match self.provider.get_block_number().await {
                Ok(height) => {
                    metrics::record_rpc_call_duration("eth_blockNumber", timer.elapsed_secs());
                    return Ok(height);
                }
                Err(e) => {
                    metrics::increment_rpc_errors("eth_blockNumber", "transport");
                    warn!(attempt, error = %e, "eth_blockNumber failed, retrying");
                    last_err = Some(e);
                    if attempt < self.retries {
                        self.clock
                            .sleep(Duration::from_secs(exp_backoff_secs(attempt)))
                            .await;
                    }
                }
            }
        }
        Err(IndexerError::transport(
            "eth_blockNumber",
            last_err.expect("loop always sets last_err before exhausting retries"),
        ))
    }

    async fn get_block(&self, n: u64) -> Result<Option<RemoteBlock>, IndexerError> {
        let mut attempt = 0;
        loop {
            match self.fetch_block(n).await {
                Ok(result) => return Ok(result),
                Err(err @ IndexerError::SchemaMismatch(_)) if attempt < self.retries => {
                    metrics::increment_rpc_errors("eth_getBlockByNumber", err.kind());
                    attempt += 1;
                    self.clock
                        .sleep(Duration::from_secs(exp_backoff_secs(attempt - 1)))
                        .await;
                }
                Err(err @ IndexerError::Transport { .. }) if attempt < self.retries => {
                    metrics::increment_rpc_errors("eth_getBlockByNumber", err.kind());
                    warn!(height = n, attempt, error = %err, "getBlock transport error, retrying");
                    attempt += 1;
                    self.clock
                        .sleep(Duration::from_secs(exp_backoff_secs(attempt - 1)))
                        .await;
                }
                Err(err) => {
                    metrics::increment_rpc_errors("eth_getBlockByNumber", err.kind());
                    return Err(err);
                }
            }
        }
    }

    async fn get_range(&self, from: u64, to: u64) -> Result<Vec<RemoteBlock>, IndexerError> {
        let mut out = Vec::with_capacity((to.saturating_sub(from) + 1) as usize);
        for n in from..=to {
            match self.get_block(n).await? {
                Some(block) => out.push(block),
                None => {
                    return Err(IndexerError::SchemaMismatch(format!(
                        "missing block at height {n} inside range [{from}, {to}]"
                    )))
                }
            }
        }
        Ok(out)
    }

    async fn get_set(
        &self,
        heights: &[u64],
        concurrency: usize,
    ) -> Result<Vec<RemoteBlock>, IndexerError> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = FuturesUnordered::new();

        for &n in heights {
            let semaphore = semaphore.clone();
            tasks.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                self.get_block(n).await
            });
        }

        let mut out = Vec::new();
        while let Some(result) = tasks.next().await {
            if let Some(block) = result? {
                out.push(block);
            }
        }
        Ok(out)
    }

    async fn healthy(&self) -> bool {
        self.provider.get_block_number().await.is_ok()
    }

    async fn close(&self) {
        info!("rpc transport closed");
    }
}
