//! In-memory fakes for `RpcClient` and `BlockWriter`, used so every
//! scenario in the orchestrator's test suite runs without a live endpoint
//! or database.
#![cfg(test)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::block_writer::BlockWriter;
use crate::error::IndexerError;
use crate::rpc_client::RpcClient;
use crate::types::{transform, Block, RemoteBlock, WriterStats};

/// In-memory stand-in for an RPC endpoint. Heights present in `blocks` are
/// served; everything else returns `None`. `fail_heights` forces a
/// transport error the configured number of times before succeeding, to
/// exercise retry behavior.
pub struct FakeRpcClient {
    blocks: Mutex<BTreeMap<u64, RemoteBlock>>,
    head: Mutex<u64>,
    fail_until: Mutex<BTreeMap<u64, u32>>,
    calls: Mutex<Vec<u64>>,
}

impl FakeRpcClient {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(BTreeMap::new()),
            head: Mutex::new(0),
            fail_until: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_head(self, head: u64) -> Self {
        *self.head.lock().unwrap() = head;
        self
    }

    pub fn set_head(&self, head: u64) {
        *self.head.lock().unwrap() = head;
    }

    pub fn insert(&self, block: RemoteBlock) {
        let number = block.number.to::<u64>();
        self.blocks.lock().unwrap().insert(number, block);
    }

    /// The next `count` calls to `get_block`/`get_range` for `height` fail
    /// with a transport error before succeeding.
    pub fn fail_height_n_times(&self, height: u64, count: u32) {
        self.fail_until.lock().unwrap().insert(height, count);
    }

    pub fn call_count(&self, height: u64) -> usize {
        self.calls.lock().unwrap().iter().filter(|&&h| h == height).count()
    }
}

#[async_trait]
impl RpcClient for FakeRpcClient {
    async fn head_height(&self) -> Result<u64, IndexerError> {
        Ok(*self.head.lock().unwrap())
    }

    async fn get_block(&self, n: u64) -> Result<Option<RemoteBlock>, IndexerError> {
        self.calls.lock().unwrap().push(n);

        let mut fail_until = self.fail_until.lock().unwrap();
        if let Some(remaining) = fail_until.get_mut(&n) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(IndexerError::transport(
                    "eth_getBlockByNumber",
                    std::io::Error::new(std::io::ErrorKind::Other, "injected failure"),
                ));
            }
        }

        Ok(self.blocks.lock().unwrap().get(&n).cloned())
    }

    async fn get_range(&self, from: u64, to: u64) -> Result<Vec<RemoteBlock>, IndexerError> {
        let mut out = Vec::new();
        for n in from..=to {
            match self.get_block(n).await? {
                Some(b) => out.push(b),
                None => {
                    return Err(IndexerError::SchemaMismatch(format!(
                        "missing block at height {n}"
                    )))
                }
            }
        }
        Ok(out)
    }

    async fn get_set(
        &self,
        heights: &[u64],
        _concurrency: usize,
    ) -> Result<Vec<RemoteBlock>, IndexerError> {
        let mut out = Vec::new();
        for &n in heights {
            if let Some(b) = self.get_block(n).await? {
                out.push(b);
            }
        }
        Ok(out)
    }

    async fn healthy(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

/// In-memory stand-in for the Postgres store, matching the same
/// conflict-on-hash and `deleteFrom` semantics as `PostgresBlockWriter`.
pub struct FakeBlockWriter {
    rows: Mutex<BTreeMap<u64, Block>>,
}

impl FakeBlockWriter {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl BlockWriter for FakeBlockWriter {
    async fn save_one(&self, block: &Block) -> Result<bool, IndexerError> {
        let mut rows = self.rows.lock().unwrap();
        if rows.values().any(|b| b.hash == block.hash) {
            return Ok(false);
        }
        rows.insert(block.number, block.clone());
        Ok(true)
    }

    async fn save_batch(&self, blocks: &[Block]) -> Result<u64, IndexerError> {
        let mut rows = self.rows.lock().unwrap();
        let mut inserted = 0u64;
        for block in blocks {
            if rows.values().any(|b| b.hash == block.hash) {
                continue;
            }
            rows.insert(block.number, block.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn exists(&self, number: u64) -> Result<bool, IndexerError> {
        Ok(self.rows.lock().unwrap().contains_key(&number))
    }

    async fn get(&self, number: u64) -> Result<Option<Block>, IndexerError> {
        Ok(self.rows.lock().unwrap().get(&number).cloned())
    }

    async fn highest(&self) -> Result<Option<u64>, IndexerError> {
        Ok(self.rows.lock().unwrap().keys().next_back().copied())
    }

    async fn count(&self) -> Result<u64, IndexerError> {
        Ok(self.rows.lock().unwrap().len() as u64)
    }

    async fn delete_from(&self, n: u64) -> Result<u64, IndexerError> {
        let mut rows = self.rows.lock().unwrap();
        let to_remove: Vec<u64> = rows.range(n..).map(|(&k, _)| k).collect();
        for key in &to_remove {
            rows.remove(key);
        }
        Ok(to_remove.len() as u64)
    }

    async fn stats(&self) -> Result<WriterStats, IndexerError> {
        let rows = self.rows.lock().unwrap();
        let total_blocks = rows.len() as u64;
        let first_block = rows.keys().next().copied();
        let last_block = rows.keys().next_back().copied();
        let total_transactions: u64 = rows.values().map(|b| b.transaction_count as u64).sum();

        Ok(WriterStats {
            total_blocks,
            first_block,
            last_block,
            total_transactions,
            avg_tx_per_block: if total_blocks > 0 {
                total_transactions as f64 / total_blocks as f64
            } else {
                0.0
            },
            total_gas_used: Default::default(),
            avg_gas_per_block: 0.0,
        })
    }
}

/// Builds a `RemoteBlock` fixture with a distinct hash derived from `number`.
pub fn remote_block(number: u64, parent_number: u64) -> RemoteBlock {
    remote_block_with_hash(number, parent_number, number as u8)
}

pub fn remote_block_with_hash(number: u64, parent_number: u64, hash_byte: u8) -> RemoteBlock {
    use alloy::primitives::{Address, U256, U64};

    RemoteBlock {
        hash: alloy::primitives::B256::repeat_byte(hash_byte),
        number: U64::from(number),
        parent_hash: alloy::primitives::B256::repeat_byte(parent_number as u8),
        miner: Address::repeat_byte(0xAA),
        timestamp: U64::from(1_700_000_000u64 + number),
        gas_limit: U256::from(30_000_000u64),
        gas_used: U256::from(21_000u64),
        base_fee_per_gas: None,
        transactions_root: None,
        state_root: None,
        receipts_root: None,
        difficulty: None,
        nonce: None,
        extra_data: None,
        size: None,
        transactions: vec![],
        logs_bloom: None,
    }
}

pub fn sample_block(number: u64) -> Block {
    transform(&remote_block(number, number.saturating_sub(1))).unwrap()
}
