use alloy::primitives::{Address, Bloom, Bytes, B256, U256, U64};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::IndexerError;

/// The wire shape of `eth_getBlockByNumber`'s result — only the fields the
/// indexing core depends on are parsed; everything else is ignored by serde.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteBlock {
    pub hash: B256,
    pub number: U64,
    #[serde(rename = "parentHash")]
    pub parent_hash: B256,
    pub miner: Address,
    pub timestamp: U64,
    #[serde(rename = "gasLimit")]
    pub gas_limit: U256,
    #[serde(rename = "gasUsed")]
    pub gas_used: U256,
    #[serde(rename = "baseFeePerGas")]
    pub base_fee_per_gas: Option<U256>,
    #[serde(rename = "transactionsRoot")]
    pub transactions_root: Option<B256>,
    #[serde(rename = "stateRoot")]
    pub state_root: Option<B256>,
    #[serde(rename = "receiptsRoot")]
    pub receipts_root: Option<B256>,
    pub difficulty: Option<U256>,
    pub nonce: Option<Bytes>,
    #[serde(rename = "extraData")]
    pub extra_data: Option<Bytes>,
    pub size: Option<U64>,
    #[serde(default)]
    pub transactions: Vec<serde_json::Value>,
    #[serde(default, rename = "logsBloom")]
    pub logs_bloom: Option<Bloom>,
}

/// The persisted row shape described for the `blocks` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub hash: B256,
    pub number: u64,
    pub parent_hash: B256,
    pub miner: Address,
    pub timestamp: OffsetDateTime,
    pub gas_limit: U256,
    pub gas_used: U256,
    pub base_fee_per_gas: Option<U256>,
    pub transactions_root: B256,
    pub state_root: B256,
    pub receipts_root: B256,
    pub difficulty: Option<U256>,
    pub nonce: Bytes,
    pub extra_data: Option<Bytes>,
    pub size: u32,
    pub transaction_count: i32,
}

/// Transforms an RPC block into the persistent row shape.
///
/// Hex fields are decoded once here, never round-tripped as text. Missing
/// Merkle roots become 32 zero bytes (never null); `extra_data` and
/// `base_fee_per_gas` stay nullable. `size` is copied verbatim when present,
/// best-effort per the remote's (non-standard) reporting of it.
pub fn transform(remote: &RemoteBlock) -> Result<Block, IndexerError> {
    if remote.hash == B256::ZERO && remote.number != U64::from(0) {
        return Err(IndexerError::SchemaMismatch(
            "block is missing a hash".to_string(),
        ));
    }

    let timestamp = OffsetDateTime::from_unix_timestamp(remote.timestamp.to::<i64>())
        .map_err(|e| IndexerError::Transform(format!("invalid block timestamp: {e}")))?;

    if remote.gas_used > remote.gas_limit {
        return Err(IndexerError::Transform(format!(
            "gas_used {} exceeds gas_limit {} at height {}",
            remote.gas_used, remote.gas_limit, remote.number
        )));
    }

    Ok(Block {
        hash: remote.hash,
        number: remote.number.to::<u64>(),
        parent_hash: remote.parent_hash,
        miner: remote.miner,
        timestamp,
        gas_limit: remote.gas_limit,
        gas_used: remote.gas_used,
        base_fee_per_gas: remote.base_fee_per_gas,
        transactions_root: remote.transactions_root.unwrap_or(B256::ZERO),
        state_root: remote.state_root.unwrap_or(B256::ZERO),
        receipts_root: remote.receipts_root.unwrap_or(B256::ZERO),
        difficulty: remote.difficulty,
        nonce: remote.nonce.clone().unwrap_or_default(),
        extra_data: remote.extra_data.clone(),
        size: remote.size.map(|s| s.to::<u32>()).unwrap_or(0),
        transaction_count: remote.transactions.len() as i32,
    })
}

/// Aggregate counters reported by `BlockWriter::stats`.
#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    pub total_blocks: u64,
    pub first_block: Option<u64>,
    pub last_block: Option<u64>,
    pub total_transactions: u64,
    pub avg_tx_per_block: f64,
    pub total_gas_used: U256,
    pub avg_gas_per_block: f64,
}

/// Progress reported by the orchestrator (spec §4.3.7).
#[derive(Debug, Clone)]
pub struct ProgressReport {
    pub chain_height: u64,
    pub indexed: u64,
    pub behind: u64,
    pub progress_pct: String,
    pub first_block: Option<u64>,
    pub last_block: Option<u64>,
    pub total_transactions: u64,
}

impl ProgressReport {
    pub fn new(chain_height: u64, stats: &WriterStats) -> Self {
        let last_block = stats.last_block;
        let progress_pct = match last_block {
            Some(lb) if chain_height > 0 => {
                format!("{:.2}%", (lb as f64 / chain_height as f64) * 100.0)
            }
            _ => "0%".to_string(),
        };
        let behind = chain_height.saturating_sub(last_block.unwrap_or(0));

        Self {
            chain_height,
            indexed: stats.total_blocks,
            behind,
            progress_pct,
            first_block: stats.first_block,
            last_block,
            total_transactions: stats.total_transactions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_remote(number: u64) -> RemoteBlock {
        RemoteBlock {
            hash: B256::repeat_byte(0xAB),
            number: U64::from(number),
            parent_hash: B256::repeat_byte(0xCD),
            miner: Address::repeat_byte(0x01),
            timestamp: U64::from(1_700_000_000u64),
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
            transactions: vec![serde_json::json!("0xdead")],
            logs_bloom: None,
        }
    }

    #[test]
    fn missing_roots_become_zero_bytes() {
        let block = transform(&sample_remote(10)).unwrap();
        assert_eq!(block.transactions_root, B256::ZERO);
        assert_eq!(block.state_root, B256::ZERO);
        assert_eq!(block.receipts_root, B256::ZERO);
    }

    #[test]
    fn transaction_count_matches_length() {
        let block = transform(&sample_remote(10)).unwrap();
        assert_eq!(block.transaction_count, 1);
    }

    #[test]
    fn gas_used_over_limit_is_rejected() {
        let mut remote = sample_remote(10);
        remote.gas_used = U256::from(999_000_000u64);
        assert!(transform(&remote).is_err());
    }

    #[test]
    fn size_defaults_to_zero() {
        let block = transform(&sample_remote(10)).unwrap();
        assert_eq!(block.size, 0);
    }
}
