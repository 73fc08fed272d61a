/// Chain Reorganization Handling
///
/// When the canonical chain changes, the store's tail rows must be deleted
/// and re-indexed against the endpoint's new canonical hashes.
///
/// CRITICAL DEPENDENCIES:
/// - block_writer.rs: `delete_from` makes the rollback atomic (one DELETE).
use tracing::{info, warn};

use crate::block_writer::BlockWriter;
use crate::error::IndexerError;
use crate::types::Block;

/// Reports that a reorg was found and repaired while checking a batch.
#[derive(Debug, Clone)]
pub struct ReorgOutcome {
    /// Height where the stored and fetched hashes first diverged.
    pub fork_height: u64,
    /// Rows with `number >= fork_height` that were deleted.
    pub rows_deleted: u64,
}

/// Scans `batch` (in ascending height order) for the first height whose
/// stored hash differs from the fetched hash, skipping height 0. On the
/// first divergence, deletes every row from that height onward and returns
/// immediately — deeper divergences in the same batch are handled as a
/// side effect of the delete, since `saveBatch` will re-write the whole
/// batch over the vacated range afterwards.
///
/// Returns `Ok(None)` when no divergence is found.
pub async fn check_and_repair(
    writer: &dyn BlockWriter,
    batch: &[Block],
) -> Result<Option<ReorgOutcome>, IndexerError> {
    for block in batch {
        if block.number == 0 {
            continue;
        }

        let Some(stored) = writer.get(block.number).await? else {
            continue;
        };

        if stored.hash != block.hash {
            warn!(
                height = block.number,
                stored_hash = %stored.hash,
                new_hash = %block.hash,
                "reorg detected"
            );
            let rows_deleted = writer.delete_from(block.number).await?;
            info!(
                fork_height = block.number,
                rows_deleted, "reorg repair: deleted stale tail"
            );
            crate::metrics::record_reorg(rows_deleted);
            return Ok(Some(ReorgOutcome {
                fork_height: block.number,
                rows_deleted,
            }));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBlockWriter;
    use alloy::primitives::{Address, B256};
    use time::OffsetDateTime;

    fn block(number: u64, hash: u8) -> Block {
        Block {
            hash: B256::repeat_byte(hash),
            number,
            parent_hash: B256::ZERO,
            miner: Address::ZERO,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            gas_limit: Default::default(),
            gas_used: Default::default(),
            base_fee_per_gas: None,
            transactions_root: B256::ZERO,
            state_root: B256::ZERO,
            receipts_root: B256::ZERO,
            difficulty: None,
            nonce: Default::default(),
            extra_data: None,
            size: 0,
            transaction_count: 0,
        }
    }

    #[tokio::test]
    async fn no_divergence_returns_none() {
        let writer = FakeBlockWriter::new();
        writer.save_batch(&[block(100, 1), block(101, 2)]).await.unwrap();

        let outcome = check_and_repair(&writer, &[block(100, 1), block(101, 2)])
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn divergence_deletes_from_fork_height() {
        let writer = FakeBlockWriter::new();
        writer
            .save_batch(&(100..=110).map(|n| block(n, 1)).collect::<Vec<_>>())
            .await
            .unwrap();

        let fetched: Vec<Block> = (100..=110).map(|n| block(n, 2)).collect();
        let outcome = check_and_repair(&writer, &fetched).await.unwrap().unwrap();

        assert_eq!(outcome.fork_height, 100);
        assert_eq!(outcome.rows_deleted, 11);
        assert!(writer.get(100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn height_zero_is_never_checked() {
        let writer = FakeBlockWriter::new();
        writer.save_batch(&[block(0, 1)]).await.unwrap();

        let outcome = check_and_repair(&writer, &[block(0, 2)]).await.unwrap();
        assert!(outcome.is_none());
    }
}
