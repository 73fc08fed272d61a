use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::block_writer::BlockWriter;
use crate::clock::{exp_backoff_secs, Clock};
use crate::reorg::{check_and_repair, ReorgOutcome};
use crate::rpc_client::RpcClient;
use crate::types::transform;

/// A contiguous height range processed as one fetch-and-commit unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRange {
    pub from: u64,
    pub to: u64,
}

/// Result of running one batch to completion (or exhausting its retries).
///
/// `reorg` is populated whenever `check_and_repair` found and deleted a
/// divergent tail during this batch, regardless of whether the batch's own
/// `saveBatch` afterward succeeded — the caller needs to know the store's
/// tail was rolled back even when the batch itself is reported `Failed`.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Completed {
        from: u64,
        to: u64,
        reorg: Option<ReorgOutcome>,
    },
    Failed {
        from: u64,
        to: u64,
        error: String,
        reorg: Option<ReorgOutcome>,
    },
}

impl BatchOutcome {
    pub fn range_label(&self) -> String {
        match self {
            BatchOutcome::Completed { from, to, .. } | BatchOutcome::Failed { from, to, .. } => {
                format!("{from}-{to}")
            }
        }
    }

    pub fn reorg(&self) -> Option<&ReorgOutcome> {
        match self {
            BatchOutcome::Completed { reorg, .. } | BatchOutcome::Failed { reorg, .. } => {
                reorg.as_ref()
            }
        }
    }
}

/// Partitions `[from, to]` into contiguous batches of `batch_size`; the
/// last batch may be shorter. Preserves ascending order.
pub fn partition_into_batches(from: u64, to: u64, batch_size: u64) -> Vec<BatchRange> {
    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = (start + batch_size - 1).min(to);
        ranges.push(BatchRange { from: start, to: end });
        start = end + 1;
    }
    ranges
}

/// Runs one batch as `fetch -> optional reorg check -> saveBatch`, retrying
/// the whole unit up to `retries + 1` times. Between attempt *k* and *k+1*
/// sleeps `2^k` seconds starting at `k=1` (2s, 4s, 8s...), distinct from the
/// RPC client's own `getBlock` retry schedule.
///
/// Returns the most recent reorg observed across attempts alongside the
/// final success/failure — a reorg detected on an attempt whose `saveBatch`
/// subsequently fails must still reach the caller, since `delete_from` is
/// not undone by that failure.
#[instrument(skip(rpc, writer, clock), fields(from = range.from, to = range.to))]
async fn fetch_and_commit_with_retry(
    range: BatchRange,
    rpc: &dyn RpcClient,
    writer: &dyn BlockWriter,
    clock: &dyn Clock,
    retries: u32,
    enable_reorg_check: bool,
) -> (Option<ReorgOutcome>, Result<(), String>) {
    let mut attempt = 0u32;
    let mut last_reorg = None;
    loop {
        let (reorg, result) = run_once(range, rpc, writer, enable_reorg_check).await;
        if reorg.is_some() {
            last_reorg = reorg;
        }
        match result {
            Ok(()) => return (last_reorg, Ok(())),
            Err(err) if attempt < retries => {
                attempt += 1;
                warn!(attempt, error = %err, "batch failed, retrying");
                clock
                    .sleep(Duration::from_secs(exp_backoff_secs(attempt)))
                    .await;
            }
            Err(err) => return (last_reorg, Err(err.to_string())),
        }
    }
}

/// Runs fetch/reorg-check/save exactly once. The returned `ReorgOutcome` is
/// always surfaced, even on a subsequent `save_batch` failure, so callers
/// never lose track of a tail that was already deleted.
async fn run_once(
    range: BatchRange,
    rpc: &dyn RpcClient,
    writer: &dyn BlockWriter,
    enable_reorg_check: bool,
) -> (Option<ReorgOutcome>, Result<(), crate::error::IndexerError>) {
    let remote_blocks = match rpc.get_range(range.from, range.to).await {
        Ok(blocks) => blocks,
        Err(err) => return (None, Err(err)),
    };

    let mut blocks = Vec::with_capacity(remote_blocks.len());
    for remote in &remote_blocks {
        match transform(remote) {
            Ok(block) => blocks.push(block),
            Err(err) => return (None, Err(err)),
        }
    }

    let reorg = if enable_reorg_check {
        match check_and_repair(writer, &blocks).await {
            Ok(reorg) => reorg,
            Err(err) => return (None, Err(err)),
        }
    } else {
        None
    };

    match writer.save_batch(&blocks).await {
        Ok(_) => (reorg, Ok(())),
        Err(err) => (reorg, Err(err)),
    }
}

/// Runs a chunk of up to `concurrency` batches truly concurrently. Each
/// batch's failure is independent — one rejection does not cancel its
/// siblings. Waits for every outcome before returning.
pub async fn run_chunk(
    ranges: Vec<BatchRange>,
    rpc: Arc<dyn RpcClient>,
    writer: Arc<dyn BlockWriter>,
    clock: Arc<dyn Clock>,
    retries: u32,
    enable_reorg_check: bool,
    concurrency: usize,
) -> Vec<BatchOutcome> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    let tasks: Vec<_> = ranges
        .into_iter()
        .map(|range| {
            let semaphore = semaphore.clone();
            let rpc = rpc.clone();
            let writer = writer.clone();
            let clock = clock.clone();

            async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                let (reorg, result) = fetch_and_commit_with_retry(
                    range,
                    rpc.as_ref(),
                    writer.as_ref(),
                    clock.as_ref(),
                    retries,
                    enable_reorg_check,
                )
                .await;

                match result {
                    Ok(()) => BatchOutcome::Completed {
                        from: range.from,
                        to: range.to,
                        reorg,
                    },
                    Err(error) => BatchOutcome::Failed {
                        from: range.from,
                        to: range.to,
                        error,
                        reorg,
                    },
                }
            }
        })
        .collect();

    join_all(tasks).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::error::IndexerError;
    use crate::test_support::{remote_block_with_hash, FakeBlockWriter, FakeRpcClient};
    use crate::types::WriterStats;
    use async_trait::async_trait;

    /// Wraps a `FakeBlockWriter` but fails every `save_batch` after
    /// delegating the call, so a test can exercise the window where
    /// `delete_from` already ran and `save_batch` afterward errors.
    struct FailSaveWriter {
        inner: FakeBlockWriter,
    }

    #[async_trait]
    impl BlockWriter for FailSaveWriter {
        async fn save_one(&self, block: &crate::types::Block) -> Result<bool, IndexerError> {
            self.inner.save_one(block).await
        }
        async fn save_batch(&self, _blocks: &[crate::types::Block]) -> Result<u64, IndexerError> {
            Err(IndexerError::db(
                "insert",
                std::io::Error::new(std::io::ErrorKind::Other, "injected save failure"),
            ))
        }
        async fn exists(&self, number: u64) -> Result<bool, IndexerError> {
            self.inner.exists(number).await
        }
        async fn get(&self, number: u64) -> Result<Option<crate::types::Block>, IndexerError> {
            self.inner.get(number).await
        }
        async fn highest(&self) -> Result<Option<u64>, IndexerError> {
            self.inner.highest().await
        }
        async fn count(&self) -> Result<u64, IndexerError> {
            self.inner.count().await
        }
        async fn delete_from(&self, n: u64) -> Result<u64, IndexerError> {
            self.inner.delete_from(n).await
        }
        async fn stats(&self) -> Result<WriterStats, IndexerError> {
            self.inner.stats().await
        }
    }

    // Reproduces the case where delete_from succeeds but the batch's own
    // save_batch afterward fails: the reorg must still surface on the
    // Failed outcome, not be silently dropped.
    #[tokio::test]
    async fn reorg_survives_a_subsequent_save_batch_failure() {
        let writer = FakeBlockWriter::new();
        writer
            .save_batch(&(100..=101).map(|n| crate::test_support::sample_block(n)).collect::<Vec<_>>())
            .await
            .unwrap();
        let writer = Arc::new(FailSaveWriter { inner: writer });

        let rpc = Arc::new(FakeRpcClient::new().with_head(101));
        rpc.insert(remote_block_with_hash(100, 99, 0xBB));
        rpc.insert(remote_block_with_hash(101, 100, 0xBB));

        let outcomes = run_chunk(
            vec![BatchRange { from: 100, to: 101 }],
            rpc,
            writer,
            Arc::new(FakeClock::new()),
            0,
            true,
            1,
        )
        .await;

        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            BatchOutcome::Failed { reorg, .. } => {
                let reorg = reorg.as_ref().expect("reorg must survive the save failure");
                assert_eq!(reorg.fork_height, 100);
            }
            other => panic!("expected Failed outcome, got {other:?}"),
        }
    }

    #[test]
    fn partitions_exact_multiples() {
        let batches = partition_into_batches(0, 99, 50);
        assert_eq!(batches, vec![
            BatchRange { from: 0, to: 49 },
            BatchRange { from: 50, to: 99 },
        ]);
    }

    #[test]
    fn last_batch_may_be_shorter() {
        let batches = partition_into_batches(0, 105, 50);
        assert_eq!(
            batches,
            vec![
                BatchRange { from: 0, to: 49 },
                BatchRange { from: 50, to: 99 },
                BatchRange { from: 100, to: 105 },
            ]
        );
    }

    #[test]
    fn single_height_range() {
        let batches = partition_into_batches(100, 100, 50);
        assert_eq!(batches, vec![BatchRange { from: 100, to: 100 }]);
    }
}
