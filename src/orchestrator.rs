/// Orchestrator — drives the indexing loop end to end.
///
/// Owns the lifecycle state machine, the backfill/chunk/retry algorithm,
/// reorg detection, the tail loop, and progress reporting. The RPC client
/// and writer are constructor-injected collaborators rather than process
/// singletons, so every scenario below is exercisable against fakes.
use std::sync::atomic::{AtomicU64, AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::block_writer::BlockWriter;
use crate::clock::{Clock, SystemClock};
use crate::error::IndexerError;
use crate::metrics;
use crate::parallel::{partition_into_batches, run_chunk, BatchOutcome};
use crate::reorg::ReorgOutcome;
use crate::rpc_client::RpcClient;
use crate::types::ProgressReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    New,
    Initialized,
    Running,
    Stopping,
    Stopped,
}

/// Orchestrator configuration (spec §4.3.1).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub start_block: u64,
    pub batch_size: u64,
    pub parallel_batches: usize,
    pub block_delay_ms: u64,
    pub enable_reorg_check: bool,
    pub rpc_retries: u32,
    pub poll_interval_ms: u64,
}

/// Summary emitted after a backfill run completes (spec §4.3.3 step 3).
#[derive(Debug, Clone)]
pub struct BackfillSummary {
    pub completed: usize,
    pub failed: usize,
    pub failed_ranges: Vec<String>,
}

pub struct Orchestrator {
    rpc: Arc<dyn RpcClient>,
    writer: Arc<dyn BlockWriter>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    state: Mutex<State>,
    current_block: AtomicU64,
    stopping: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(rpc: Arc<dyn RpcClient>, writer: Arc<dyn BlockWriter>, config: OrchestratorConfig) -> Self {
        Self::with_clock(rpc, writer, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        rpc: Arc<dyn RpcClient>,
        writer: Arc<dyn BlockWriter>,
        config: OrchestratorConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rpc,
            writer,
            clock,
            config,
            state: Mutex::new(State::New),
            current_block: AtomicU64::new(0),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn state(&self) -> State {
        *self.state.lock().await
    }

    /// `New -> Initialized`: opens the RPC transport (implicitly, on
    /// construction), reads `headHeight()`/`highest()`, and sets
    /// `currentBlock = highest() ?? (startBlock - 1)`.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), IndexerError> {
        let mut state = self.state.lock().await;
        if *state != State::New {
            warn!(?state, "initialize() called outside New state, ignoring");
            return Ok(());
        }

        if !self.rpc.healthy().await {
            return Err(IndexerError::Config("rpc endpoint is not reachable".into()));
        }

        let highest = self.writer.highest().await?;
        let starting_cursor = highest.unwrap_or_else(|| self.config.start_block.saturating_sub(1));
        self.current_block.store(starting_cursor, Ordering::SeqCst);

        info!(current_block = starting_cursor, "orchestrator initialized");
        *state = State::Initialized;
        Ok(())
    }

    /// `Initialized -> Running`. A second call while already `Running` is a
    /// no-op warning, not an error.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), IndexerError> {
        {
            let mut state = self.state.lock().await;
            match *state {
                State::Running => {
                    warn!("start() called while already Running, ignoring");
                    return Ok(());
                }
                State::Initialized => *state = State::Running,
                other => {
                    return Err(IndexerError::Config(format!(
                        "start() requires Initialized state, found {other:?}"
                    )))
                }
            }
        }

        let head = self.rpc.head_height().await?;
        let current = self.current_block.load(Ordering::SeqCst);
        if head > current {
            self.backfill(current + 1, head).await?;
        }

        self.tail_loop().await;
        Ok(())
    }

    /// Sets the stop flag, awaits the in-flight chunk (checked cooperatively
    /// between chunks/polls), closes the RPC transport, and transitions to
    /// `Stopped`. A second call while shutting down is a no-op.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if *state == State::Stopping || *state == State::Stopped {
            warn!("stop() called while already stopping, ignoring");
            return;
        }
        *state = State::Stopping;
        self.stopping.store(true, Ordering::SeqCst);
        drop(state);

        self.rpc.close().await;
        *self.state.lock().await = State::Stopped;
        info!("orchestrator stopped");
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Unconditionally rewinds `currentBlock` to `forkHeight - 1` (spec §3,
    /// §4.3.4). Called before the completed-batch `fetch_max` so a batch
    /// that both reorgs and finishes still ends up advanced to its `to`;
    /// called alone on a failed batch so the cursor does not keep pointing
    /// past rows `delete_from` already removed.
    fn rewind_for_reorg(&self, reorg: &ReorgOutcome) {
        let rewound = reorg.fork_height.saturating_sub(1);
        self.current_block.store(rewound, Ordering::SeqCst);
        warn!(fork_height = reorg.fork_height, rewound, "current_block rewound for reorg");
    }

    /// Partitions `[from, to]` into batches, runs them in chunks of `P`
    /// concurrently, and advances `currentBlock` to the max of each
    /// chunk's completed batch ends (not the strict contiguous prefix —
    /// an explicit, documented design choice, see DESIGN.md).
    #[instrument(skip(self), fields(from, to))]
    pub async fn backfill(&self, from: u64, to: u64) -> Result<BackfillSummary, IndexerError> {
        if from > to {
            return Ok(BackfillSummary {
                completed: 0,
                failed: 0,
                failed_ranges: vec![],
            });
        }

        let ranges = partition_into_batches(from, to, self.config.batch_size);
        let chunks: Vec<_> = ranges.chunks(self.config.parallel_batches).map(|c| c.to_vec()).collect();

        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut failed_ranges = Vec::new();

        for (i, chunk) in chunks.iter().enumerate() {
            if self.is_stopping() {
                info!("stop requested, halting backfill between chunks");
                break;
            }

            let outcomes = run_chunk(
                chunk.clone(),
                self.rpc.clone(),
                self.writer.clone(),
                self.clock.clone(),
                self.config.rpc_retries,
                self.config.enable_reorg_check,
                self.config.parallel_batches,
            )
            .await;

            for outcome in &outcomes {
                match outcome {
                    BatchOutcome::Completed { to, reorg, .. } => {
                        completed += 1;
                        if let Some(reorg) = reorg {
                            self.rewind_for_reorg(reorg);
                        }
                        self.current_block.fetch_max(*to, Ordering::SeqCst);
                        metrics::BLOCKS_INDEXED_TOTAL.inc_by(
                            outcome_len(outcome),
                        );
                    }
                    BatchOutcome::Failed { error, reorg, .. } => {
                        failed += 1;
                        metrics::FAILED_BATCHES_TOTAL.inc();
                        // A reorg's delete_from is not rolled back by this
                        // batch's own save_batch failing, so the cursor must
                        // still rewind even though the batch is reported
                        // Failed — otherwise current_block keeps pointing at
                        // heights that were just deleted from the store.
                        if let Some(reorg) = reorg {
                            self.rewind_for_reorg(reorg);
                        }
                        warn!(range = outcome.range_label(), %error, "batch exhausted retries");
                        failed_ranges.push(outcome.range_label());
                    }
                }
            }

            let is_last = i + 1 == chunks.len();
            if self.config.block_delay_ms > 0 && !is_last {
                self.clock
                    .sleep(Duration::from_millis(self.config.block_delay_ms))
                    .await;
            }
        }

        info!(completed, failed, ?failed_ranges, "backfill summary");
        Ok(BackfillSummary {
            completed,
            failed,
            failed_ranges,
        })
    }

    /// Steady-state loop: poll the head, backfill any new heights, sleep.
    async fn tail_loop(&self) {
        loop {
            if self.is_stopping() {
                break;
            }

            match self.rpc.head_height().await {
                Ok(head) => {
                    let current = self.current_block.load(Ordering::SeqCst);
                    if head > current {
                        if let Err(e) = self.backfill(current + 1, head).await {
                            warn!(error = %e, "tail backfill failed");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "tail poll failed, will retry next interval"),
            }

            self.clock
                .sleep(Duration::from_millis(self.config.poll_interval_ms))
                .await;

            if self.is_stopping() {
                break;
            }
        }
    }

    /// `{chainHeight, indexed, behind, progressPct, firstBlock, lastBlock,
    /// totalTransactions}` (spec §4.3.7).
    pub async fn progress(&self) -> Result<ProgressReport, IndexerError> {
        let chain_height = self.rpc.head_height().await.unwrap_or(0);
        let stats = self.writer.stats().await?;
        Ok(ProgressReport::new(chain_height, &stats))
    }
}

fn outcome_len(outcome: &BatchOutcome) -> u64 {
    match outcome {
        BatchOutcome::Completed { from, to, .. } => to.saturating_sub(*from) + 1,
        BatchOutcome::Failed { .. } => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::test_support::{remote_block, FakeBlockWriter, FakeRpcClient};

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            start_block: 0,
            batch_size: 50,
            parallel_batches: 1,
            block_delay_ms: 0,
            enable_reorg_check: true,
            rpc_retries: 3,
            poll_interval_ms: 0,
        }
    }

    fn populate(rpc: &FakeRpcClient, from: u64, to: u64) {
        for n in from..=to {
            rpc.insert(remote_block(n, n.saturating_sub(1)));
        }
    }

    // S1: cold start, two batches, no reorg.
    #[tokio::test]
    async fn s1_cold_start_two_batches() {
        let rpc = Arc::new(FakeRpcClient::new().with_head(99));
        populate(&rpc, 0, 99);
        let writer = Arc::new(FakeBlockWriter::new());

        let orch = Orchestrator::new(rpc, writer.clone(), config());
        orch.initialize().await.unwrap();
        let summary = orch.backfill(0, 99).await.unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(writer.count().await.unwrap(), 100);
        assert_eq!(writer.highest().await.unwrap(), Some(99));
    }

    // S2: partial failure — one batch out of ten fails persistently.
    #[tokio::test]
    async fn s2_partial_failure() {
        let rpc = Arc::new(FakeRpcClient::new().with_head(99));
        populate(&rpc, 0, 99);
        for n in 20..=29 {
            rpc.fail_height_n_times(n, 100);
        }
        let writer = Arc::new(FakeBlockWriter::new());

        let mut cfg = config();
        cfg.batch_size = 10;
        cfg.parallel_batches = 5;
        cfg.rpc_retries = 3;

        let orch = Orchestrator::with_clock(rpc, writer.clone(), cfg, Arc::new(FakeClock::new()));
        orch.initialize().await.unwrap();
        let summary = orch.backfill(0, 99).await.unwrap();

        assert_eq!(summary.completed, 9);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_ranges, vec!["20-29".to_string()]);
        assert_eq!(writer.count().await.unwrap(), 90);
        assert_eq!(writer.highest().await.unwrap(), Some(99));
    }

    // S3: reorg at height 100 over a pre-populated range.
    #[tokio::test]
    async fn s3_reorg_during_batch() {
        let rpc = Arc::new(FakeRpcClient::new().with_head(110));
        let writer = Arc::new(FakeBlockWriter::new());

        for n in 100..=110 {
            writer
                .save_one(&crate::types::transform(&crate::test_support::remote_block_with_hash(n, n - 1, 0xAA)).unwrap())
                .await
                .unwrap();
        }
        for n in 100..=110 {
            rpc.insert(crate::test_support::remote_block_with_hash(n, n - 1, 0xBB));
        }

        let orch = Orchestrator::new(rpc, writer.clone(), config());
        orch.initialize().await.unwrap();
        let summary = orch.backfill(100, 110).await.unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(writer.count().await.unwrap(), 11);
        let row = writer.get(100).await.unwrap().unwrap();
        assert_eq!(row.hash, alloy::primitives::B256::repeat_byte(0xBB));
        assert_eq!(writer.highest().await.unwrap(), Some(110));
    }

    // S3b: the reorg's delete_from succeeds but the batch's own save_batch
    // afterward fails. current_block must rewind to fork_height - 1 rather
    // than staying at its pre-reorg value or advancing past deleted rows.
    #[tokio::test]
    async fn s3b_reorg_then_save_failure_rewinds_current_block() {
        use async_trait::async_trait;
        use crate::types::WriterStats;

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

        let rpc = Arc::new(FakeRpcClient::new().with_head(110));
        let inner = FakeBlockWriter::new();
        for n in 100..=110 {
            inner
                .save_one(&crate::types::transform(&crate::test_support::remote_block_with_hash(n, n - 1, 0xAA)).unwrap())
                .await
                .unwrap();
        }
        for n in 100..=110 {
            rpc.insert(crate::test_support::remote_block_with_hash(n, n - 1, 0xBB));
        }
        let writer = Arc::new(FailSaveWriter { inner });

        let mut cfg = config();
        cfg.rpc_retries = 0;
        let orch = Orchestrator::with_clock(rpc, writer, cfg, Arc::new(FakeClock::new()));
        orch.current_block.store(99, Ordering::SeqCst);
        *orch.state.lock().await = State::Initialized;
        let summary = orch.backfill(100, 110).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(orch.current_block.load(Ordering::SeqCst), 99);
    }

    // S4: idempotent re-run — store already caught up to head, so a
    // second backfill call over the now-empty range fetches nothing.
    #[tokio::test]
    async fn s4_idempotent_rerun_makes_no_fetches() {
        let rpc = Arc::new(FakeRpcClient::new().with_head(99));
        populate(&rpc, 0, 99);
        let writer = Arc::new(FakeBlockWriter::new());

        let orch = Orchestrator::new(rpc.clone(), writer.clone(), config());
        orch.initialize().await.unwrap();
        orch.backfill(0, 99).await.unwrap();

        let before = rpc.call_count(0);
        let head = rpc.head_height().await.unwrap();
        let current = writer.highest().await.unwrap().unwrap();
        assert_eq!(head, current);

        let summary = orch.backfill(current + 1, head).await.unwrap();
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(rpc.call_count(0), before);
        assert_eq!(writer.count().await.unwrap(), 100);
    }

    // S5: tail mode detects a single new block.
    #[tokio::test]
    async fn s5_tail_detects_new_block() {
        let rpc = Arc::new(FakeRpcClient::new().with_head(99));
        populate(&rpc, 0, 100);
        let writer = Arc::new(FakeBlockWriter::new());
        for n in 0..=99 {
            writer.save_one(&crate::test_support::sample_block(n)).await.unwrap();
        }

        let orch = Orchestrator::new(rpc.clone(), writer.clone(), config());
        orch.initialize().await.unwrap();

        rpc.set_head(100);
        let summary = orch.backfill(100, 100).await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(writer.highest().await.unwrap(), Some(100));
    }

    // S6 (simplified): the stop flag, once set, prevents any further
    // chunk from starting — checked here at the granularity of a single
    // backfill call rather than mid-run, since `run_chunk` itself is a
    // barrier over one chunk's batches.
    #[tokio::test]
    async fn s6_stop_flag_halts_before_next_chunk() {
        let rpc = Arc::new(FakeRpcClient::new().with_head(99));
        populate(&rpc, 0, 99);
        let writer = Arc::new(FakeBlockWriter::new());

        let mut cfg = config();
        cfg.batch_size = 10;
        cfg.parallel_batches = 5;

        let orch = Orchestrator::new(rpc, writer.clone(), cfg);
        orch.initialize().await.unwrap();
        orch.stop().await;

        let summary = orch.backfill(0, 99).await.unwrap();
        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(writer.count().await.unwrap(), 0);
        assert_eq!(orch.state().await, State::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let rpc = Arc::new(FakeRpcClient::new().with_head(0));
        let writer = Arc::new(FakeBlockWriter::new());
        let orch = Orchestrator::new(rpc, writer, config());
        orch.initialize().await.unwrap();

        orch.stop().await;
        orch.stop().await;
        assert_eq!(orch.state().await, State::Stopped);
    }

    // P6: retry backoff timing observed through the injected clock.
    #[tokio::test]
    async fn p6_retry_backoff_uses_injected_clock() {
        let rpc = Arc::new(FakeRpcClient::new().with_head(0));
        rpc.insert(remote_block(0, 0));
        rpc.fail_height_n_times(0, 3);

        let clock = Arc::new(FakeClock::new());
        let writer = Arc::new(FakeBlockWriter::new());
        let mut cfg = config();
        cfg.rpc_retries = 3;

        let orch = Orchestrator::with_clock(rpc, writer, cfg, clock.clone());
        orch.initialize().await.unwrap();
        orch.backfill(0, 0).await.unwrap();

        assert_eq!(
            clock.recorded(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
    }
}
