use async_trait::async_trait;
use deadpool_postgres::Pool;
use tracing::{debug, instrument};

use crate::error::IndexerError;
use crate::metrics::{self, Timer};
use crate::types::{Block, WriterStats};

/// Owns the translation from remote block shape to persistent row shape and
/// the exact SQL contract against the `blocks` table.
///
/// An object-safe async trait so scenarios can run against an in-memory
/// fake instead of a live database.
#[async_trait]
pub trait BlockWriter: Send + Sync {
    /// Inserts one row with `ON CONFLICT (hash) DO NOTHING`. Returns
    /// whether a new row was inserted.
    async fn save_one(&self, block: &Block) -> Result<bool, IndexerError>;

    /// Opens a transaction, inserts every block with the same conflict
    /// clause, and commits atomically. Returns the count of newly inserted
    /// rows; a conflict-skip is not a failure. Rolls back and surfaces the
    /// error on any failure.
    async fn save_batch(&self, blocks: &[Block]) -> Result<u64, IndexerError>;

    /// Existence check by number.
    async fn exists(&self, number: u64) -> Result<bool, IndexerError>;

    /// Single row lookup by number.
    async fn get(&self, number: u64) -> Result<Option<Block>, IndexerError>;

    /// Maximum stored number, if any row exists.
    async fn highest(&self) -> Result<Option<u64>, IndexerError>;

    /// Total row count.
    async fn count(&self) -> Result<u64, IndexerError>;

    /// Deletes every row with `number >= n`. Used only by reorg repair.
    /// Returns the delete count.
    async fn delete_from(&self, n: u64) -> Result<u64, IndexerError>;

    /// Aggregate counters for progress reporting.
    async fn stats(&self) -> Result<WriterStats, IndexerError>;
}

/// `BlockWriter` implementation backed by a pooled Postgres connection.
pub struct PostgresBlockWriter {
    pool: Pool,
}

impl PostgresBlockWriter {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn save_batch_inner(&self, blocks: &[Block]) -> Result<u64, IndexerError> {
        let mut client = self.pool.get().await?;
        let txn = client.transaction().await?;
        let mut inserted = 0u64;

        let stmt = txn
            .prepare(
                "INSERT INTO blocks (
                    hash, number, parent_hash, miner, timestamp, gas_limit, gas_used,
                    base_fee_per_gas, transactions_root, state_root, receipts_root,
                    difficulty, nonce, extra_data, size, transaction_count,
                    created_at, updated_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,now(),now())
                ON CONFLICT (hash) DO NOTHING",
            )
            .await?;

        for block in blocks {
            let rows = txn
                .execute(
                    &stmt,
                    &[
                        &block.hash.as_slice(),
                        &(block.number as i64),
                        &block.parent_hash.as_slice(),
                        &block.miner.as_slice(),
                        &block.timestamp,
                        &block.gas_limit,
                        &block.gas_used,
                        &block.base_fee_per_gas,
                        &block.transactions_root.as_slice(),
                        &block.state_root.as_slice(),
                        &block.receipts_root.as_slice(),
                        &block.difficulty,
                        &block.nonce.as_ref(),
                        &block.extra_data.as_ref().map(|b| b.as_ref()),
                        &(block.size as i32),
                        &block.transaction_count,
                    ],
                )
                .await?;
            inserted += rows;
        }

        txn.commit().await?;
        debug!(inserted, "batch committed");
        Ok(inserted)
    }
}

#[async_trait]
impl BlockWriter for PostgresBlockWriter {
    #[instrument(skip(self, block), fields(number = block.number))]
    async fn save_one(&self, block: &Block) -> Result<bool, IndexerError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| { metrics::increment_db_errors("save_one"); e })?;
        let rows = client
            .execute(
                "INSERT INTO blocks (
                    hash, number, parent_hash, miner, timestamp, gas_limit, gas_used,
                    base_fee_per_gas, transactions_root, state_root, receipts_root,
                    difficulty, nonce, extra_data, size, transaction_count,
                    created_at, updated_at
                ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,now(),now())
                ON CONFLICT (hash) DO NOTHING",
                &[
                    &block.hash.as_slice(),
                    &(block.number as i64),
                    &block.parent_hash.as_slice(),
                    &block.miner.as_slice(),
                    &block.timestamp,
                    &block.gas_limit,
                    &block.gas_used,
                    &block.base_fee_per_gas,
                    &block.transactions_root.as_slice(),
                    &block.state_root.as_slice(),
                    &block.receipts_root.as_slice(),
                    &block.difficulty,
                    &block.nonce.as_ref(),
                    &block.extra_data.as_ref().map(|b| b.as_ref()),
                    &(block.size as i32),
                    &block.transaction_count,
                ],
            )
            .await
            .map_err(|e| { metrics::increment_db_errors("save_one"); e })?;
        Ok(rows == 1)
    }

    #[instrument(skip(self, blocks), fields(count = blocks.len()))]
    async fn save_batch(&self, blocks: &[Block]) -> Result<u64, IndexerError> {
        let timer = Timer::new();
        let result = self.save_batch_inner(blocks).await;
        match &result {
            Ok(_) => metrics::DB_BATCH_FLUSH_DURATION.observe(timer.elapsed_secs()),
            Err(_) => metrics::increment_db_errors("save_batch"),
        }
        result
    }

    async fn exists(&self, number: u64) -> Result<bool, IndexerError> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| { metrics::increment_db_errors("exists"); e })?;
        let row = client
            .query_opt(
                "SELECT 1 FROM blocks WHERE number = $1",
                &[&(number as i64)],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn get(&self, number: u64) -> Result<Option<Block>, IndexerError> {
        let client = self.pool.get().await.map_err(|e| { metrics::increment_db_errors("get"); e })?;
        let row = client
            .query_opt(
                "SELECT hash, number, parent_hash, miner, timestamp, gas_limit, gas_used,
                        base_fee_per_gas, transactions_root, state_root, receipts_root,
                        difficulty, nonce, extra_data, size, transaction_count
                 FROM blocks WHERE number = $1",
                &[&(number as i64)],
            )
            .await
            .map_err(|e| { metrics::increment_db_errors("get"); e })?;

        Ok(row.map(|row| row_to_block(&row)))
    }

    async fn highest(&self) -> Result<Option<u64>, IndexerError> {
        let client = self.pool.get().await.map_err(|e| { metrics::increment_db_errors("highest"); e })?;
        let row = client
            .query_opt("SELECT max(number) FROM blocks", &[])
            .await
            .map_err(|e| { metrics::increment_db_errors("highest"); e })?;
        Ok(row.and_then(|r| r.get::<_, Option<i64>>(0)).map(|n| n as u64))
    }

    async fn count(&self) -> Result<u64, IndexerError> {
        let client = self.pool.get().await.map_err(|e| { metrics::increment_db_errors("count"); e })?;
        let row = client
            .query_one("SELECT count(*) FROM blocks", &[])
            .await
            .map_err(|e| { metrics::increment_db_errors("count"); e })?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    #[instrument(skip(self))]
    async fn delete_from(&self, n: u64) -> Result<u64, IndexerError> {
        let client = self.pool.get().await.map_err(|e| { metrics::increment_db_errors("delete_from"); e })?;
        let rows = client
            .execute("DELETE FROM blocks WHERE number >= $1", &[&(n as i64)])
            .await
            .map_err(|e| { metrics::increment_db_errors("delete_from"); e })?;
        debug!(from = n, deleted = rows, "reorg delete");
        Ok(rows)
    }

    async fn stats(&self) -> Result<WriterStats, IndexerError> {
        let client = self.pool.get().await.map_err(|e| { metrics::increment_db_errors("stats"); e })?;
        let row = client
            .query_one(
                "SELECT count(*), min(number), max(number),
                        coalesce(sum(transaction_count), 0),
                        coalesce(sum(gas_used), 0::numeric)
                 FROM blocks",
                &[],
            )
            .await
            .map_err(|e| { metrics::increment_db_errors("stats"); e })?;

        let total_blocks: i64 = row.get(0);
        let first_block: Option<i64> = row.get(1);
        let last_block: Option<i64> = row.get(2);
        let total_transactions: i64 = row.get(3);
        let total_gas_used: alloy::primitives::U256 = row.get(4);

        let avg_tx_per_block = if total_blocks > 0 {
            total_transactions as f64 / total_blocks as f64
        } else {
            0.0
        };
        let avg_gas_per_block = if total_blocks > 0 {
            gas_used_to_f64(total_gas_used) / total_blocks as f64
        } else {
            0.0
        };

        Ok(WriterStats {
            total_blocks: total_blocks as u64,
            first_block: first_block.map(|n| n as u64),
            last_block: last_block.map(|n| n as u64),
            total_transactions: total_transactions as u64,
            avg_tx_per_block,
            total_gas_used,
            avg_gas_per_block,
        })
    }
}

fn gas_used_to_f64(value: alloy::primitives::U256) -> f64 {
    value.to_string().parse().unwrap_or(0.0)
}

fn row_to_block(row: &tokio_postgres::Row) -> Block {
    use alloy::primitives::{Address, Bytes, B256};

    Block {
        hash: B256::from_slice(row.get::<_, &[u8]>(0)),
        number: row.get::<_, i64>(1) as u64,
        parent_hash: B256::from_slice(row.get::<_, &[u8]>(2)),
        miner: Address::from_slice(row.get::<_, &[u8]>(3)),
        timestamp: row.get(4),
        gas_limit: row.get(5),
        gas_used: row.get(6),
        base_fee_per_gas: row.get(7),
        transactions_root: B256::from_slice(row.get::<_, &[u8]>(8)),
        state_root: B256::from_slice(row.get::<_, &[u8]>(9)),
        receipts_root: B256::from_slice(row.get::<_, &[u8]>(10)),
        difficulty: row.get(11),
        nonce: Bytes::from(row.get::<_, &[u8]>(12).to_vec()),
        extra_data: row
            .get::<_, Option<&[u8]>>(13)
            .map(|b| Bytes::from(b.to_vec())),
        size: row.get::<_, i32>(14) as u32,
        transaction_count: row.get(15),
    }
}
