use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Pipeline progress & throughput
    pub static ref BLOCKS_INDEXED_TOTAL: IntCounter = IntCounter::new(
        "pulse_indexer_blocks_indexed_total",
        "Total blocks committed to the store"
    ).unwrap();
    pub static ref CHAIN_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("pulse_indexer_chain_height", "Current chain height by source"),
        &["source"]
    ).unwrap();
    pub static ref INDEXED_HEIGHT: IntGauge = IntGauge::new(
        "pulse_indexer_indexed_height", "Highest stored block number"
    ).unwrap();
    pub static ref SYNC_PROGRESS_PERCENT: prometheus::Gauge = prometheus::Gauge::new(
        "pulse_indexer_sync_progress_percent", "lastBlock / chainHeight * 100"
    ).unwrap();
    pub static ref BLOCKS_BEHIND_TIP: IntGauge = IntGauge::new(
        "pulse_indexer_blocks_behind_tip", "chainHeight - lastBlock"
    ).unwrap();

    // Latency histograms
    pub static ref RPC_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("pulse_indexer_rpc_call_duration_seconds", "RPC call latency by method"),
        &["method"]
    ).unwrap();
    pub static ref DB_BATCH_FLUSH_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("pulse_indexer_db_batch_flush_duration_seconds", "saveBatch transaction latency")
    ).unwrap();

    // Error & retry counters
    pub static ref RPC_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("pulse_indexer_rpc_errors_total", "RPC errors by method and kind"),
        &["method", "kind"]
    ).unwrap();
    pub static ref DB_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("pulse_indexer_db_errors_total", "Database errors by operation"),
        &["op"]
    ).unwrap();
    pub static ref REORG_EVENTS_TOTAL: IntCounter = IntCounter::new(
        "pulse_indexer_reorg_events_total", "Reorganizations detected and repaired"
    ).unwrap();
    pub static ref REORG_DEPTH_BLOCKS: IntGauge = IntGauge::new(
        "pulse_indexer_reorg_depth_blocks", "Rows deleted by the most recent reorg repair"
    ).unwrap();
    pub static ref FAILED_BATCHES_TOTAL: IntCounter = IntCounter::new(
        "pulse_indexer_failed_batches_total", "Batches that exhausted their retry budget"
    ).unwrap();

    // Concurrency
    pub static ref BATCHES_IN_FLIGHT: IntGauge = IntGauge::new(
        "pulse_indexer_batches_in_flight", "Batches currently executing within a chunk"
    ).unwrap();

    // Operational
    pub static ref UPTIME_SECONDS: IntGauge = IntGauge::new(
        "pulse_indexer_uptime_seconds", "Seconds since process start"
    ).unwrap();
    pub static ref SERVICE_START_TIMESTAMP: IntGauge = IntGauge::new(
        "pulse_indexer_service_start_timestamp", "Unix timestamp the process started"
    ).unwrap();
    pub static ref LAST_BLOCK_TIMESTAMP: IntGauge = IntGauge::new(
        "pulse_indexer_last_block_timestamp", "Unix timestamp of the most recently indexed block"
    ).unwrap();
}

/// Registers every metric with the global registry. Call once at startup.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    REGISTRY.register(Box::new(BLOCKS_INDEXED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CHAIN_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(INDEXED_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(SYNC_PROGRESS_PERCENT.clone()))?;
    REGISTRY.register(Box::new(BLOCKS_BEHIND_TIP.clone()))?;

    REGISTRY.register(Box::new(RPC_CALL_DURATION.clone()))?;
    REGISTRY.register(Box::new(DB_BATCH_FLUSH_DURATION.clone()))?;

    REGISTRY.register(Box::new(RPC_ERRORS.clone()))?;
    REGISTRY.register(Box::new(DB_ERRORS.clone()))?;
    REGISTRY.register(Box::new(REORG_EVENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REORG_DEPTH_BLOCKS.clone()))?;
    REGISTRY.register(Box::new(FAILED_BATCHES_TOTAL.clone()))?;

    REGISTRY.register(Box::new(BATCHES_IN_FLIGHT.clone()))?;

    REGISTRY.register(Box::new(UPTIME_SECONDS.clone()))?;
    REGISTRY.register(Box::new(SERVICE_START_TIMESTAMP.clone()))?;
    REGISTRY.register(Box::new(LAST_BLOCK_TIMESTAMP.clone()))?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs();
    SERVICE_START_TIMESTAMP.set(now as i64);

    Ok(())
}

/// Renders the registry in Prometheus text exposition format. Nothing
/// serves this over HTTP here; a sidecar scrape or future exporter reads
/// it through the same registry.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

pub fn record_rpc_call_duration(method: &str, duration_secs: f64) {
    RPC_CALL_DURATION.with_label_values(&[method]).observe(duration_secs);
}

pub fn increment_rpc_errors(method: &str, kind: &str) {
    RPC_ERRORS.with_label_values(&[method, kind]).inc();
}

pub fn increment_db_errors(op: &str) {
    DB_ERRORS.with_label_values(&[op]).inc();
}

pub fn record_reorg(rows_deleted: u64) {
    REORG_EVENTS_TOTAL.inc();
    REORG_DEPTH_BLOCKS.set(rows_deleted as i64);
}

pub fn update_uptime() {
    let start = SERVICE_START_TIMESTAMP.get();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    UPTIME_SECONDS.set((now as i64) - start);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics() {
        let _ = init_metrics();
        BLOCKS_INDEXED_TOTAL.inc_by(5);
        CHAIN_HEIGHT.with_label_values(&["rpc"]).set(1000);

        let output = gather_metrics();
        assert!(output.contains("pulse_indexer_blocks_indexed_total"));
        assert!(output.contains("pulse_indexer_chain_height"));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_secs() >= 0.005);
    }
}
