/// Metrics - Prometheus Instrumentation
///
/// The whole catalogue lives on one `Metrics` value constructed by the
/// supervisor and handed to components as an `Arc` recording capability.
/// Components never touch the registry; they call the helper methods.

use std::time::Instant;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// Standard latency buckets for histograms (seconds).
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

pub struct Metrics {
    registry: Registry,
    started_at: Instant,

    /// RPC calls by method.
    pub rpc_calls: IntCounterVec,
    /// RPC failures by method and error class.
    pub rpc_errors: IntCounterVec,
    /// RPC call latency by method.
    pub rpc_call_duration: HistogramVec,
    /// Retry attempts by error class.
    pub retries: IntCounterVec,

    /// Committed store transactions.
    pub db_writes: IntCounter,
    /// Store commit latency.
    pub db_write_duration: Histogram,
    /// Store failures by class (transient/permanent).
    pub db_errors: IntCounterVec,

    /// Blocks committed since process start.
    pub blocks_indexed: IntCounter,
    /// Transfers committed since process start.
    pub transfers_indexed: IntCounter,
    /// Reorganisations detected.
    pub reorgs_detected: IntCounter,
    /// Depth of the most recent reorg.
    pub reorg_depth: IntGauge,
    /// Batches that failed and were retried by the outer loop.
    pub batch_failures: IntCounter,

    /// Chain head as last observed.
    pub chain_tip: IntGauge,
    /// Highest committed local block.
    pub local_tip: IntGauge,
    /// chain_tip - local_tip.
    pub sync_lag: IntGauge,
    /// Consecutive failed batches (resets on success).
    pub consecutive_errors: IntGauge,

    /// Seconds since process start.
    pub uptime_seconds: IntGauge,
    /// HTTP requests by endpoint and status.
    pub http_requests: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let rpc_calls = IntCounterVec::new(
            Opts::new("chainsync_rpc_calls_total", "RPC calls by method"),
            &["method"],
        )?;
        let rpc_errors = IntCounterVec::new(
            Opts::new("chainsync_rpc_errors_total", "RPC failures by method and class"),
            &["method", "class"],
        )?;
        let rpc_call_duration = HistogramVec::new(
            HistogramOpts::new("chainsync_rpc_call_duration_seconds", "RPC call latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["method"],
        )?;
        let retries = IntCounterVec::new(
            Opts::new("chainsync_retries_total", "Retry attempts by error class"),
            &["class"],
        )?;

        let db_writes = IntCounter::new(
            "chainsync_db_writes_total",
            "Committed store transactions",
        )?;
        let db_write_duration = Histogram::with_opts(
            HistogramOpts::new("chainsync_db_write_duration_seconds", "Store commit latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
        )?;
        let db_errors = IntCounterVec::new(
            Opts::new("chainsync_db_errors_total", "Store failures by class"),
            &["class"],
        )?;

        let blocks_indexed = IntCounter::new(
            "chainsync_blocks_indexed_total",
            "Blocks committed since process start",
        )?;
        let transfers_indexed = IntCounter::new(
            "chainsync_transfers_indexed_total",
            "Transfers committed since process start",
        )?;
        let reorgs_detected = IntCounter::new(
            "chainsync_reorgs_detected_total",
            "Chain reorganisations detected",
        )?;
        let reorg_depth = IntGauge::new(
            "chainsync_reorg_depth_blocks",
            "Depth of the most recent reorg",
        )?;
        let batch_failures = IntCounter::new(
            "chainsync_batch_failures_total",
            "Batches that failed and were retried",
        )?;

        let chain_tip = IntGauge::new("chainsync_chain_tip_height", "Chain head as last observed")?;
        let local_tip = IntGauge::new("chainsync_local_tip_height", "Highest committed block")?;
        let sync_lag = IntGauge::new("chainsync_sync_lag_blocks", "Blocks behind the chain head")?;
        let consecutive_errors = IntGauge::new(
            "chainsync_consecutive_batch_errors",
            "Consecutive failed batches",
        )?;

        let uptime_seconds =
            IntGauge::new("chainsync_uptime_seconds", "Seconds since process start")?;
        let http_requests = IntCounterVec::new(
            Opts::new("chainsync_http_requests_total", "HTTP requests"),
            &["endpoint", "status"],
        )?;

        registry.register(Box::new(rpc_calls.clone()))?;
        registry.register(Box::new(rpc_errors.clone()))?;
        registry.register(Box::new(rpc_call_duration.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(db_writes.clone()))?;
        registry.register(Box::new(db_write_duration.clone()))?;
        registry.register(Box::new(db_errors.clone()))?;
        registry.register(Box::new(blocks_indexed.clone()))?;
        registry.register(Box::new(transfers_indexed.clone()))?;
        registry.register(Box::new(reorgs_detected.clone()))?;
        registry.register(Box::new(reorg_depth.clone()))?;
        registry.register(Box::new(batch_failures.clone()))?;
        registry.register(Box::new(chain_tip.clone()))?;
        registry.register(Box::new(local_tip.clone()))?;
        registry.register(Box::new(sync_lag.clone()))?;
        registry.register(Box::new(consecutive_errors.clone()))?;
        registry.register(Box::new(uptime_seconds.clone()))?;
        registry.register(Box::new(http_requests.clone()))?;

        // Process memory/CPU gauges for the /metrics surface.
        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            started_at: Instant::now(),
            rpc_calls,
            rpc_errors,
            rpc_call_duration,
            retries,
            db_writes,
            db_write_duration,
            db_errors,
            blocks_indexed,
            transfers_indexed,
            reorgs_detected,
            reorg_depth,
            batch_failures,
            chain_tip,
            local_tip,
            sync_lag,
            consecutive_errors,
            uptime_seconds,
            http_requests,
        })
    }

    /// Record one RPC call outcome with its latency.
    pub fn observe_rpc(&self, method: &str, elapsed_secs: f64, error_class: Option<&str>) {
        self.rpc_calls.with_label_values(&[method]).inc();
        self.rpc_call_duration
            .with_label_values(&[method])
            .observe(elapsed_secs);
        if let Some(class) = error_class {
            self.rpc_errors.with_label_values(&[method, class]).inc();
        }
    }

    /// Record tip positions and the derived lag.
    pub fn observe_tips(&self, chain_tip: u64, local_tip: u64) {
        self.chain_tip.set(chain_tip as i64);
        self.local_tip.set(local_tip as i64);
        self.sync_lag.set(chain_tip.saturating_sub(local_tip) as i64);
    }

    /// Render the registry in Prometheus text format.
    pub fn gather(&self) -> String {
        self.uptime_seconds
            .set(self.started_at.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once() {
        let metrics = Metrics::new().unwrap();
        metrics.blocks_indexed.inc_by(21);
        metrics.observe_tips(120, 100);
        metrics.observe_rpc("eth_getBlockByNumber", 0.02, None);
        metrics.observe_rpc("eth_getLogs", 1.2, Some("rpc"));

        let text = metrics.gather();
        assert!(text.contains("chainsync_blocks_indexed_total 21"));
        assert!(text.contains("chainsync_sync_lag_blocks 20"));
        assert!(text.contains("chainsync_rpc_errors_total"));
    }

    #[test]
    fn two_instances_do_not_collide() {
        // Registry is per-value, so parallel tests and multiple constructions
        // must not panic on duplicate registration.
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.reorgs_detected.inc();
        assert!(b.gather().contains("chainsync_reorgs_detected_total 0"));
    }
}
