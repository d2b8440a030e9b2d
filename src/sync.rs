/// Sync Engine - the fetch -> validate -> commit cycle
///
/// Follows the chain one batch at a time. The fetch phase fans out over the
/// chain client with bounded parallelism and no locks held; validation is
/// pure; the commit is a single store transaction that also carries any
/// reorg rollback, the checkpoint and the sync-status row. The local chain
/// stays a prefix of the canonical chain at every quiescent point.
///
/// States: Idle -> AcquireLock -> Catchup <-> Tail -> Shutdown. The
/// supervisor owns Idle/AcquireLock; this module owns the rest.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    LATEST_CHECKPOINT, LOG_PAGE_BLOCKS, MAX_BATCH, MAX_CONSECUTIVE_ERRORS, PROCESSOR_NAME,
    TRANSFER_TOPIC0,
};
use crate::decode::decode_transfer;
use crate::error::Error;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::reorg::{ReorgDetector, ReorgOutcome};
use crate::retry::{with_retries, RetryPolicy};
use crate::rpc::{pages, ChainClient, LogFilter, RawBlock};
use crate::store::{BlockStore, CommitOutcome, CommitRequest};
use crate::telemetry::short_hash;
use crate::types::{Checkpoint, SyncState, SyncStatus, Transfer};
use crate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    AcquireLock,
    Catchup,
    Tail,
    Shutdown,
}

/// Observable engine progress, published for health probes and the API.
/// Probes read this snapshot instead of issuing RPC calls of their own.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub chain_tip: u64,
    pub target_block: u64,
    pub local_tip: Option<u64>,
    pub last_sync_at: Option<chrono::DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self {
            state: EngineState::Idle,
            chain_tip: 0,
            target_block: 0,
            local_tip: None,
            last_sync_at: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

pub type SharedStatus = Arc<RwLock<EngineStatus>>;

#[derive(Debug, Clone)]
pub struct EngineParams {
    pub start_block: u64,
    pub batch_size: u64,
    pub concurrency: usize,
    pub confirmation_depth: u64,
    pub poll_interval: Duration,
    pub max_retries: u32,
    /// Some(address) enables Transfer-log ingestion for that contract.
    pub token_contract: Option<String>,
}

impl EngineParams {
    fn validate(&self) -> Result<(), Error> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH {
            return Err(Error::Config(format!(
                "batch_size must be in 1..={MAX_BATCH}, got {}",
                self.batch_size
            )));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be positive".into()));
        }
        Ok(())
    }
}

pub struct SyncEngine<C, S> {
    params: EngineParams,
    client: Arc<C>,
    store: Arc<S>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    policy: RetryPolicy,
    detector: ReorgDetector<C, S>,
    status: SharedStatus,
    shutdown: CancellationToken,
    chain_id: Option<u64>,
    consecutive_failures: u32,
}

impl<C: ChainClient + 'static, S: BlockStore + 'static> SyncEngine<C, S> {
    pub fn new(
        params: EngineParams,
        client: Arc<C>,
        store: Arc<S>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<Metrics>,
        status: SharedStatus,
        shutdown: CancellationToken,
    ) -> Result<Self, Error> {
        params.validate()?;
        let policy = RetryPolicy::new(params.max_retries);
        let detector = ReorgDetector::new(
            Arc::clone(&client),
            Arc::clone(&store),
            Arc::clone(&limiter),
            policy,
        );
        Ok(Self {
            params,
            client,
            store,
            limiter,
            metrics,
            policy,
            detector,
            status,
            shutdown,
            chain_id: None,
            consecutive_failures: 0,
        })
    }

    pub fn status_handle(&self) -> SharedStatus {
        Arc::clone(&self.status)
    }

    fn publish<F: FnOnce(&mut EngineStatus)>(&self, update: F) {
        if let Ok(mut status) = self.status.write() {
            update(&mut status);
        }
    }

    fn set_state(&self, state: EngineState) {
        self.publish(|s| s.state = state);
    }

    /// Drive the engine until shutdown or a fatal error. Ok(()) is the
    /// graceful path; any Err means the supervisor should exit non-zero.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.set_state(EngineState::Catchup);
        self.ensure_chain_id().await?;

        match self.repair_gaps().await {
            Ok(0) => {}
            Ok(repaired) => tracing::info!(blocks = repaired, "gap repair complete"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "gap repair incomplete, continuing"),
        }

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.step().await {
                Ok(progressed) => {
                    self.consecutive_failures = 0;
                    self.metrics.consecutive_errors.set(0);
                    self.publish(|s| {
                        s.consecutive_failures = 0;
                        s.last_error = None;
                    });
                    if !progressed {
                        self.sleep_poll().await;
                    }
                }
                Err(Error::Shutdown) => break,
                Err(e) if e.is_fatal() => {
                    self.fail_status(&e).await;
                    return Err(e);
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    self.metrics.batch_failures.inc();
                    self.metrics
                        .consecutive_errors
                        .set(self.consecutive_failures as i64);
                    let message = e.to_string();
                    self.publish(|s| {
                        s.consecutive_failures = self.consecutive_failures;
                        s.last_error = Some(message);
                    });
                    tracing::error!(
                        consecutive = self.consecutive_failures,
                        error = %e,
                        "batch failed"
                    );
                    if self.consecutive_failures > MAX_CONSECUTIVE_ERRORS {
                        self.fail_status(&e).await;
                        return Err(e);
                    }
                    self.sleep_poll().await;
                }
            }
        }

        self.set_state(EngineState::Shutdown);
        let local = self.store.max_height().await.ok().flatten();
        let status = SyncStatus {
            processor_name: PROCESSOR_NAME.to_string(),
            last_processed_block: local,
            last_processed_hash: None,
            target_block: None,
            synced_percent: 0.0,
            state: SyncState::Paused,
            error_message: None,
        };
        if let Err(e) = self.store.upsert_sync_status(&status).await {
            tracing::warn!(error = %e, "could not record paused status on shutdown");
        }
        Ok(())
    }

    /// One poll iteration: observe the head, sync the next batch if there is
    /// one. Returns whether any blocks were committed.
    pub async fn step(&mut self) -> Result<bool, Error> {
        let head = self.observed_head().await?;
        let target = head.saturating_sub(self.params.confirmation_depth);
        let local = self.store.max_height().await?;

        self.metrics.observe_tips(head, local.unwrap_or(0));
        self.publish(|s| {
            s.chain_tip = head;
            s.target_block = target;
            s.local_tip = local;
        });

        let next = match local {
            Some(tip) => tip + 1,
            None => self.params.start_block,
        };
        if next > target {
            self.set_state(EngineState::Tail);
            return Ok(false);
        }

        // Tail keeps up one batch at a time; a wider gap means catchup.
        let gap = target - next + 1;
        self.set_state(if gap > self.params.batch_size {
            EngineState::Catchup
        } else {
            EngineState::Tail
        });

        let hi = next
            .saturating_add(self.params.batch_size - 1)
            .min(target);
        self.process_range(next, hi, target).await?;
        Ok(true)
    }

    /// Sync until the target is reached, then return. Catchup as a callable
    /// unit; `run` wraps it with the tail loop and failure accounting.
    pub async fn catch_up(&mut self) -> Result<(), Error> {
        self.ensure_chain_id().await?;
        while self.step().await? {
            if self.shutdown.is_cancelled() {
                return Err(Error::Shutdown);
            }
        }
        Ok(())
    }

    /// Find committed ranges with holes and feed each one back through the
    /// batch contract, clipped to the current target tip.
    pub async fn repair_gaps(&mut self) -> Result<usize, Error> {
        self.ensure_chain_id().await?;
        let gaps = self.store.detect_gaps().await?;
        if gaps.is_empty() {
            return Ok(0);
        }

        let head = self.observed_head().await?;
        let target = head.saturating_sub(self.params.confirmation_depth);
        let mut repaired = 0usize;

        for gap in &gaps {
            let hi = gap.hi.min(target);
            if hi < gap.lo {
                continue;
            }
            tracing::warn!(lo = gap.lo, hi, "repairing gap");
            for (lo, hi) in pages(gap.lo, hi, self.params.batch_size) {
                let outcome = self.process_range(lo, hi, target).await?;
                repaired += outcome.blocks_saved as usize;
            }
        }
        Ok(repaired)
    }

    /// The batch contract for a contiguous range [lo, hi].
    pub async fn process_range(
        &mut self,
        lo: u64,
        hi: u64,
        target: u64,
    ) -> Result<CommitOutcome, Error> {
        if hi < lo {
            return Ok(CommitOutcome::default());
        }
        if hi - lo + 1 > MAX_BATCH {
            return Err(Error::Config(format!(
                "range {lo}..={hi} exceeds the hard batch cap {MAX_BATCH}"
            )));
        }
        let chain_id = self.ensure_chain_id().await?;

        // --- Fetch phase: bounded fan-out, fail-fast, no locks held ---
        let raws = self.fetch_blocks(lo, hi).await?;
        let mut transfers = match &self.params.token_contract {
            Some(token) => self.fetch_transfers(lo, hi, token).await?,
            None => Vec::new(),
        };

        // --- Validate phase: pure ---
        let now = now_secs();
        let mut blocks = validate::validate_blocks(&raws, chain_id, now)?;
        blocks.sort_by_key(|b| b.number);
        validate::check_linkage(&blocks)?;

        for transfer in &transfers {
            if transfer.block_number < lo || transfer.block_number > hi {
                return Err(Error::Validation(format!(
                    "provider returned a log for block {} outside {lo}..={hi}",
                    transfer.block_number
                )));
            }
        }
        validate::validate_transfers(&transfers)?;
        transfers.sort_by_key(|t| (t.block_number, t.log_index));

        let first = blocks
            .first()
            .cloned()
            .ok_or_else(|| Error::Validation(format!("empty block response for {lo}..={hi}")))?;

        // --- Continuity check with the local tip ---
        let shutdown = self.shutdown.clone();
        let rollback_to = match self.detector.check(&first, &shutdown).await? {
            ReorgOutcome::Accept | ReorgOutcome::InitialGap => None,
            ReorgOutcome::Rollback {
                common_ancestor,
                depth,
            } => {
                self.metrics.reorgs_detected.inc();
                self.metrics.reorg_depth.set(depth as i64);
                tracing::warn!(
                    ancestor = common_ancestor,
                    depth,
                    batch_lo = lo,
                    "reorg detected, rolling back"
                );

                if common_ancestor + 1 < lo {
                    // The stale suffix starts below this batch. Pull the
                    // replacement blocks down to the ancestor so the rollback
                    // and the full new suffix land in one transaction.
                    let extension = self.fetch_blocks(common_ancestor + 1, lo - 1).await?;
                    let mut extended = validate::validate_blocks(&extension, chain_id, now)?;
                    extended.sort_by_key(|b| b.number);
                    extended.extend(blocks);
                    blocks = extended;
                    validate::check_linkage(&blocks)?;
                }
                Some(common_ancestor)
            }
        };

        // A rollback commit must link onto the surviving prefix.
        if let Some(ancestor) = rollback_to {
            let first = &blocks[0];
            if first.number > 0 {
                let anchor = self.store.find_by_height(ancestor).await?.ok_or_else(|| {
                    Error::Corruption(format!("common ancestor {ancestor} vanished before commit"))
                })?;
                if anchor.hash != first.parent_hash {
                    return Err(Error::Rpc {
                        method: "eth_getBlockByNumber".into(),
                        message: format!(
                            "chain moved during reorg handling: block {} no longer links to {}",
                            first.number, ancestor
                        ),
                        retryable: true,
                    });
                }
            }
        }

        // --- Commit phase: one transaction ---
        let last = blocks.last().cloned().unwrap_or_else(|| first.clone());
        let checkpoint_tip = match rollback_to {
            // Rollback removed everything above the ancestor; the batch tip
            // is the new maximum by construction.
            Some(_) => last.clone(),
            None => {
                let pre_max = self.store.max_height().await?;
                match pre_max {
                    Some(max) if max > last.number => {
                        self.store.find_by_height(max).await?.ok_or_else(|| {
                            Error::Corruption(format!("max_height {max} has no block row"))
                        })?
                    }
                    _ => last.clone(),
                }
            }
        };

        let synced_percent = if target == 0 {
            100.0
        } else {
            (checkpoint_tip.number.min(target) as f64 / target as f64) * 100.0
        };
        let request = CommitRequest {
            rollback_to,
            blocks,
            transfers,
            checkpoint: Checkpoint {
                name: LATEST_CHECKPOINT.to_string(),
                block_number: checkpoint_tip.number,
                block_hash: checkpoint_tip.hash.clone(),
                synced_at: Utc::now(),
                metadata: Some(serde_json::json!({ "batch": [lo, hi] })),
            },
            status: SyncStatus {
                processor_name: PROCESSOR_NAME.to_string(),
                last_processed_block: Some(last.number),
                last_processed_hash: Some(last.hash.clone()),
                target_block: Some(target),
                synced_percent,
                state: SyncState::Active,
                error_message: None,
            },
        };

        if self.shutdown.is_cancelled() {
            // Fetched work is dropped, never half-committed.
            return Err(Error::Shutdown);
        }

        let started = Instant::now();
        let outcome = match self.store.commit_batch(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let (class, _) = e.classify();
                self.metrics.db_errors.with_label_values(&[class.as_str()]).inc();
                return Err(e);
            }
        };
        self.metrics.db_writes.inc();
        self.metrics
            .db_write_duration
            .observe(started.elapsed().as_secs_f64());

        // --- Post-commit verification ---
        let reread = self.store.find_by_hash(&last.hash).await?.ok_or_else(|| {
            Error::Corruption(format!(
                "post-commit verification: block {} ({}) not readable",
                last.number,
                short_hash(&last.hash)
            ))
        })?;
        if reread.number != last.number {
            return Err(Error::Corruption(format!(
                "post-commit verification: hash {} stored at height {}, expected {}",
                short_hash(&last.hash),
                reread.number,
                last.number
            )));
        }

        self.metrics.blocks_indexed.inc_by(outcome.blocks_saved);
        self.metrics.transfers_indexed.inc_by(outcome.transfers_saved);
        self.publish(|s| {
            s.local_tip = Some(checkpoint_tip.number);
            s.last_sync_at = Some(Utc::now());
        });
        tracing::info!(
            lo,
            hi,
            blocks = outcome.blocks_saved,
            transfers = outcome.transfers_saved,
            deleted = outcome.blocks_deleted,
            tip = last.number,
            hash = %short_hash(&last.hash),
            "batch committed"
        );

        Ok(outcome)
    }

    async fn ensure_chain_id(&mut self) -> Result<u64, Error> {
        if let Some(id) = self.chain_id {
            return Ok(id);
        }
        let client = Arc::clone(&self.client);
        let id = with_retries(&self.policy, &self.shutdown, || {
            let client = Arc::clone(&client);
            async move { client.chain_id().await }
        })
        .await?;
        self.chain_id = Some(id);
        Ok(id)
    }

    async fn observed_head(&self) -> Result<u64, Error> {
        self.limiter.consume(1.0, self.params.max_retries).await?;
        let client = Arc::clone(&self.client);
        let started = Instant::now();
        let result = with_retries(&self.policy, &self.shutdown, || {
            let client = Arc::clone(&client);
            async move { client.head_height().await }
        })
        .await;
        self.metrics.observe_rpc(
            "eth_blockNumber",
            started.elapsed().as_secs_f64(),
            result.as_ref().err().map(|e| e.classify().0.as_str()),
        );
        result
    }

    /// Fetch every block in [lo, hi] with concurrency K. Each call is
    /// bracketed by the rate limiter and the retry loop; the first failure
    /// cancels the rest of the fan-out.
    async fn fetch_blocks(&self, lo: u64, hi: u64) -> Result<Vec<RawBlock>, Error> {
        let fetches = stream::iter(lo..=hi).map(|number| {
            let client = Arc::clone(&self.client);
            let limiter = Arc::clone(&self.limiter);
            let metrics = Arc::clone(&self.metrics);
            let shutdown = self.shutdown.clone();
            let policy = self.policy;
            let max_retries = self.params.max_retries;
            async move {
                limiter.consume(1.0, max_retries).await?;
                let started = Instant::now();
                let result = with_retries(&policy, &shutdown, || {
                    let client = Arc::clone(&client);
                    async move { client.block_by_number(number).await }
                })
                .await;
                metrics.observe_rpc(
                    "eth_getBlockByNumber",
                    started.elapsed().as_secs_f64(),
                    result.as_ref().err().map(|e| e.classify().0.as_str()),
                );
                result
            }
        });

        fetches
            .buffer_unordered(self.params.concurrency)
            .try_collect()
            .await
    }

    /// Fetch and decode Transfer logs for [lo, hi], one provider page at a
    /// time so log-count limits cannot reject the query.
    async fn fetch_transfers(
        &self,
        lo: u64,
        hi: u64,
        token: &str,
    ) -> Result<Vec<Transfer>, Error> {
        let filter = LogFilter {
            address: Some(token.to_string()),
            topic0: Some(TRANSFER_TOPIC0.to_string()),
        };

        let mut raw_logs = Vec::new();
        for (page_lo, page_hi) in pages(lo, hi, LOG_PAGE_BLOCKS) {
            self.limiter.consume(1.0, self.params.max_retries).await?;
            let client = Arc::clone(&self.client);
            let filter = filter.clone();
            let started = Instant::now();
            let result = with_retries(&self.policy, &self.shutdown, || {
                let client = Arc::clone(&client);
                let filter = filter.clone();
                async move { client.logs_in_range(page_lo, page_hi, &filter).await }
            })
            .await;
            self.metrics.observe_rpc(
                "eth_getLogs",
                started.elapsed().as_secs_f64(),
                result.as_ref().err().map(|e| e.classify().0.as_str()),
            );
            raw_logs.extend(result?);
        }

        raw_logs.iter().map(decode_transfer).collect()
    }

    async fn fail_status(&self, error: &Error) {
        self.publish(|s| s.last_error = Some(error.to_string()));
        let local = self.store.max_height().await.ok().flatten();
        let status = SyncStatus {
            processor_name: PROCESSOR_NAME.to_string(),
            last_processed_block: local,
            last_processed_hash: None,
            target_block: None,
            synced_percent: 0.0,
            state: SyncState::Error,
            error_message: Some(error.to_string()),
        };
        if let Err(e) = self.store.upsert_sync_status(&status).await {
            tracing::warn!(error = %e, "could not record error status");
        }
    }

    async fn sleep_poll(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.params.poll_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_hash, MemStore, ScriptedChain};

    fn params(batch_size: u64, confirmation_depth: u64) -> EngineParams {
        EngineParams {
            start_block: 0,
            batch_size,
            concurrency: 4,
            confirmation_depth,
            poll_interval: Duration::from_millis(1),
            max_retries: 3,
            token_contract: None,
        }
    }

    fn engine(
        chain: &Arc<ScriptedChain>,
        store: &Arc<MemStore>,
        params: EngineParams,
    ) -> SyncEngine<ScriptedChain, MemStore> {
        let limiter = Arc::new(RateLimiter::new(100_000.0, 1000, 100_000.0).unwrap());
        let metrics = Arc::new(Metrics::new().unwrap());
        let status = Arc::new(RwLock::new(EngineStatus::default()));
        let mut engine = SyncEngine::new(
            params,
            Arc::clone(chain),
            Arc::clone(store),
            limiter,
            metrics,
            status,
            CancellationToken::new(),
        )
        .unwrap();
        // Unit tests use tiny backoffs to keep retries fast.
        engine.policy = RetryPolicy {
            max_attempts: engine.params.max_retries,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
        };
        engine
    }

    #[test]
    fn oversized_batch_rejected_at_construction() {
        let chain = Arc::new(ScriptedChain::linear(5));
        let store = Arc::new(MemStore::new());
        let limiter = Arc::new(RateLimiter::new(10.0, 1000, 10.0).unwrap());
        let metrics = Arc::new(Metrics::new().unwrap());
        let status = Arc::new(RwLock::new(EngineStatus::default()));
        let result = SyncEngine::new(
            params(MAX_BATCH + 1, 0),
            chain,
            store,
            limiter,
            metrics,
            status,
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn initial_sync_reaches_tail() {
        // S1: empty store, chain 0..=20, depth 0, batch 10.
        let chain = Arc::new(ScriptedChain::linear(20));
        let store = Arc::new(MemStore::new());
        let mut engine = engine(&chain, &store, params(10, 0));

        engine.catch_up().await.unwrap();

        assert_eq!(store.max_height().await.unwrap(), Some(20));
        assert_eq!(store.block_count().await, 21);
        let checkpoint = store
            .get_checkpoint(LATEST_CHECKPOINT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.block_number, 20);
        assert_eq!(checkpoint.block_hash, test_hash(20, 0));
        assert_eq!(
            engine.status_handle().read().unwrap().state,
            EngineState::Tail
        );

        // Linkage invariant holds at the quiescent point.
        store.assert_linked().await;
    }

    #[tokio::test]
    async fn confirmation_depth_bounds_the_target() {
        let chain = Arc::new(ScriptedChain::linear(20));
        let store = Arc::new(MemStore::new());
        let mut engine = engine(&chain, &store, params(10, 12));

        engine.catch_up().await.unwrap();
        assert_eq!(store.max_height().await.unwrap(), Some(8));
    }

    #[tokio::test]
    async fn reorg_batch_replaces_stale_suffix() {
        // S2: store holds canonical 0..=10, chain re-mined 6..=10.
        let chain = Arc::new(ScriptedChain::linear(10));
        let store = Arc::new(MemStore::new());
        store.seed_canonical(0..=10).await;
        chain.rewind(6, 1).await;

        let mut engine = engine(&chain, &store, params(10, 0));
        engine.process_range(6, 10, 10).await.unwrap();

        assert_eq!(store.max_height().await.unwrap(), Some(10));
        for number in 6..=10u64 {
            let block = store.find_by_height(number).await.unwrap().unwrap();
            assert_eq!(block.hash, test_hash(number, 1), "height {number}");
        }
        for number in 0..=5u64 {
            let block = store.find_by_height(number).await.unwrap().unwrap();
            assert_eq!(block.hash, test_hash(number, 0), "height {number}");
        }
        assert_eq!(store.orphan_transfer_count().await, 0);
        store.assert_linked().await;
    }

    #[tokio::test]
    async fn deep_reorg_below_batch_window_rolls_back_in_one_commit() {
        // Store holds 0..=10; the chain re-mined everything from 4. The tail
        // batch starts at 11, far above the fork point.
        let chain = Arc::new(ScriptedChain::linear(15));
        let store = Arc::new(MemStore::new());
        store.seed_canonical(0..=10).await;
        chain.rewind(4, 3).await;

        let mut engine = engine(&chain, &store, params(10, 0));
        engine.catch_up().await.unwrap();

        assert_eq!(store.max_height().await.unwrap(), Some(15));
        for number in 4..=15u64 {
            let block = store.find_by_height(number).await.unwrap().unwrap();
            assert_eq!(block.hash, test_hash(number, 3), "height {number}");
        }
        store.assert_linked().await;
        let checkpoint = store
            .get_checkpoint(LATEST_CHECKPOINT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.block_number, 15);
    }

    #[tokio::test]
    async fn gap_repair_restores_contiguity() {
        // S3: blocks 4..=6 missing from an otherwise contiguous 0..=20.
        let chain = Arc::new(ScriptedChain::linear(20));
        let store = Arc::new(MemStore::new());
        store.seed_canonical(0..=3).await;
        store.seed_canonical(7..=20).await;

        let mut engine = engine(&chain, &store, params(10, 0));
        let repaired = engine.repair_gaps().await.unwrap();

        assert_eq!(repaired, 3);
        assert_eq!(store.block_count().await, 21);
        store.assert_linked().await;

        // Checkpoint still reflects the true maximum, not the gap tail.
        let checkpoint = store
            .get_checkpoint(LATEST_CHECKPOINT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.block_number, 20);
    }

    #[tokio::test]
    async fn transfers_are_decoded_and_unique() {
        // S4: three Transfer logs in block 50 with log indexes 0, 1, 2.
        let chain = Arc::new(ScriptedChain::linear(50));
        let token = format!("0x{}", "ab".repeat(20));
        chain
            .add_transfer(50, 0, &token, 7, "1000000000000000000")
            .await;
        chain.add_transfer(50, 1, &token, 7, "1").await;
        chain
            .add_transfer(
                50,
                2,
                &token,
                7,
                "115792089237316195423570985008687907853269984665640564039457584007913129639935",
            )
            .await;

        let store = Arc::new(MemStore::new());
        let mut p = params(100, 0);
        p.token_contract = Some(token.clone());
        let mut engine = engine(&chain, &store, p);

        engine.catch_up().await.unwrap();

        let transfers = store.transfers_at(50).await;
        assert_eq!(transfers.len(), 3);
        assert_eq!(transfers[0].amount, "1000000000000000000");
        assert_eq!(transfers[1].amount, "1");
        assert_eq!(transfers[2].amount.len(), 78);
        assert!(transfers.iter().all(|t| t.token_address == token));
        let mut keys: Vec<_> = transfers
            .iter()
            .map(|t| (t.block_number, t.log_index))
            .collect();
        keys.dedup();
        assert_eq!(keys.len(), 3);
        keys.sort();
        assert_eq!(keys, vec![(50, 0), (50, 1), (50, 2)]);
    }

    #[tokio::test]
    async fn replayed_batch_is_a_no_op() {
        let chain = Arc::new(ScriptedChain::linear(10));
        let store = Arc::new(MemStore::new());
        let mut engine = engine(&chain, &store, params(20, 0));

        let first = engine.process_range(0, 10, 10).await.unwrap();
        assert_eq!(first.blocks_saved, 11);
        let snapshot = store.snapshot().await;

        let replay = engine.process_range(0, 10, 10).await.unwrap();
        assert_eq!(replay.blocks_saved, 0);
        assert_eq!(store.snapshot().await, snapshot);
    }

    #[tokio::test]
    async fn transient_429s_are_retried_then_succeed() {
        // S6: three 429s, success on the fourth call; exactly one row lands.
        let chain = Arc::new(ScriptedChain::linear(5));
        chain.fail_next_block_fetches(3).await;
        let store = Arc::new(MemStore::new());
        let mut engine = engine(&chain, &store, params(1, 0));

        engine.process_range(0, 0, 5).await.unwrap();

        assert_eq!(store.block_count().await, 1);
        assert_eq!(chain.rejected_block_calls().await, 3);
        // Three failures plus the success.
        assert_eq!(chain.block_calls().await, 4);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_batch() {
        let chain = Arc::new(ScriptedChain::linear(5));
        chain.fail_next_block_fetches(100).await;
        let store = Arc::new(MemStore::new());
        let mut engine = engine(&chain, &store, params(1, 0));

        let err = engine.process_range(0, 0, 5).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { .. }));
        assert_eq!(store.block_count().await, 0);
    }

    #[tokio::test]
    async fn consecutive_failures_escalate_to_fatal() {
        let chain = Arc::new(ScriptedChain::linear(5));
        chain.fail_head_always().await;
        let store = Arc::new(MemStore::new());
        let mut engine = engine(&chain, &store, params(1, 0));

        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { .. }));
        assert!(engine.consecutive_failures > MAX_CONSECUTIVE_ERRORS);
    }

    #[tokio::test]
    async fn empty_range_is_a_no_op() {
        let chain = Arc::new(ScriptedChain::linear(5));
        let store = Arc::new(MemStore::new());
        let mut engine = engine(&chain, &store, params(10, 0));
        let outcome = engine.process_range(5, 4, 5).await.unwrap();
        assert_eq!(outcome, CommitOutcome::default());
        assert_eq!(store.block_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_interrupts_catch_up() {
        let chain = Arc::new(ScriptedChain::linear(20));
        let store = Arc::new(MemStore::new());
        let mut engine = engine(&chain, &store, params(10, 0));
        engine.shutdown.cancel();

        let err = engine.catch_up().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
