/// Sync Engine Constants
///
/// Bounds and defaults shared across the sync pipeline. Height/depth logic
/// must use these constants instead of magic numbers.

/// Hard cap on a single fetch/commit batch, regardless of configuration.
pub const MAX_BATCH: u64 = 1000;

/// Default batch width when BATCH_SIZE is not configured.
pub const DEFAULT_BATCH_SIZE: u64 = 100;

/// Deepest rollback `delete_after` will perform without explicit escalation.
pub const MAX_REORG_DEPTH: u64 = 1000;

/// Iteration cap for the common-ancestor walk.
pub const MAX_WALK: u64 = 1000;

/// Capacity of the reorg detector's visited-hash set and parent cache.
pub const REORG_CACHE_CAP: usize = 100;

/// Consecutive failed batches tolerated before the engine goes fatal.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Default safety margin subtracted from the chain head.
pub const DEFAULT_CONFIRMATION_DEPTH: u64 = 12;

/// Default fetch parallelism within a batch.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default tail-loop sleep between polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

/// Default per-call RPC timeout.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;

/// Default retry attempts for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff.
pub const RETRY_BASE_DELAY_MS: u64 = 100;

/// Ceiling for exponential backoff.
pub const RETRY_MAX_DELAY_MS: u64 = 5_000;

/// Provider-quota failures (429/5xx) back off this much longer than plain
/// network faults. Stretches both the base and the ceiling.
pub const QUOTA_BACKOFF_FACTOR: u32 = 4;

/// Largest page the log fetcher will request from a provider in one call.
/// Providers commonly reject wide eth_getLogs ranges, so ranges are chunked.
pub const LOG_PAGE_BLOCKS: u64 = 100;

/// Quantities above this bound refuse to narrow to a native integer.
/// Heights, timestamps and reorg depths past 2^53 - 1 indicate corrupt input.
pub const MAX_SAFE_QUANTITY: u64 = (1 << 53) - 1;

/// keccak256("Transfer(address,address,uint256)"), topic0 of the only event
/// class this indexer decodes.
pub const TRANSFER_TOPIC0: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Advisory lock name guarding the single active writer.
pub const SYNC_LOCK_NAME: &str = "block-sync";

/// Name of the checkpoint recording the highest durably synced block.
pub const LATEST_CHECKPOINT: &str = "latest";

/// Processor name recorded in sync_status rows.
pub const PROCESSOR_NAME: &str = "block-sync";

/// Default TTL for the advisory lock.
pub const DEFAULT_LOCK_TTL_MS: u64 = 60_000;

/// Default bound on waiting for an in-flight batch during shutdown.
pub const DEFAULT_SHUTDOWN_DRAIN_MS: u64 = 10_000;

/// Blocks may claim a timestamp at most this far into the future (seconds).
pub const MAX_TIMESTAMP_DRIFT_SECS: u64 = 86_400;

#[inline]
pub fn is_genesis_height(height: u64) -> bool {
    height == 0
}

/// Check that a quantity is safe to treat as a native integer.
#[inline]
pub fn is_safe_quantity(value: u64) -> bool {
    value <= MAX_SAFE_QUANTITY
}
