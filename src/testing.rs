/// Test Support - In-Memory Store and Scripted Chain
///
/// Deterministic doubles for the two external worlds the engine touches.
/// `MemStore` implements the full `BlockStore` contract (same-hash no-op,
/// different-hash failure, cascade on delete, gap detection, TTL locks) so
/// engine scenarios run without a database. `ScriptedChain` serves a
/// re-minable canonical chain and injectable provider failures.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use num_bigint::BigUint;
use num_traits::Num;
use tokio::sync::Mutex;

use crate::constants::{MAX_REORG_DEPTH, TRANSFER_TOPIC0};
use crate::error::Error;
use crate::rpc::{ChainClient, LogFilter, RawBlock, RawLog};
use crate::store::{BlockStore, CommitOutcome, CommitRequest};
use crate::types::{Block, Checkpoint, Gap, SyncStatus, Transfer};

/// Deterministic 32-byte hash for (height, fork-salt).
pub fn test_hash(height: u64, salt: u64) -> String {
    format!("0x{:064x}", height as u128 * 1_000_003 + salt as u128 * 7 + 11)
}

pub fn zero_hash() -> String {
    format!("0x{:064x}", 0u8)
}

fn test_address(salt: u64) -> String {
    format!("0x{:040x}", salt as u128 + 0x1111)
}

fn test_block(height: u64, salt: u64, parent_hash: String) -> Block {
    Block {
        number: height,
        hash: test_hash(height, salt),
        parent_hash,
        timestamp: 1_700_000_000 + height,
        chain_id: 1,
    }
}

// ---------------------------------------------------------------------------
// MemStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    blocks: BTreeMap<u64, Block>,
    transfers: BTreeMap<(u64, u64), Transfer>,
    checkpoints: HashMap<String, Checkpoint>,
    statuses: HashMap<String, SyncStatus>,
    locks: HashMap<String, (String, Instant)>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert canonical (salt 0) blocks for the given heights.
    pub async fn seed_canonical(&self, range: RangeInclusive<u64>) {
        let mut inner = self.inner.lock().await;
        for height in range {
            let parent_hash = if height == 0 {
                zero_hash()
            } else {
                test_hash(height - 1, 0)
            };
            inner
                .blocks
                .insert(height, test_block(height, 0, parent_hash));
        }
    }

    pub async fn block_count(&self) -> usize {
        self.inner.lock().await.blocks.len()
    }

    pub async fn transfers_at(&self, number: u64) -> Vec<Transfer> {
        self.inner
            .lock()
            .await
            .transfers
            .range((number, 0)..=(number, u64::MAX))
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub async fn orphan_transfer_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .transfers
            .values()
            .filter(|t| !inner.blocks.contains_key(&t.block_number))
            .count()
    }

    pub async fn snapshot(&self) -> (Vec<Block>, Vec<Transfer>) {
        let inner = self.inner.lock().await;
        (
            inner.blocks.values().cloned().collect(),
            inner.transfers.values().cloned().collect(),
        )
    }

    /// Panic unless the stored chain is contiguous and parent-linked.
    pub async fn assert_linked(&self) {
        let inner = self.inner.lock().await;
        let mut previous: Option<&Block> = None;
        for block in inner.blocks.values() {
            if let Some(prev) = previous {
                assert_eq!(
                    block.number,
                    prev.number + 1,
                    "hole between {} and {}",
                    prev.number,
                    block.number
                );
                assert_eq!(
                    block.parent_hash, prev.hash,
                    "linkage broken at height {}",
                    block.number
                );
            }
            previous = Some(block);
        }
    }

    fn delete_after_locked(inner: &mut MemInner, number: u64) -> Result<u64, Error> {
        let doomed: Vec<u64> = inner
            .blocks
            .keys()
            .filter(|n| **n > number)
            .copied()
            .collect();
        if doomed.len() as u64 > MAX_REORG_DEPTH {
            return Err(Error::ReorgOutOfBounds(format!(
                "refusing to delete {} blocks above {number}",
                doomed.len()
            )));
        }
        for height in &doomed {
            inner.blocks.remove(height);
            let keys: Vec<(u64, u64)> = inner
                .transfers
                .range((*height, 0)..=(*height, u64::MAX))
                .map(|(k, _)| *k)
                .collect();
            for key in keys {
                inner.transfers.remove(&key);
            }
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl BlockStore for MemStore {
    async fn max_height(&self) -> Result<Option<u64>, Error> {
        Ok(self.inner.lock().await.blocks.keys().next_back().copied())
    }

    async fn find_by_height(&self, number: u64) -> Result<Option<Block>, Error> {
        Ok(self.inner.lock().await.blocks.get(&number).cloned())
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<Block>, Error> {
        Ok(self
            .inner
            .lock()
            .await
            .blocks
            .values()
            .find(|b| b.hash == hash)
            .cloned())
    }

    async fn commit_batch(&self, request: &CommitRequest) -> Result<CommitOutcome, Error> {
        let mut inner = self.inner.lock().await;
        let mut outcome = CommitOutcome::default();

        // Validate against the post-rollback view before mutating anything;
        // the lock spans the whole call, so this behaves like a transaction.
        if let Some(rollback_to) = request.rollback_to {
            let above = inner.blocks.keys().filter(|n| **n > rollback_to).count() as u64;
            if above > MAX_REORG_DEPTH {
                return Err(Error::ReorgOutOfBounds(format!(
                    "refusing to delete {above} blocks above {rollback_to}"
                )));
            }
        }
        for block in &request.blocks {
            let survives = request
                .rollback_to
                .map(|floor| block.number <= floor)
                .unwrap_or(true);
            if survives {
                if let Some(stored) = inner.blocks.get(&block.number) {
                    if stored.hash != block.hash {
                        return Err(Error::Corruption(format!(
                            "block {} already stored with hash {}, batch carries {}",
                            block.number, stored.hash, block.hash
                        )));
                    }
                }
            }
        }

        if let Some(rollback_to) = request.rollback_to {
            outcome.blocks_deleted = Self::delete_after_locked(&mut inner, rollback_to)?;
        }

        for block in &request.blocks {
            if !inner.blocks.contains_key(&block.number) {
                inner.blocks.insert(block.number, block.clone());
                outcome.blocks_saved += 1;
            }
        }
        for transfer in &request.transfers {
            let key = (transfer.block_number, transfer.log_index);
            if !inner.transfers.contains_key(&key) {
                inner.transfers.insert(key, transfer.clone());
                outcome.transfers_saved += 1;
            }
        }

        inner
            .checkpoints
            .insert(request.checkpoint.name.clone(), request.checkpoint.clone());
        inner
            .statuses
            .insert(request.status.processor_name.clone(), request.status.clone());
        Ok(outcome)
    }

    async fn delete_after(&self, number: u64) -> Result<u64, Error> {
        let mut inner = self.inner.lock().await;
        Self::delete_after_locked(&mut inner, number)
    }

    async fn detect_gaps(&self) -> Result<Vec<Gap>, Error> {
        let inner = self.inner.lock().await;
        let mut gaps = Vec::new();
        let heights: Vec<u64> = inner.blocks.keys().copied().collect();
        for pair in heights.windows(2) {
            if pair[1] - pair[0] > 1 {
                gaps.push(Gap {
                    lo: pair[0] + 1,
                    hi: pair[1] - 1,
                });
            }
        }
        Ok(gaps)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), Error> {
        self.inner
            .lock()
            .await
            .checkpoints
            .insert(checkpoint.name.clone(), checkpoint.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>, Error> {
        Ok(self.inner.lock().await.checkpoints.get(name).cloned())
    }

    async fn upsert_sync_status(&self, status: &SyncStatus) -> Result<(), Error> {
        self.inner
            .lock()
            .await
            .statuses
            .insert(status.processor_name.clone(), status.clone());
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        name: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.locks.get(name) {
            Some((holder, expires_at)) if *expires_at > now && holder != instance_id => Ok(false),
            _ => {
                inner
                    .locks
                    .insert(name.to_string(), (instance_id.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn renew_lock(
        &self,
        name: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, Error> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.locks.get_mut(name) {
            Some((holder, expires_at)) if *expires_at >= now && holder == instance_id => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, name: &str, instance_id: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if let Some((holder, _)) = inner.locks.get(name) {
            if holder == instance_id {
                inner.locks.remove(name);
            }
        }
        Ok(())
    }

    async fn healthcheck(&self) -> Result<(), Error> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedChain
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChainInner {
    blocks: BTreeMap<u64, RawBlock>,
    logs: Vec<RawLog>,
    block_calls: u64,
    reject_remaining: u64,
    rejected: u64,
    fail_head: bool,
}

/// A canonical chain the tests control: linear histories, re-mined suffixes,
/// injected provider failures and scripted Transfer logs.
#[derive(Default)]
pub struct ScriptedChain {
    inner: Mutex<ChainInner>,
}

impl ScriptedChain {
    pub fn linear(head: u64) -> Self {
        Self::linear_with_salt(head, 0)
    }

    pub fn linear_with_salt(head: u64, salt: u64) -> Self {
        let mut blocks = BTreeMap::new();
        let mut parent = zero_hash();
        for height in 0..=head {
            let hash = test_hash(height, salt);
            blocks.insert(height, raw_block(height, &hash, &parent));
            parent = hash;
        }
        Self {
            inner: Mutex::new(ChainInner {
                blocks,
                ..Default::default()
            }),
        }
    }

    /// Re-mine blocks from `at` to the head with a new fork salt, extending
    /// the chain if it was shorter. Mirrors a reorg as a provider shows it.
    pub async fn rewind(&self, at: u64, salt: u64) {
        let mut inner = self.inner.lock().await;
        let head = inner.blocks.keys().next_back().copied().unwrap_or(0);
        let mut parent = if at == 0 {
            zero_hash()
        } else {
            inner
                .blocks
                .get(&(at - 1))
                .map(|b| b.hash.clone())
                .unwrap_or_else(zero_hash)
        };
        for height in at..=head {
            let hash = test_hash(height, salt);
            inner.blocks.insert(height, raw_block(height, &hash, &parent));
            parent = hash;
        }
    }

    /// Script one Transfer log into a block.
    pub async fn add_transfer(
        &self,
        block: u64,
        log_index: u64,
        token: &str,
        participant_salt: u64,
        amount_decimal: &str,
    ) {
        let amount = BigUint::from_str_radix(amount_decimal, 10).expect("decimal amount");
        let data = format!("0x{:0>64}", amount.to_str_radix(16));
        let log = RawLog {
            address: token.to_string(),
            topics: vec![
                TRANSFER_TOPIC0.to_string(),
                format!("0x{:0>24}{}", "", &test_address(participant_salt)[2..]),
                format!("0x{:0>24}{}", "", &test_address(participant_salt + 1)[2..]),
            ],
            data,
            block_number: Some(format!("0x{block:x}")),
            transaction_hash: Some(test_hash(block, 700 + log_index)),
            log_index: Some(format!("0x{log_index:x}")),
            removed: Some(false),
        };
        self.inner.lock().await.logs.push(log);
    }

    pub async fn fail_next_block_fetches(&self, count: u64) {
        self.inner.lock().await.reject_remaining = count;
    }

    pub async fn fail_head_always(&self) {
        self.inner.lock().await.fail_head = true;
    }

    pub async fn block_calls(&self) -> u64 {
        self.inner.lock().await.block_calls
    }

    pub async fn rejected_block_calls(&self) -> u64 {
        self.inner.lock().await.rejected
    }
}

fn raw_block(height: u64, hash: &str, parent: &str) -> RawBlock {
    RawBlock {
        number: format!("0x{height:x}"),
        hash: hash.to_string(),
        parent_hash: parent.to_string(),
        timestamp: format!("0x{:x}", 1_700_000_000u64 + height),
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn head_height(&self) -> Result<u64, Error> {
        let inner = self.inner.lock().await;
        if inner.fail_head {
            return Err(Error::Rpc {
                method: "eth_blockNumber".into(),
                message: "scripted outage".into(),
                retryable: true,
            });
        }
        Ok(inner.blocks.keys().next_back().copied().unwrap_or(0))
    }

    async fn chain_id(&self) -> Result<u64, Error> {
        Ok(1)
    }

    async fn block_by_number(&self, number: u64) -> Result<RawBlock, Error> {
        let mut inner = self.inner.lock().await;
        inner.block_calls += 1;
        if inner.reject_remaining > 0 {
            inner.reject_remaining -= 1;
            inner.rejected += 1;
            return Err(Error::Rpc {
                method: "eth_getBlockByNumber".into(),
                message: "429 too many requests".into(),
                retryable: true,
            });
        }
        inner.blocks.get(&number).cloned().ok_or_else(|| Error::Rpc {
            method: "eth_getBlockByNumber".into(),
            message: format!("block {number} not available yet"),
            retryable: true,
        })
    }

    async fn logs_in_range(
        &self,
        lo: u64,
        hi: u64,
        filter: &LogFilter,
    ) -> Result<Vec<RawLog>, Error> {
        let inner = self.inner.lock().await;
        Ok(inner
            .logs
            .iter()
            .filter(|log| {
                let number = log
                    .block_number
                    .as_deref()
                    .and_then(|h| u64::from_str_radix(h.trim_start_matches("0x"), 16).ok())
                    .unwrap_or(0);
                if number < lo || number > hi {
                    return false;
                }
                if let Some(address) = &filter.address {
                    if !log.address.eq_ignore_ascii_case(address) {
                        return false;
                    }
                }
                if let Some(topic0) = &filter.topic0 {
                    match log.topics.first() {
                        Some(t) if t.eq_ignore_ascii_case(topic0) => {}
                        _ => return false,
                    }
                }
                true
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_store_honors_save_delete_save_round_trip() {
        // save_batch(B); delete_after(lo-1); save_batch(B) == save_batch(B)
        let store = MemStore::new();
        store.seed_canonical(0..=4).await;
        let before = store.snapshot().await;

        let deleted = store.delete_after(1).await.unwrap();
        assert_eq!(deleted, 3);
        store.seed_canonical(2..=4).await;
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn mem_store_detects_gaps() {
        let store = MemStore::new();
        store.seed_canonical(0..=3).await;
        store.seed_canonical(7..=9).await;
        store.seed_canonical(12..=12).await;
        let gaps = store.detect_gaps().await.unwrap();
        assert_eq!(
            gaps,
            vec![Gap { lo: 4, hi: 6 }, Gap { lo: 10, hi: 11 }]
        );
    }

    #[tokio::test]
    async fn mem_store_locks_are_exclusive_with_ttl() {
        let store = MemStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.try_acquire_lock("block-sync", "a", ttl).await.unwrap());
        assert!(!store.try_acquire_lock("block-sync", "b", ttl).await.unwrap());
        // Re-entrant for the same holder, renewable, and gone after release.
        assert!(store.try_acquire_lock("block-sync", "a", ttl).await.unwrap());
        assert!(store.renew_lock("block-sync", "a", ttl).await.unwrap());
        assert!(!store.renew_lock("block-sync", "b", ttl).await.unwrap());
        store.release_lock("block-sync", "b").await.unwrap();
        assert!(!store.try_acquire_lock("block-sync", "b", ttl).await.unwrap());
        store.release_lock("block-sync", "a").await.unwrap();
        assert!(store.try_acquire_lock("block-sync", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn scripted_chain_serves_rewound_suffix() {
        let chain = ScriptedChain::linear(10);
        chain.rewind(6, 1).await;
        let block5 = chain.block_by_number(5).await.unwrap();
        let block6 = chain.block_by_number(6).await.unwrap();
        assert_eq!(block5.hash, test_hash(5, 0));
        assert_eq!(block6.hash, test_hash(6, 1));
        assert_eq!(block6.parent_hash, test_hash(5, 0));
        assert_eq!(chain.head_height().await.unwrap(), 10);
    }
}
