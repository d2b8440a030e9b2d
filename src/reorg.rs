/// Chain Reorganization Detection
///
/// Decides, for the first block of every batch, whether the local chain can
/// accept it: as a plain extension, as a replay, as an initial-sync gap, or
/// only after rolling back to a common ancestor. The chain is a mapping
/// height -> block; the ancestor walk is a bounded loop over heights with an
/// explicit visited set, never a pointer chase.
///
/// Safety bounds:
/// - at most MAX_WALK iterations, then fail fatally
/// - visited-hash LRU (cap 100) turns a hash cycle into a corruption fault
/// - candidate lookups go through a bounded TTL'd cache so one walk does not
///   hammer the provider N+1 times

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use tokio_util::sync::CancellationToken;

use crate::constants::{MAX_REORG_DEPTH, MAX_SAFE_QUANTITY, MAX_WALK, REORG_CACHE_CAP};
use crate::error::Error;
use crate::rate_limit::RateLimiter;
use crate::retry::{with_retries, RetryPolicy};
use crate::rpc::ChainClient;
use crate::store::BlockStore;
use crate::types::Block;
use crate::validate::normalize_hash;

/// How long a cached candidate-chain header stays trustworthy.
const CANDIDATE_TTL: Duration = Duration::from_secs(30);

/// What the engine should do with the candidate block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorgOutcome {
    /// Extends the local chain, or replays an already-committed block.
    Accept,
    /// Nothing stored near this height; accept tentatively (initial sync or
    /// gap repair will close the hole).
    InitialGap,
    /// The local suffix above `common_ancestor` is stale and must go.
    Rollback { common_ancestor: u64, depth: u64 },
}

/// Candidate-chain header at one height: (hash, parent_hash).
struct CachedHeader {
    hash: String,
    parent_hash: String,
    fetched_at: Instant,
}

pub struct ReorgDetector<C, S> {
    client: Arc<C>,
    store: Arc<S>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    candidates: LruCache<u64, CachedHeader>,
}

impl<C: ChainClient, S: BlockStore> ReorgDetector<C, S> {
    pub fn new(
        client: Arc<C>,
        store: Arc<S>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            store,
            limiter,
            policy,
            candidates: LruCache::new(
                NonZeroUsize::new(REORG_CACHE_CAP).expect("cache capacity is non-zero"),
            ),
        }
    }

    /// Classify the first block of a batch against the local chain.
    pub async fn check(
        &mut self,
        candidate: &Block,
        shutdown: &CancellationToken,
    ) -> Result<ReorgOutcome, Error> {
        if candidate.number == 0 {
            return Ok(ReorgOutcome::Accept);
        }

        // Height collision first: a different hash at our own height means a
        // stale suffix starts at or before us.
        if let Some(stored) = self.store.find_by_height(candidate.number).await? {
            if stored.hash == candidate.hash {
                return Ok(ReorgOutcome::Accept);
            }
            return self.walk(candidate, shutdown).await;
        }

        // Plain extension: the claimed parent is committed.
        if let Some(parent) = self.store.find_by_hash(&candidate.parent_hash).await? {
            if parent.number + 1 == candidate.number {
                return Ok(ReorgOutcome::Accept);
            }
            return Err(Error::Corruption(format!(
                "block {} claims parent {} which is stored at height {}",
                candidate.number, candidate.parent_hash, parent.number
            )));
        }

        // Parent hash unknown. A block at the parent height with some other
        // hash is a divergence; an empty parent height is an initial-sync gap.
        match self.store.find_by_height(candidate.number - 1).await? {
            Some(_) => self.walk(candidate, shutdown).await,
            None => Ok(ReorgOutcome::InitialGap),
        }
    }

    /// Walk backward from the candidate's parent, height by height, until a
    /// stored hash matches the candidate chain's hash at that height.
    async fn walk(
        &mut self,
        candidate: &Block,
        shutdown: &CancellationToken,
    ) -> Result<ReorgOutcome, Error> {
        let mut visited: LruCache<String, ()> = LruCache::new(
            NonZeroUsize::new(REORG_CACHE_CAP).expect("cache capacity is non-zero"),
        );

        let mut height = candidate.number - 1;
        let mut walk_hash = candidate.parent_hash.clone();

        for _ in 0..MAX_WALK {
            if visited.contains(&walk_hash) {
                return Err(Error::Corruption(format!(
                    "hash cycle at {walk_hash} while walking for a common ancestor"
                )));
            }
            visited.put(walk_hash.clone(), ());

            if let Some(stored) = self.store.find_by_height(height).await? {
                if stored.hash == walk_hash {
                    return self.rollback_outcome(candidate.number, height);
                }
            }

            if height == 0 {
                return Err(Error::ReorgOutOfBounds(
                    "no common ancestor: candidate chain diverges at genesis".into(),
                ));
            }

            let header = self.candidate_at(height, shutdown).await?;
            if header.0 != walk_hash {
                // The chain moved underneath the walk; surface as transient
                // so the batch aborts and the outer loop starts over.
                return Err(Error::Rpc {
                    method: "eth_getBlockByNumber".into(),
                    message: format!(
                        "candidate chain changed during ancestor walk at height {height}"
                    ),
                    retryable: true,
                });
            }
            walk_hash = header.1;
            height -= 1;
        }

        Err(Error::ReorgOutOfBounds(format!(
            "no common ancestor within {MAX_WALK} blocks of {}",
            candidate.number
        )))
    }

    fn rollback_outcome(&self, tip: u64, ancestor: u64) -> Result<ReorgOutcome, Error> {
        // Depth arithmetic in arbitrary precision; narrow only when provably
        // safe. An unnarrowable depth is an extreme reorg, not a wrap-around.
        let depth_big = BigUint::from(tip) - BigUint::from(ancestor);
        let depth = depth_big
            .to_u64()
            .filter(|d| *d <= MAX_SAFE_QUANTITY)
            .ok_or_else(|| {
                Error::ReorgOutOfBounds(format!("extreme reorg: depth {depth_big} unrepresentable"))
            })?;
        if depth > MAX_REORG_DEPTH {
            return Err(Error::ReorgOutOfBounds(format!(
                "reorg depth {depth} exceeds MAX_REORG_DEPTH {MAX_REORG_DEPTH}"
            )));
        }
        Ok(ReorgOutcome::Rollback {
            common_ancestor: ancestor,
            depth,
        })
    }

    /// Candidate-chain header at `height`, from cache or the provider.
    async fn candidate_at(
        &mut self,
        height: u64,
        shutdown: &CancellationToken,
    ) -> Result<(String, String), Error> {
        if let Some(cached) = self.candidates.get(&height) {
            if cached.fetched_at.elapsed() < CANDIDATE_TTL {
                return Ok((cached.hash.clone(), cached.parent_hash.clone()));
            }
            self.candidates.pop(&height);
        }

        self.limiter.consume(1.0, self.policy.max_attempts).await?;
        let client = Arc::clone(&self.client);
        let raw = with_retries(&self.policy, shutdown, || {
            let client = Arc::clone(&client);
            async move { client.block_by_number(height).await }
        })
        .await?;

        let context = format!("ancestor walk at {height}");
        let hash = normalize_hash(&raw.hash, &context)?;
        let parent_hash = normalize_hash(&raw.parent_hash, &context)?;
        self.candidates.put(
            height,
            CachedHeader {
                hash: hash.clone(),
                parent_hash: parent_hash.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok((hash, parent_hash))
    }
}
