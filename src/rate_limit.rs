/// Rate Limiter - Token-Bucket Admission for Chain-Client Calls
///
/// One bucket per process, owned by the sync engine and shared by handle.
/// Callers receive immutable `Admission` values; the bucket state is only
/// mutated behind its own lock. Refill is computed from the wall-clock delta
/// and floored afterwards so fractional credit cannot drift over long runs.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Error;

/// Outcome of a non-blocking admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub allowed: bool,
    /// Suggested wait before retrying, when not allowed.
    pub wait_hint_ms: u64,
    pub tokens_left: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    tokens_per_interval: f64,
    interval: Duration,
    max_burst: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Construction fails on parameters that would permit an infinite wait
    /// loop: a zero rate or a zero interval.
    pub fn new(
        tokens_per_interval: f64,
        interval_ms: u64,
        max_burst: f64,
    ) -> Result<Self, Error> {
        if tokens_per_interval <= 0.0 {
            return Err(Error::Config(
                "rate limiter: tokens_per_interval must be positive".into(),
            ));
        }
        if interval_ms == 0 {
            return Err(Error::Config(
                "rate limiter: interval_ms must be positive".into(),
            ));
        }
        if max_burst < tokens_per_interval {
            return Err(Error::Config(format!(
                "rate limiter: max_burst ({max_burst}) must be >= tokens_per_interval ({tokens_per_interval})"
            )));
        }
        Ok(Self {
            tokens_per_interval,
            interval: Duration::from_millis(interval_ms),
            max_burst,
            state: Mutex::new(BucketState {
                tokens: max_burst,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Non-blocking admission check.
    pub fn try_consume(&self, n: f64) -> Admission {
        self.admit_at(n, Instant::now())
    }

    fn admit_at(&self, n: f64, now: Instant) -> Admission {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // Refill from elapsed wall-clock time, cap at burst, then floor.
        let elapsed = now.saturating_duration_since(state.last_refill);
        if !elapsed.is_zero() {
            let added =
                elapsed.as_secs_f64() / self.interval.as_secs_f64() * self.tokens_per_interval;
            state.tokens = (state.tokens + added).min(self.max_burst).floor();
            state.last_refill = now;
        }

        if state.tokens >= n {
            state.tokens -= n;
            return Admission {
                allowed: true,
                wait_hint_ms: 0,
                tokens_left: state.tokens,
            };
        }

        let missing = n - state.tokens;
        let per_ms = self.tokens_per_interval / self.interval.as_millis() as f64;
        let wait_hint_ms = (missing / per_ms).ceil() as u64;
        Admission {
            allowed: false,
            wait_hint_ms,
            tokens_left: state.tokens,
        }
    }

    /// Cooperatively wait until `n` tokens are available, sleeping on the
    /// bucket's own hint between attempts. Gives up after `max_retries`.
    pub async fn consume(&self, n: f64, max_retries: u32) -> Result<(), Error> {
        if n > self.max_burst {
            return Err(Error::Config(format!(
                "rate limiter: requested {n} tokens exceeds max_burst {}",
                self.max_burst
            )));
        }

        let mut attempts = 0u32;
        loop {
            let admission = self.try_consume(n);
            if admission.allowed {
                return Ok(());
            }
            if admission.wait_hint_ms == 0 {
                // Insufficient tokens with a zero wait hint means the bucket
                // parameters cannot make progress.
                return Err(Error::Config(
                    "rate limiter: zero wait hint with insufficient tokens".into(),
                ));
            }
            if attempts >= max_retries {
                return Err(Error::RetriesExhausted {
                    attempts,
                    source: Box::new(Error::Network(
                        "rate limiter: tokens unavailable".into(),
                    )),
                });
            }
            attempts += 1;
            tokio::time::sleep(Duration::from_millis(admission.wait_hint_ms)).await;
        }
    }

    /// Test hook: refill the bucket to burst. Production code must not call
    /// this; it exists so tests can run without waiting on wall-clock refill.
    #[cfg(test)]
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.tokens = self.max_burst;
        state.last_refill = Instant::now();
    }
}
