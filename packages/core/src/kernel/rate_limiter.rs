//! Token-bucket rate limiter over a sliding one-minute window, with one
//! bucket per registry (plus a `"geocoding"` bucket for the Nominatim
//! client). Generalized from the crawler pack's binary `acquire`/`release`
//! rate limiter into a budget that can shrink under 429 pressure (§4.1).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::warn;

/// Default requests-per-minute budgets, keyed by the same lowercase string
/// every call site uses (`Registry::as_external_id_key`-style tags plus
/// `"geocoding"` and `"fallback"`).
pub fn default_budget(key: &str) -> f64 {
    match key {
        "ctgov" => 300.0,
        "geocoding" => 60.0,
        _ => 60.0,
    }
}

struct Bucket {
    /// Current effective budget (requests/minute); halved on 429, never
    /// below 1.
    budget_per_min: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(budget_per_min: f64) -> Self {
        Self {
            budget_per_min,
            tokens: budget_per_min,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        let rate_per_sec = self.budget_per_min / 60.0;
        self.tokens = (self.tokens + elapsed * rate_per_sec).min(self.budget_per_min);
    }
}

/// Encapsulates all per-registry rate-limit state behind a short-held lock,
/// replacing the "global mutable rate-limit counters" pattern flagged in §9.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks until a token is available for `key`'s bucket, creating the
    /// bucket with its default budget on first use.
    pub async fn acquire(&self, key: &str) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().unwrap();
                let bucket = buckets
                    .entry(key.to_string())
                    .or_insert_with(|| Bucket::new(default_budget(key)));
                bucket.refill();
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    let rate_per_sec = bucket.budget_per_min / 60.0;
                    let deficit = 1.0 - bucket.tokens;
                    Some(Duration::from_secs_f64((deficit / rate_per_sec).max(0.001)))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Halves `key`'s effective budget for the remainder of the process
    /// lifetime, per "on HTTP 429, the limiter halves the registry's
    /// effective budget for the current window" (§4.1).
    pub fn halve_budget(&self, key: &str) {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(default_budget(key)));
        bucket.budget_per_min = (bucket.budget_per_min / 2.0).max(1.0);
        warn!(registry = key, new_budget = bucket.budget_per_min, "halved rate limit budget after 429");
    }

    pub fn current_budget(&self, key: &str) -> f64 {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .get(key)
            .map(|b| b.budget_per_min)
            .unwrap_or_else(|| default_budget(key))
    }

    /// Fraction of `key`'s bucket currently consumed (`1 - tokens/budget`),
    /// refilling first so the read reflects the current instant. Feeds the
    /// monitoring subsystem's rate-limit-usage alert (§4.7).
    pub fn usage_fraction(&self, key: &str) -> f64 {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(default_budget(key)));
        bucket.refill();
        if bucket.budget_per_min <= 0.0 {
            return 0.0;
        }
        (1.0 - bucket.tokens / bucket.budget_per_min).clamp(0.0, 1.0)
    }

    pub fn tracked_keys(&self) -> Vec<String> {
        self.buckets.lock().unwrap().keys().cloned().collect()
    }
}

/// Full-jitter exponential backoff: `base * 2^(attempt-1)` capped, then
/// uniformly sampled down to zero, matching the backoff-bound testable
/// property in §8 (`[min(base·2^(k-1), cap), min(base·2^(k-1)·(1+jitter), cap)]`
/// collapsed to AWS-style full jitter for the HTTP client's own retries).
pub fn full_jitter_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
    let capped = exp.min(cap.as_secs_f64());
    let jittered = rand::thread_rng().gen_range(0.0..=capped);
    Duration::from_secs_f64(jittered)
}

/// Bounded exponential backoff without jitter, used by the job queue's
/// retry scheduling (§4.2): `min(base * 2^attempts, cap)`.
pub fn bounded_backoff(attempts: i32, base: Duration, cap: Duration) -> Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempts.max(0) as i32);
    Duration::from_secs_f64(exp.min(cap.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halving_budget_never_drops_below_one() {
        let limiter = RateLimiter::new();
        for _ in 0..20 {
            limiter.halve_budget("ctgov");
        }
        assert!(limiter.current_budget("ctgov") >= 1.0);
    }

    #[test]
    fn bounded_backoff_matches_spec_formula() {
        assert_eq!(
            bounded_backoff(0, Duration::from_secs(60), Duration::from_secs(3600)),
            Duration::from_secs(60)
        );
        assert_eq!(
            bounded_backoff(6, Duration::from_secs(60), Duration::from_secs(3600)),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn full_jitter_backoff_is_bounded_by_cap() {
        let cap = Duration::from_secs(60);
        for attempt in 1..10 {
            let d = full_jitter_backoff(attempt, Duration::from_secs(1), cap);
            assert!(d <= cap);
        }
    }

    #[tokio::test]
    async fn acquire_does_not_block_while_tokens_remain() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        limiter.acquire("ctgov").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
