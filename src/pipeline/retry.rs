//! The retry/backoff policy shared by every external-call site.
//!
//! Extraction, repair, media description, structure, chunking and chapter
//! enrichment all retry through [`RetryPolicy::run`], so "how many times and
//! how long to wait" is decided in exactly one place.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff.
///
/// The wait before retry `n` (1-based) is `base_delay_ms * 2^(n-1)`, capped
/// at `max_delay_ms`. With the defaults (500 ms base, 3 retries) the waits are
/// 500 ms, 1 s, 2 s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` means a single attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// All attempts failed. Carries the last error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted<E> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            ..Self::default()
        }
    }

    /// Wait before the `retry`-th retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(20);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, returns an error `is_retryable` rejects, or
    /// the retry budget is spent.
    ///
    /// `op` receives the 0-based attempt number.
    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        is_retryable: impl Fn(&E) -> bool,
    ) -> Result<T, Exhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt >= self.max_retries || !is_retryable(&e) {
                        return Err(Exhausted {
                            attempts: attempt + 1,
                            last: e,
                        });
                    }
                    attempt += 1;
                    let backoff = self.delay_for(attempt);
                    warn!(
                        "{}: attempt {} failed ({}), retry {}/{} after {}ms",
                        label,
                        attempt,
                        e,
                        attempt,
                        self.max_retries,
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_and_cap() {
        let p = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 500,
            max_delay_ms: 3_000,
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(3), Duration::from_millis(2_000));
        assert_eq!(p.delay_for(4), Duration::from_millis(3_000));
        assert_eq!(p.delay_for(60), Duration::from_millis(3_000));
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, 1);
        let out: Result<u32, Exhausted<String>> = tokio_test::block_on(policy.run(
            "unit",
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("busy".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| true,
        ));
        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let policy = RetryPolicy::new(2, 1);
        let out: Result<(), _> = policy
            .run("unit", |_| async { Err::<(), _>("down") }, |_| true)
            .await;
        assert_eq!(
            out,
            Err(Exhausted {
                attempts: 3,
                last: "down"
            })
        );
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, 1);
        let out: Result<(), _> = policy
            .run(
                "unit",
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("401 unauthorized") }
                },
                |e: &&str| !e.contains("401"),
            )
            .await;
        assert_eq!(out.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
