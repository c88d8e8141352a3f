//! Bounded retries for idempotent venue reads.
//!
//! Only errors carrying a [`Transient`] marker are retried. Everything else
//! (bad signature, rejected symbol, malformed envelope) fails on first sight.

use std::fmt;
use std::future::Future;

use anyhow::Result;
use rand::Rng;
use serde_json::json;
use tokio::time::{sleep, Duration};

use crate::logging::{log, obj, v_str, Domain, Level};

/// Marks a failure worth another attempt: timeouts, throttling, 5xx.
#[derive(Debug)]
pub struct Transient(pub String);

impl fmt::Display for Transient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transient: {}", self.0)
    }
}

impl std::error::Error for Transient {}

pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<Transient>())
}

/// HTTP statuses that say "try again later".
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, base: Duration::from_millis(200), cap: Duration::from_secs(2), jitter: 0.3 }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `n` (0-based) for a jitter draw in [-1, 1].
    pub fn delay(&self, n: u32, draw: f64) -> Duration {
        let doubled = self.base.saturating_mul(2u32.saturating_pow(n.min(16)));
        let capped = doubled.min(self.cap).as_secs_f64();
        let spread = capped * self.jitter.clamp(0.0, 1.0) * draw.clamp(-1.0, 1.0);
        Duration::from_secs_f64((capped + spread).max(0.0))
    }
}

/// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
pub async fn retry_async<F, Fut, T>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut n = 0;
    loop {
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        n += 1;
        if n >= attempts || !is_transient(&err) {
            return Err(err);
        }
        let delay = policy.delay(n - 1, rand::thread_rng().gen_range(-1.0..=1.0));
        log(
            Level::Warn,
            Domain::Exec,
            "retry",
            obj(&[
                ("op", v_str(op_name)),
                ("attempt", json!(n)),
                ("of", json!(attempts)),
                ("error", v_str(&format!("{:#}", err))),
                ("delay_ms", json!(delay.as_millis() as u64)),
            ]),
        );
        sleep(delay).await;
    }
}
