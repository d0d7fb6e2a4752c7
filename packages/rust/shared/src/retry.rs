//! Bounded-attempt retry with fixed or exponential backoff.
//!
//! A [`RetryPolicy`] is a plain value applied at each call site. Two named
//! shapes exist: [`RetryPolicy::transient`] for short in-stage retries and
//! [`RetryPolicy::polling`] for the orchestrator's trigger and idle polling.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DigestError, Result};

/// Delay shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always >= 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Proportional jitter applied to every delay, in `0.0..=1.0`.
    pub jitter: f64,
}

impl RetryPolicy {
    /// 3 attempts, 1 s apart, no jitter.
    pub fn transient() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_secs(1)),
            jitter: 0.0,
        }
    }

    /// 35 attempts, 10 s apart, ±10% jitter.
    pub fn polling() -> Self {
        Self {
            max_attempts: 35,
            backoff: Backoff::Fixed(Duration::from_secs(10)),
            jitter: 0.1,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay to wait after failed attempt number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, factor, max } => {
                let exp = attempt.saturating_sub(1).min(63) as i32;
                let secs = base.as_secs_f64() * factor.powi(exp);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }

    /// Delay after attempt `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0))
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or runs
    /// out of attempts. See [`DigestError::is_transient`].
    pub async fn run<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_if(label, DigestError::is_transient, op).await
    }

    /// Like [`run`](Self::run) with a caller-supplied retry classification.
    ///
    /// `op` receives the 1-based attempt number. A non-retryable error is
    /// returned unchanged; exhaustion returns [`DigestError::RetryExhausted`].
    pub async fn run_if<T, F, Fut, P>(&self, label: &str, is_retryable: P, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&DigestError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    tracing::warn!(label, attempts = attempt, error = %e, "retries exhausted");
                    return Err(DigestError::RetryExhausted {
                        attempts: attempt,
                        last_error: Box::new(e),
                    });
                }
                Err(e) => {
                    let wait = self.delay(attempt);
                    tracing::debug!(
                        label,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config form
// ---------------------------------------------------------------------------

/// Backoff kind as written in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// `[retry.transient]` / `[retry.polling]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    /// Fixed delay, or the exponential base.
    pub delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Exponential cap. Defaults to 10x the base delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter: f64,
}

fn default_factor() -> f64 {
    2.0
}

impl RetryConfig {
    pub fn transient() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Fixed,
            delay_ms: 1_000,
            factor: default_factor(),
            max_delay_ms: None,
            jitter: 0.0,
        }
    }

    pub fn polling() -> Self {
        Self {
            max_attempts: 35,
            backoff: BackoffKind::Fixed,
            delay_ms: 10_000,
            factor: default_factor(),
            max_delay_ms: None,
            jitter: 0.1,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        let base = Duration::from_millis(cfg.delay_ms);
        let backoff = match cfg.backoff {
            BackoffKind::Fixed => Backoff::Fixed(base),
            BackoffKind::Exponential => Backoff::Exponential {
                base,
                factor: cfg.factor,
                max: cfg
                    .max_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(base * 10),
            },
        };
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff,
            jitter: cfg.jitter.clamp(0.0, 1.0),
        }
    }
}
