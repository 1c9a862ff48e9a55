// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Latency-adaptive token bucket
//!
//! A background tick adds `rate/10` tokens every 100 ms and wakes waiters in
//! FIFO order. Round-trip feedback from completed commands drives the refill
//! rate: sustained latency above the critical threshold collapses the rate to
//! the floor and empties the bucket, moderate latency halves the nominal
//! rate, healthy latency recovers additively. Latency leads router-CPU
//! distress, so throttling here preserves the control plane.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Refill tick period.
const TICK: Duration = Duration::from_millis(100);
/// Feedback samples required before the rate adapts.
const MIN_SAMPLES: usize = 5;
/// Additive recovery step in tokens/s.
const RECOVERY_STEP: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Steady-state refill rate in tokens per second.
    pub nominal_rate: f64,
    /// Bucket capacity (burst allowance).
    pub burst: f64,
    /// Rate floor under critical latency.
    pub min_rate: f64,
    /// Mean round-trip above this halves the rate.
    pub warn_latency: Duration,
    /// Mean round-trip above this collapses the rate to the floor.
    pub critical_latency: Duration,
    /// Rolling feedback window length.
    pub history_size: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            nominal_rate: 10.0,
            burst: 20.0,
            min_rate: 2.0,
            warn_latency: Duration::from_millis(200),
            critical_latency: Duration::from_millis(500),
            history_size: 10,
        }
    }
}

struct BucketState {
    tokens: f64,
    rate: f64,
    waiters: VecDeque<oneshot::Sender<()>>,
    latencies: VecDeque<Duration>,
}

pub struct RateLimiter {
    state: Arc<Mutex<BucketState>>,
    config: RateLimiterConfig,
    cancel: CancellationToken,
}

impl RateLimiter {
    /// Create the limiter and start its refill tick.
    ///
    /// The tick task only starts when called from within a tokio runtime
    /// context.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        let state = Arc::new(Mutex::new(BucketState {
            tokens: config.burst,
            rate: config.nominal_rate,
            waiters: VecDeque::new(),
            latencies: VecDeque::new(),
        }));
        let cancel = CancellationToken::new();

        if tokio::runtime::Handle::try_current().is_ok() {
            let tick_state = state.clone();
            let tick_cancel = cancel.clone();
            let burst = config.burst;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(TICK);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let mut bucket = tick_state.lock().await;
                            bucket.tokens = (bucket.tokens + bucket.rate / 10.0).min(burst);
                            Self::drain_waiters(&mut bucket);
                        }
                        () = tick_cancel.cancelled() => {
                            tracing::debug!("Rate limiter tick stopping");
                            break;
                        }
                    }
                }
            });
        }

        Self {
            state,
            config,
            cancel,
        }
    }

    fn drain_waiters(bucket: &mut BucketState) {
        while bucket.tokens >= 1.0 {
            let Some(waiter) = bucket.waiters.pop_front() else {
                break;
            };
            // A failed send means the acquirer gave up; its token stays
            if waiter.send(()).is_ok() {
                bucket.tokens -= 1.0;
            }
        }
    }

    /// Take one token, waiting for refill when the bucket is empty.
    ///
    /// Waiters are released strictly in arrival order.
    pub async fn acquire(&self) -> Result<()> {
        let rx = {
            let mut bucket = self.state.lock().await;
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            bucket.waiters.push_back(tx);
            rx
        };
        rx.await.map_err(|_| Error::ConnectionLost)
    }

    /// Feed one measured round-trip into the adaptation window.
    pub async fn submit_feedback(&self, rtt: Duration) {
        let mut bucket = self.state.lock().await;
        bucket.latencies.push_back(rtt);
        while bucket.latencies.len() > self.config.history_size {
            bucket.latencies.pop_front();
        }
        if bucket.latencies.len() < MIN_SAMPLES {
            return;
        }

        let mean = bucket.latencies.iter().sum::<Duration>() / bucket.latencies.len() as u32;
        if mean > self.config.critical_latency {
            if bucket.rate > self.config.min_rate {
                tracing::warn!(
                    "Router latency critical ({}ms mean), throttling to {} req/s",
                    mean.as_millis(),
                    self.config.min_rate
                );
            }
            bucket.rate = self.config.min_rate;
            bucket.tokens = 0.0;
        } else if mean > self.config.warn_latency {
            bucket.rate = (self.config.nominal_rate / 2.0).max(self.config.min_rate);
        } else {
            bucket.rate = (bucket.rate + RECOVERY_STEP).min(self.config.nominal_rate);
        }
    }

    /// Current refill rate in tokens/s.
    pub async fn current_rate(&self) -> f64 {
        self.state.lock().await.rate
    }

    /// Tokens currently available.
    pub async fn available_tokens(&self) -> f64 {
        self.state.lock().await.tokens
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
