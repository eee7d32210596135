// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff evaluator for the retry output wrapper.
//!
//! Turns a [`RetryPolicy`] into a sequence of waits: each failed attempt asks
//! for the next interval, which grows by the policy multiplier up to the
//! configured ceiling. The evaluator returns `None` once either budget
//! (attempt count or elapsed time) is exhausted, which the caller converts
//! into a terminal send-failed acknowledgment.

use manifold_config::retry::RetryPolicy;
use std::time::Duration;
use tokio::time::Instant;

/// Stateful backoff sequence for one transaction's retry loop.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: RetryPolicy,
    next_interval: Duration,
    attempts: u32,
    started: Instant,
}

impl Backoff {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        let next_interval = policy.initial_interval();
        Self {
            policy,
            next_interval,
            attempts: 0,
            started: Instant::now(),
        }
    }

    /// Returns the wait before the next redelivery attempt, or `None` when
    /// the retry budget is exhausted.
    pub(crate) fn next(&mut self) -> Option<Duration> {
        if self.policy.max_retries > 0 && self.attempts >= self.policy.max_retries {
            return None;
        }
        if let Some(max_elapsed) = self.policy.max_elapsed() {
            if self.started.elapsed() >= max_elapsed {
                return None;
            }
        }

        let interval = self.next_interval;
        self.attempts += 1;
        self.next_interval = Duration::from_nanos(
            (self.next_interval.as_nanos() as f64 * self.policy.multiplier) as u64,
        )
        .min(self.policy.max_interval());
        Some(interval)
    }
}
