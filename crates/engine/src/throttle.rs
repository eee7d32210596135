// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Bounded redelivery throttle used by the fan-out broker family.
//!
//! A small number of attempts run back to back; after that every further
//! attempt waits a fixed period. The wait is always raced against a
//! cancellation token so that shutdown (or label removal in the dynamic
//! brokers) interrupts a backed-off retry immediately.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_UNTHROTTLED_RETRIES: usize = 3;
const DEFAULT_THROTTLE_PERIOD: Duration = Duration::from_millis(300);

/// Redelivery pacing for one in-flight transaction.
#[derive(Debug)]
pub(crate) struct Throttle {
    unthrottled_retries: usize,
    period: Duration,
    attempts: usize,
}

impl Throttle {
    pub(crate) fn new() -> Self {
        Self {
            unthrottled_retries: DEFAULT_UNTHROTTLED_RETRIES,
            period: DEFAULT_THROTTLE_PERIOD,
            attempts: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Paces the next retry. Returns `false` when the token was cancelled
    /// while waiting, in which case the caller must abandon the attempt.
    pub(crate) async fn retry(&mut self, cancel: &CancellationToken) -> bool {
        self.attempts += 1;
        if self.attempts <= self.unthrottled_retries {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(self.period) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_retries_are_unthrottled() {
        let cancel = CancellationToken::new();
        let mut throttle = Throttle::new();
        for _ in 0..DEFAULT_UNTHROTTLED_RETRIES {
            let before = tokio::time::Instant::now();
            assert!(throttle.retry(&cancel).await);
            assert_eq!(tokio::time::Instant::now(), before);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn later_retries_wait_one_period() {
        let cancel = CancellationToken::new();
        let mut throttle = Throttle::new().with_period(Duration::from_millis(50));
        for _ in 0..DEFAULT_UNTHROTTLED_RETRIES {
            let _unthrottled = throttle.retry(&cancel).await;
        }

        let before = tokio::time::Instant::now();
        assert!(throttle.retry(&cancel).await);
        assert_eq!(
            tokio::time::Instant::now().duration_since(before),
            Duration::from_millis(50)
        );
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut throttle = Throttle::new();
        for _ in 0..DEFAULT_UNTHROTTLED_RETRIES {
            assert!(!throttle.retry(&cancel).await);
        }
        assert!(!throttle.retry(&cancel).await);
    }
}
