// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Retry and backoff policy definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff policy for the retry output wrapper.
///
/// A retry budget of `max_retries = 0` and `max_elapsed_ms = 0` means retries
/// continue until the component is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Delay before the first redelivery attempt.
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Ceiling for the per-attempt delay.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Factor applied to the delay after each failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum number of redelivery attempts. Zero disables the limit.
    #[serde(default)]
    pub max_retries: u32,

    /// Maximum total time spent retrying one transaction, in milliseconds.
    /// Zero disables the limit.
    #[serde(default)]
    pub max_elapsed_ms: u64,
}

impl RetryPolicy {
    /// Delay before the first redelivery attempt.
    #[must_use]
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    /// Ceiling for the per-attempt delay.
    #[must_use]
    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    /// Maximum total time spent retrying one transaction, when bounded.
    #[must_use]
    pub fn max_elapsed(&self) -> Option<Duration> {
        (self.max_elapsed_ms > 0).then(|| Duration::from_millis(self.max_elapsed_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
            max_retries: 0,
            max_elapsed_ms: 0,
        }
    }
}

fn default_initial_interval_ms() -> u64 {
    100
}

fn default_max_interval_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    1.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unbounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.max_elapsed(), None);
        assert_eq!(policy.initial_interval(), Duration::from_millis(100));
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_retries": 3, "initial_interval_ms": 10}"#)
                .expect("policy should deserialize");
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_interval_ms, 10);
        assert_eq!(policy.max_interval_ms, 1_000);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = serde_json::from_str::<RetryPolicy>(r#"{"backoff": "huge"}"#);
        assert!(err.is_err());
    }
}
