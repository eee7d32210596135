// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Broker policy definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Policy shared by the fan-out broker family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FanPolicy {
    /// Number of inbound transactions that may be dispatched in parallel.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for FanPolicy {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_max_in_flight() -> usize {
    1
}

/// Policy for the switch output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SwitchPolicy {
    /// Retry failed sub-batches until they succeed instead of reporting the
    /// failure upstream immediately.
    #[serde(default)]
    pub retry_until_success: bool,

    /// Treat parts that match no case as errors instead of dropping them.
    #[serde(default)]
    pub strict_mode: bool,
}
