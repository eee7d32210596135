// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Two-phase shutdown signalling shared by every broker.
//!
//! Phase one is close-at-leisure: a non-blocking drain request. The broker
//! stops accepting new inbound transactions but finishes the ones already
//! accepted, then cascades closure to its downstreams. Phase two is the
//! completion signal raised by the broker loop once its own drain is done.
//! Every blocking channel operation in the core selects on the drain token,
//! which is what keeps shutdown free of hangs.

use crate::error::Error;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Paired drain-request and drain-complete tokens for one broker.
#[derive(Debug, Clone, Default)]
pub struct Signaller {
    at_leisure: CancellationToken,
    closed: CancellationToken,
}

impl Signaller {
    /// Creates a signaller with neither phase triggered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the drain request. Non-blocking and idempotent.
    pub fn close_at_leisure(&self) {
        self.at_leisure.cancel();
    }

    /// Whether the drain request has been raised.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.at_leisure.is_cancelled()
    }

    /// Resolves when the drain request is raised. Safe to poll from any
    /// number of tasks.
    pub fn closing(&self) -> WaitForCancellationFuture<'_> {
        self.at_leisure.cancelled()
    }

    /// The drain-request token itself, for callers that need to derive
    /// per-member child tokens.
    #[must_use]
    pub fn drain_token(&self) -> &CancellationToken {
        &self.at_leisure
    }

    /// Marks the drain as complete. Called exactly once by the broker loop
    /// after its own cleanup has finished.
    pub fn signal_closed(&self) {
        self.closed.cancel();
    }

    /// Whether the drain has completed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Waits for drain completion up to `timeout`.
    pub async fn wait_closed(&self, timeout: Duration) -> Result<(), Error> {
        tokio::time::timeout(timeout, self.closed.cancelled())
            .await
            .map_err(|_elapsed| Error::Timeout)
    }
}
