// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! The producer/consumer seam every broker plugs into.
//!
//! Two traits at the two ends of a transaction stream:
//!
//! ```text
//!   Input              -- produces transactions on a channel it owns
//!     │ transactions()
//!     ▼
//!   flume rendezvous channel of Transaction
//!     │ attach()
//!     ▼
//!   Output             -- consumes transactions from a channel it is given
//! ```
//!
//! Transaction channels are zero-capacity rendezvous channels: a send
//! completes only when a receiver is ready, so backpressure propagates
//! upstream as blocked sends without any buffering inside the core. The
//! receiver side is cloneable, which lets `transactions()` hand out the same
//! stream repeatedly the way a shared channel handle would.
//!
//! Both traits share the lifecycle surface: `close_at_leisure` requests a
//! drain without blocking, `wait_closed` bounds the wait for completion, and
//! `connected` is a best-effort liveness probe defaulting to `true`.

use crate::error::Error;
use crate::transaction::Transaction;
use async_trait::async_trait;
use std::time::Duration;

/// Sending half of a transaction channel.
pub type TransactionTx = flume::Sender<Transaction>;

/// Receiving half of a transaction channel.
pub type TransactionRx = flume::Receiver<Transaction>;

/// Creates a rendezvous transaction channel.
#[must_use]
pub fn transaction_channel() -> (TransactionTx, TransactionRx) {
    flume::bounded(0)
}

/// A component that consumes a stream of transactions.
#[async_trait]
pub trait Output: Send + Sync {
    /// Binds the inbound transaction channel and starts the component.
    ///
    /// May be called at most once; a second call returns
    /// [`Error::AlreadyStarted`].
    fn attach(&self, transactions: TransactionRx) -> Result<(), Error>;

    /// Best-effort liveness probe.
    fn connected(&self) -> bool {
        true
    }

    /// Requests a drain: stop accepting new work, finish accepted work.
    fn close_at_leisure(&self);

    /// Waits for the drain to complete, up to `timeout`.
    async fn wait_closed(&self, timeout: Duration) -> Result<(), Error>;
}

/// A component that produces a stream of transactions.
#[async_trait]
pub trait Input: Send + Sync {
    /// Returns the channel this component emits transactions on. The channel
    /// is closed once the component has fully drained.
    fn transactions(&self) -> TransactionRx;

    /// Best-effort liveness probe.
    fn connected(&self) -> bool {
        true
    }

    /// Requests a drain: stop producing new work, flush accepted work.
    fn close_at_leisure(&self);

    /// Waits for the drain to complete, up to `timeout`.
    async fn wait_closed(&self, timeout: Duration) -> Result<(), Error>;
}
