// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! The transaction contract: a batch paired with a single-use ack sink.
//!
//! Every transaction accepted by a broker resolves to exactly one value on its
//! ack sink. The sink is a `oneshot` channel, so the single-use property is
//! enforced by construction: acking consumes the sender. Brokers that fan a
//! transaction out create fresh per-output transactions sharing the batch and
//! aggregate the per-output sinks before resolving the inbound one.

use crate::error::Error;
use crate::message::Batch;
use tokio::sync::oneshot;

/// Result delivered on an ack sink: success, or a typed failure.
pub type AckOutcome = Result<(), Error>;

/// Receiving side of an ack sink, owned by the party that created the
/// transaction.
pub type AckReceiver = oneshot::Receiver<AckOutcome>;

/// Single-use sink where the result of processing a transaction is delivered.
#[derive(Debug)]
pub struct AckSender {
    tx: oneshot::Sender<AckOutcome>,
}

impl AckSender {
    /// Delivers the acknowledgment, consuming the sink.
    ///
    /// Delivery is infallible from the sender's side: a receiver that has
    /// already gone away simply discards the outcome.
    pub fn ack(self, outcome: AckOutcome) {
        let _receiver_gone = self.tx.send(outcome);
    }
}

/// A batch paired with its acknowledgment sink and an optional correlation id.
#[derive(Debug)]
pub struct Transaction {
    batch: Batch,
    ack: AckSender,
    id: Option<u64>,
}

impl Transaction {
    /// Creates a transaction, returning it together with the receiving side
    /// of its ack sink.
    pub fn new(batch: Batch) -> (Self, AckReceiver) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                batch,
                ack: AckSender { tx },
                id: None,
            },
            rx,
        )
    }

    /// Attaches a correlation id. Ids are used only for aggregation-side
    /// correlation and need not be unique.
    #[must_use]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// The batch carried by this transaction.
    #[must_use]
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// The correlation id, if one was attached.
    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// Splits the transaction into its batch and ack sink.
    ///
    /// Used by aggregating brokers that resolve the sink only after every
    /// downstream copy has been acknowledged.
    #[must_use]
    pub fn into_parts(self) -> (Batch, AckSender) {
        (self.batch, self.ack)
    }

    /// Resolves this transaction, consuming it.
    pub fn ack(self, outcome: AckOutcome) {
        self.ack.ack(outcome);
    }
}
