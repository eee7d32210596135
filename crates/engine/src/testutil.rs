// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Mock inputs and outputs shared by the broker, retry and switch tests.

use crate::contract::{transaction_channel, Input, Output, TransactionRx, TransactionTx};
use crate::error::Error;
use crate::message::Batch;
use crate::transaction::{AckOutcome, AckReceiver, Transaction};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Generous bound for any single await in a test.
pub(crate) const TEST_WAIT: Duration = Duration::from_secs(1);

/// Output stub that exposes the channel a broker attached to it.
#[derive(Default)]
pub(crate) struct MockOutput {
    stream: Mutex<Option<TransactionRx>>,
}

impl MockOutput {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The transaction stream this output was attached to.
    pub(crate) fn stream(&self) -> TransactionRx {
        self.stream
            .lock()
            .clone()
            .expect("mock output should be attached before use")
    }

    /// Receives the next transaction, failing the test on timeout.
    pub(crate) async fn recv(&self) -> Transaction {
        let stream = self.stream();
        tokio::time::timeout(TEST_WAIT, stream.recv_async())
            .await
            .expect("timed out waiting for transaction to propagate")
            .expect("transaction stream should be open")
    }

    /// Whether the attached stream has been closed by the broker.
    pub(crate) fn stream_closed(&self) -> bool {
        self.stream().is_disconnected()
    }
}

#[async_trait]
impl Output for MockOutput {
    fn attach(&self, transactions: TransactionRx) -> Result<(), Error> {
        let mut slot = self.stream.lock();
        if slot.is_some() {
            return Err(Error::AlreadyStarted);
        }
        *slot = Some(transactions);
        Ok(())
    }

    fn close_at_leisure(&self) {}

    async fn wait_closed(&self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }
}

/// Input stub fed manually from the test body.
pub(crate) struct MockInput {
    sender: Mutex<Option<TransactionTx>>,
    stream: TransactionRx,
}

impl MockInput {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, rx) = transaction_channel();
        Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            stream: rx,
        })
    }

    /// A sender handle for feeding transactions into this input.
    pub(crate) fn sender(&self) -> TransactionTx {
        self.sender
            .lock()
            .clone()
            .expect("mock input should not be closed")
    }
}

#[async_trait]
impl Input for MockInput {
    fn transactions(&self) -> TransactionRx {
        self.stream.clone()
    }

    fn close_at_leisure(&self) {
        drop(self.sender.lock().take());
    }

    async fn wait_closed(&self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }
}

/// Sends a single-part transaction and returns its ack receiver.
pub(crate) async fn send_payload(sender: &TransactionTx, payload: &str) -> AckReceiver {
    let (txn, ack_rx) = Transaction::new(Batch::from_payloads([payload.to_owned()]));
    tokio::time::timeout(TEST_WAIT, sender.send_async(txn))
        .await
        .expect("timed out waiting for broker intake")
        .expect("broker inbound channel should be open");
    ack_rx
}

/// Awaits an ack outcome, failing the test on timeout.
pub(crate) async fn expect_ack(ack_rx: AckReceiver) -> AckOutcome {
    tokio::time::timeout(TEST_WAIT, ack_rx)
        .await
        .expect("timed out waiting for acknowledgment")
        .expect("ack sink should not be dropped")
}
