// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

use crate::contract::TransactionTx;
use crate::message::Batch;
use crate::testutil::TEST_WAIT;
use crate::transaction::{AckReceiver, Transaction};
use manifold_config::Label;

pub(super) fn label(raw: &str) -> Label {
    Label::parse(raw).expect("label should be valid")
}

/// Sends an arbitrary batch and returns its ack receiver.
pub(super) async fn send_batch(sender: &TransactionTx, batch: Batch) -> AckReceiver {
    let (txn, ack_rx) = Transaction::new(batch);
    tokio::time::timeout(TEST_WAIT, sender.send_async(txn))
        .await
        .expect("timed out waiting for broker intake")
        .expect("broker inbound channel should be open");
    ack_rx
}

mod fan_out_sequential;
