// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Cyclic single-destination broker.
//!
//! Each inbound transaction is forwarded, payload and ack sink untouched, to
//! exactly one output chosen by an advancing cursor modulo the output count.
//! A blocked output blocks the whole broker; callers that need isolation put
//! a retry wrapper or buffer in front of the slow output.

use crate::broker::shutdown_outputs;
use crate::contract::{transaction_channel, Output, TransactionRx, TransactionTx};
use crate::error::Error;
use crate::shutdown::Signaller;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Round-robin broker: one output per transaction, chosen cyclically.
pub struct RoundRobin {
    outputs: Vec<Arc<dyn Output>>,
    senders: Mutex<Option<Vec<TransactionTx>>>,
    shutdown: Signaller,
}

impl RoundRobin {
    /// Creates a round-robin broker over `outputs`.
    pub fn new(outputs: Vec<Arc<dyn Output>>) -> Result<Self, Error> {
        let mut senders = Vec::with_capacity(outputs.len());
        for output in &outputs {
            let (tx, rx) = transaction_channel();
            output.attach(rx)?;
            senders.push(tx);
        }
        Ok(Self {
            outputs,
            senders: Mutex::new(Some(senders)),
            shutdown: Signaller::new(),
        })
    }
}

#[async_trait]
impl Output for RoundRobin {
    fn attach(&self, transactions: TransactionRx) -> Result<(), Error> {
        let senders = self.senders.lock().take().ok_or(Error::AlreadyStarted)?;
        let outputs = self.outputs.clone();
        let shutdown = self.shutdown.clone();
        drop(tokio::spawn(run(transactions, senders, outputs, shutdown)));
        Ok(())
    }

    fn connected(&self) -> bool {
        self.outputs.iter().all(|output| output.connected())
    }

    fn close_at_leisure(&self) {
        self.shutdown.close_at_leisure();
    }

    async fn wait_closed(&self, timeout: Duration) -> Result<(), Error> {
        self.shutdown.wait_closed(timeout).await
    }
}

async fn run(
    transactions: TransactionRx,
    senders: Vec<TransactionTx>,
    outputs: Vec<Arc<dyn Output>>,
    shutdown: Signaller,
) {
    let mut cursor = 0usize;
    loop {
        let txn = tokio::select! {
            () = shutdown.closing() => break,
            recv = transactions.recv_async() => match recv {
                Ok(txn) => txn,
                Err(_disconnected) => break,
            },
        };

        let delivered = tokio::select! {
            () = shutdown.closing() => false,
            sent = senders[cursor].send_async(txn) => sent.is_ok(),
        };
        if !delivered {
            break;
        }

        cursor += 1;
        if cursor >= senders.len() {
            cursor = 0;
        }
    }

    drop(senders);
    shutdown_outputs(&outputs).await;
    shutdown.signal_closed();
}
