// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Ordered broadcast broker.
//!
//! Same contract as [`FanOut`](crate::broker::FanOut) except outputs are
//! attempted strictly in index order: output `i + 1` never sees a copy before
//! output `i` has acknowledged success. Multiple inbound transactions may
//! still be in progress in parallel (bounded by `max_in_flight`), each
//! proceeding sequentially through its own output list.

use crate::broker::fan_out::deliver_to_output;
use crate::broker::shutdown_outputs;
use crate::contract::{transaction_channel, Output, TransactionRx, TransactionTx};
use crate::error::Error;
use crate::shutdown::Signaller;
use crate::transaction::Transaction;
use async_trait::async_trait;
use manifold_config::broker::FanPolicy;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Broadcast broker that proceeds to the next output only on success.
pub struct FanOutSequential {
    outputs: Vec<Arc<dyn Output>>,
    senders: Mutex<Option<Vec<TransactionTx>>>,
    policy: FanPolicy,
    shutdown: Signaller,
}

impl FanOutSequential {
    /// Creates a sequential fan-out broker over `outputs` with the default
    /// policy.
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
            policy: FanPolicy::default(),
            shutdown: Signaller::new(),
        })
    }

    /// Sets the dispatch policy, including how many inbound transactions may
    /// be in progress in parallel. A `max_in_flight` below one is clamped to
    /// one. Must be called before `attach`.
    #[must_use]
    pub fn with_policy(mut self, policy: FanPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl Output for FanOutSequential {
    fn attach(&self, transactions: TransactionRx) -> Result<(), Error> {
        let senders = self.senders.lock().take().ok_or(Error::AlreadyStarted)?;
        let outputs = self.outputs.clone();
        let shutdown = self.shutdown.clone();
        let max_in_flight = self.policy.max_in_flight.max(1);
        drop(tokio::spawn(run(
            transactions,
            senders,
            outputs,
            shutdown,
            max_in_flight,
        )));
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
    max_in_flight: usize,
) {
    let senders = Arc::new(senders);
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        while in_flight.len() >= max_in_flight {
            let _completed = in_flight.join_next().await;
        }
        while in_flight.try_join_next().is_some() {}

        let txn = tokio::select! {
            () = shutdown.closing() => break,
            recv = transactions.recv_async() => match recv {
                Ok(txn) => txn,
                Err(_disconnected) => break,
            },
        };

        let senders = Arc::clone(&senders);
        let task_shutdown = shutdown.clone();
        let _handle = in_flight.spawn(async move {
            dispatch_sequential(txn, &senders, &task_shutdown).await;
        });
    }

    while in_flight.join_next().await.is_some() {}
    drop(senders);
    shutdown_outputs(&outputs).await;
    shutdown.signal_closed();
}

/// Walks the outputs in index order, redelivering to the current output until
/// it succeeds before moving on. Abandons the transaction without an ack when
/// the drain request fires mid-walk.
async fn dispatch_sequential(txn: Transaction, senders: &[TransactionTx], shutdown: &Signaller) {
    let (batch, ack) = txn.into_parts();
    for (index, sender) in senders.iter().enumerate() {
        if !deliver_to_output(index, sender, batch.clone(), shutdown).await {
            return;
        }
    }
    ack.ack(Ok(()));
}
