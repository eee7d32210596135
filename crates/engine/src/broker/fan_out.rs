// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Broadcast broker with at-least-once delivery.
//!
//! Each inbound transaction is copied to every output. The inbound ack
//! resolves to success only once every output has acknowledged its copy; a
//! failing output is redelivered to (and only to it) under the shared
//! throttle until it succeeds or the drain request fires. Outputs are served
//! concurrently, so one slow output delays only the aggregation join, never
//! the sends to its siblings.

use crate::broker::shutdown_outputs;
use crate::contract::{transaction_channel, Output, TransactionRx, TransactionTx};
use crate::error::Error;
use crate::message::Batch;
use crate::shutdown::Signaller;
use crate::throttle::Throttle;
use crate::transaction::Transaction;
use async_trait::async_trait;
use manifold_config::broker::FanPolicy;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::warn;

/// Broadcast broker: every output receives a copy of every transaction.
pub struct FanOut {
    outputs: Vec<Arc<dyn Output>>,
    senders: Mutex<Option<Vec<TransactionTx>>>,
    policy: FanPolicy,
    shutdown: Signaller,
}

impl FanOut {
    /// Creates a fan-out broker over `outputs` with the default policy,
    /// binding one fresh channel to each. Fails if any output was already
    /// started.
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
    /// be dispatched in parallel. A `max_in_flight` below one is clamped to
    /// one. Must be called before `attach`.
    #[must_use]
    pub fn with_policy(mut self, policy: FanPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl Output for FanOut {
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
            dispatch(txn, &senders, &task_shutdown).await;
        });
    }

    while in_flight.join_next().await.is_some() {}
    // All dispatch tasks are done, so this is the last sender handle; dropping
    // it closes the per-output channels.
    drop(senders);
    shutdown_outputs(&outputs).await;
    shutdown.signal_closed();
}

/// Copies one transaction to every output and aggregates the per-output acks.
/// If the drain request fires before every output succeeded, the inbound
/// transaction is abandoned without an acknowledgment.
async fn dispatch(txn: Transaction, senders: &[TransactionTx], shutdown: &Signaller) {
    let (batch, ack) = txn.into_parts();
    let deliveries = senders
        .iter()
        .enumerate()
        .map(|(index, sender)| deliver_to_output(index, sender, batch.clone(), shutdown));
    let outcomes = futures::future::join_all(deliveries).await;
    if outcomes.into_iter().all(|delivered| delivered) {
        ack.ack(Ok(()));
    }
}

/// Sends one copy to a single output and redelivers on failure until the
/// output acknowledges success or the drain request fires.
pub(super) async fn deliver_to_output(
    index: usize,
    sender: &TransactionTx,
    batch: Batch,
    shutdown: &Signaller,
) -> bool {
    let mut throttle = Throttle::new();
    loop {
        let (copy, ack_rx) = Transaction::new(batch.clone());
        tokio::select! {
            () = shutdown.closing() => return false,
            sent = sender.send_async(copy) => {
                if sent.is_err() {
                    return false;
                }
            }
        }
        let outcome = tokio::select! {
            () = shutdown.closing() => return false,
            outcome = ack_rx => outcome,
        };
        match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(err)) => {
                warn!(output = index, error = %err, "failed to dispatch fan out transaction");
            }
            Err(_dropped) => {
                warn!(output = index, "fan out ack sink dropped without a response");
            }
        }
        if !throttle.retry(shutdown.drain_token()).await {
            return false;
        }
    }
}
