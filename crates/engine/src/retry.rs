// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Exponential-backoff retry wrapper over a single output.
//!
//! Forwards inbound transactions to the wrapped output; on a failure ack the
//! same batch is resent with a fresh ack sink under the configured backoff
//! policy until it succeeds, the budget runs out, or the drain request fires.
//! Exhausting the budget acknowledges a terminal send-failed error upstream.
//!
//! While any transaction is inside its retry loop the wrapper does not
//! consume new inbound transactions: a counter of retrying transactions
//! suspends the intake side, so the producer experiences backpressure rather
//! than unbounded buffering. Retry completion pokes an interrupt so intake
//! resumes promptly; a periodic re-check covers a missed poke.

use crate::backoff::Backoff;
use crate::contract::{transaction_channel, Output, TransactionRx, TransactionTx};
use crate::error::Error;
use crate::message::Batch;
use crate::shutdown::Signaller;
use crate::transaction::{AckSender, Transaction};
use async_trait::async_trait;
use manifold_config::retry::RetryPolicy;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, warn};

/// Interval between intake re-checks while waiting out a retry loop.
const RETRY_RECHECK: Duration = Duration::from_millis(100);

/// Output wrapper that retries failed deliveries with exponential backoff.
pub struct Retry {
    wrapped: Arc<dyn Output>,
    sender: Mutex<Option<TransactionTx>>,
    policy: RetryPolicy,
    shutdown: Signaller,
}

impl Retry {
    /// Wraps `output`, binding a fresh channel to it.
    pub fn new(output: Arc<dyn Output>, policy: RetryPolicy) -> Result<Self, Error> {
        let (tx, rx) = transaction_channel();
        output.attach(rx)?;
        Ok(Self {
            wrapped: output,
            sender: Mutex::new(Some(tx)),
            policy,
            shutdown: Signaller::new(),
        })
    }
}

#[async_trait]
impl Output for Retry {
    fn attach(&self, transactions: TransactionRx) -> Result<(), Error> {
        let sender = self.sender.lock().take().ok_or(Error::AlreadyStarted)?;
        let wrapped = Arc::clone(&self.wrapped);
        let shutdown = self.shutdown.clone();
        let policy = self.policy.clone();
        drop(tokio::spawn(run(
            transactions,
            sender,
            wrapped,
            policy,
            shutdown,
        )));
        Ok(())
    }

    fn connected(&self) -> bool {
        self.wrapped.connected()
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
    sender: TransactionTx,
    wrapped: Arc<dyn Output>,
    policy: RetryPolicy,
    shutdown: Signaller,
) {
    let retrying = Arc::new(AtomicI64::new(0));
    let interrupt = Arc::new(Notify::new());
    let mut monitors: JoinSet<()> = JoinSet::new();

    'intake: loop {
        // Suspend intake while pending transactions are being reattempted.
        while retrying.load(Ordering::Acquire) > 0 {
            tokio::select! {
                () = interrupt.notified() => {}
                () = tokio::time::sleep(RETRY_RECHECK) => {}
                () = shutdown.closing() => break 'intake,
            }
        }
        while monitors.try_join_next().is_some() {}

        let txn = tokio::select! {
            () = shutdown.closing() => break,
            recv = transactions.recv_async() => match recv {
                Ok(txn) => txn,
                Err(_disconnected) => break,
            },
        };
        let (batch, upstream) = txn.into_parts();

        let (copy, ack_rx) = Transaction::new(batch.clone());
        tokio::select! {
            () = shutdown.closing() => break,
            sent = sender.send_async(copy) => {
                if sent.is_err() {
                    break;
                }
            }
        }

        let monitor = MonitorState {
            sender: sender.clone(),
            policy: policy.clone(),
            shutdown: shutdown.clone(),
            retrying: Arc::clone(&retrying),
            interrupt: Arc::clone(&interrupt),
        };
        let _handle = monitors.spawn(monitor.watch(batch, upstream, ack_rx));
    }

    while monitors.join_next().await.is_some() {}
    drop(sender);
    wrapped.close_at_leisure();
    if let Err(err) = wrapped.wait_closed(crate::broker::MAX_SHUTDOWN_WAIT).await {
        warn!(error = %err, "wrapped output did not close within the shutdown window");
    }
    shutdown.signal_closed();
}

struct MonitorState {
    sender: TransactionTx,
    policy: RetryPolicy,
    shutdown: Signaller,
    retrying: Arc<AtomicI64>,
    interrupt: Arc<Notify>,
}

impl MonitorState {
    /// Follows one transaction's acks through the wrapped output, resending
    /// with backoff on failure until success, budget exhaustion, or close.
    async fn watch(
        self,
        batch: Batch,
        upstream: AckSender,
        mut ack_rx: tokio::sync::oneshot::Receiver<Result<(), Error>>,
    ) {
        let mut backoff: Option<Backoff> = None;
        let mut in_err_loop = false;

        let outcome = loop {
            let ack = tokio::select! {
                () = self.shutdown.closing() => break None,
                ack = &mut ack_rx => ack,
            };
            let err = match ack {
                Ok(Ok(())) => break Some(Ok(())),
                Ok(Err(err)) => err,
                Err(_dropped) => Error::nacked("delivery dropped without a response"),
            };

            if !in_err_loop {
                in_err_loop = true;
                let _count = self.retrying.fetch_add(1, Ordering::AcqRel);
            }

            let next = backoff
                .get_or_insert_with(|| Backoff::new(self.policy.clone()))
                .next();
            let Some(wait) = next else {
                error!(error = %err, "failed to send transaction, retry budget exhausted");
                break Some(Err(Error::SendFailed));
            };
            warn!(error = %err, wait_ms = wait.as_millis() as u64, "failed to send transaction, retrying");

            tokio::select! {
                () = self.shutdown.closing() => break None,
                () = tokio::time::sleep(wait) => {}
            }

            let (copy, next_rx) = Transaction::new(batch.clone());
            tokio::select! {
                () = self.shutdown.closing() => break None,
                sent = self.sender.send_async(copy) => {
                    if sent.is_err() {
                        break None;
                    }
                }
            }
            ack_rx = next_rx;
        };

        if in_err_loop {
            let _count = self.retrying.fetch_sub(1, Ordering::AcqRel);
            self.interrupt.notify_one();
        }
        if let Some(outcome) = outcome {
            upstream.ack(outcome);
        }
    }
}
