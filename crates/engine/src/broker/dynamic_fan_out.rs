// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Broadcast broker with runtime membership.
//!
//! FanOut semantics over a label-addressed output map mutable while traffic
//! flows. Mutations travel over a request channel into the broker loop, which
//! is the map's single owner; the dispatch path works from an immutable
//! snapshot taken once per inbound transaction, so membership changes never
//! race the hot path. Each label carries a cancellation token derived from
//! the broker's drain token: removing or replacing a label cancels the
//! redelivery loops still in flight for it, which unblocks the old output's
//! drain instead of letting doomed retries hold it open.

use crate::broker::{DynamicBrokerOptions, MAX_SHUTDOWN_WAIT};
use crate::contract::{transaction_channel, Output, TransactionRx, TransactionTx};
use crate::error::Error;
use crate::message::Batch;
use crate::shutdown::Signaller;
use crate::throttle::Throttle;
use crate::transaction::Transaction;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use manifold_config::Label;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

struct OutputChange {
    label: Label,
    output: Option<Arc<dyn Output>>,
    timeout: Duration,
    reply: oneshot::Sender<Result<(), Error>>,
}

struct Member {
    output: Arc<dyn Output>,
    sender: TransactionTx,
    cancel: CancellationToken,
}

/// Dispatch view of one member, immutable once snapshotted.
struct Target {
    label: Label,
    output: Arc<dyn Output>,
    sender: TransactionTx,
    cancel: CancellationToken,
}

/// Broadcast broker whose outputs are added and removed by label at runtime.
pub struct DynamicFanOut {
    state: Mutex<Option<LoopState>>,
    requests: flume::Sender<OutputChange>,
    snapshot: Arc<ArcSwap<Vec<Arc<Target>>>>,
    shutdown: Signaller,
}

struct LoopState {
    members: HashMap<Label, Member>,
    requests: flume::Receiver<OutputChange>,
    snapshot: Arc<ArcSwap<Vec<Arc<Target>>>>,
    options: DynamicBrokerOptions,
    shutdown: Signaller,
}

impl DynamicFanOut {
    /// Creates a dynamic fan-out broker seeded with `initial` outputs.
    ///
    /// Fails if any initial output was already started. The broker loop
    /// starts on `attach`; `set_output` calls made before then block until
    /// the loop is running.
    pub fn new(
        initial: Vec<(Label, Arc<dyn Output>)>,
        options: DynamicBrokerOptions,
    ) -> Result<Self, Error> {
        let shutdown = Signaller::new();
        let snapshot = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let (request_tx, request_rx) = flume::bounded(0);

        let mut state = LoopState {
            members: HashMap::new(),
            requests: request_rx,
            snapshot: Arc::clone(&snapshot),
            options,
            shutdown: shutdown.clone(),
        };
        for (label, output) in initial {
            state.add_member(label, output)?;
        }

        Ok(Self {
            state: Mutex::new(Some(state)),
            requests: request_tx,
            snapshot,
            shutdown,
        })
    }

    /// Adds, replaces or removes the output under `label`.
    ///
    /// A `Some` output with a new label adds it. With an existing label the
    /// old output is removed first: its in-flight redeliveries are cancelled,
    /// it is drained up to `timeout`, and only then does the new output start.
    /// On timeout neither change takes effect and the label stays claimed.
    /// `None` removes the label. Returns [`Error::Closed`] when the broker is
    /// draining.
    pub async fn set_output(
        &self,
        label: Label,
        output: Option<Arc<dyn Output>>,
        timeout: Duration,
    ) -> Result<(), Error> {
        if self.shutdown.is_closing() {
            return Err(Error::Closed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let change = OutputChange {
            label,
            output,
            timeout,
            reply: reply_tx,
        };
        tokio::select! {
            () = self.shutdown.closing() => return Err(Error::Closed),
            sent = self.requests.send_async(change) => {
                if sent.is_err() {
                    return Err(Error::Closed);
                }
            }
        }
        reply_rx.await.map_err(|_loop_gone| Error::Closed)?
    }
}

#[async_trait]
impl Output for DynamicFanOut {
    fn attach(&self, transactions: TransactionRx) -> Result<(), Error> {
        let state = self.state.lock().take().ok_or(Error::AlreadyStarted)?;
        drop(tokio::spawn(state.run(transactions)));
        Ok(())
    }

    fn connected(&self) -> bool {
        self.snapshot
            .load()
            .iter()
            .all(|target| target.output.connected())
    }

    fn close_at_leisure(&self) {
        self.shutdown.close_at_leisure();
    }

    async fn wait_closed(&self, timeout: Duration) -> Result<(), Error> {
        self.shutdown.wait_closed(timeout).await
    }
}

impl LoopState {
    async fn run(mut self, transactions: TransactionRx) {
        let max_in_flight = self.options.effective_max_in_flight();
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            while in_flight.len() >= max_in_flight {
                let _completed = in_flight.join_next().await;
            }
            while in_flight.try_join_next().is_some() {}

            tokio::select! {
                () = self.shutdown.closing() => break,
                request = self.requests.recv_async() => match request {
                    Ok(change) => self.apply(change).await,
                    Err(_disconnected) => break,
                },
                recv = transactions.recv_async(), if !self.members.is_empty() => {
                    let txn = match recv {
                        Ok(txn) => txn,
                        Err(_disconnected) => break,
                    };
                    let targets = self.snapshot.load_full();
                    let shutdown = self.shutdown.clone();
                    let _handle = in_flight.spawn(async move {
                        dispatch(txn, &targets, &shutdown).await;
                    });
                }
            }
        }

        while in_flight.join_next().await.is_some() {}
        self.drain_all().await;
        self.shutdown.signal_closed();
    }

    async fn apply(&mut self, change: OutputChange) {
        let mut result = Ok(());
        if self.members.contains_key(&change.label) {
            result = self.remove_member(&change.label, change.timeout).await;
            if let Err(err) = &result {
                error!(label = %change.label, error = %err, "failed to stop old copy of dynamic output");
            }
        }
        if result.is_ok() {
            if let Some(output) = change.output {
                result = self.add_member(change.label, output);
            }
        }
        let _caller_gone = change.reply.send(result);
    }

    fn add_member(&mut self, label: Label, output: Arc<dyn Output>) -> Result<(), Error> {
        let (sender, receiver) = transaction_channel();
        output.attach(receiver)?;
        let member = Member {
            output,
            sender,
            cancel: self.shutdown.drain_token().child_token(),
        };
        debug!(label = %label, "started dynamic output");
        self.options.added(&label);
        let _previous = self.members.insert(label, member);
        self.rebuild_snapshot();
        Ok(())
    }

    /// Drains the output under `label`: cancel its in-flight redeliveries,
    /// close its channel, and wait for its drain. On timeout the label stays
    /// claimed in the map, so a later call must drain it again before the
    /// label can be reused.
    async fn remove_member(&mut self, label: &Label, timeout: Duration) -> Result<(), Error> {
        let Some(member) = self.members.get_mut(label) else {
            return Ok(());
        };
        member.cancel.cancel();
        let (sender, receiver) = transaction_channel();
        // Swap in a dead channel so dropping the old sender closes the
        // output's inbound stream; the replacement receiver is discarded.
        drop(std::mem::replace(&mut member.sender, sender));
        drop(receiver);
        member.output.close_at_leisure();

        let output = Arc::clone(&member.output);
        if output.wait_closed(timeout).await.is_err() {
            // Still draining: the label stays claimed so it cannot be reused
            // until the old output has truly quiesced.
            return Err(Error::Timeout);
        }

        let _member = self.members.remove(label);
        self.rebuild_snapshot();
        debug!(label = %label, "stopped dynamic output");
        self.options.removed(label);
        Ok(())
    }

    fn rebuild_snapshot(&self) {
        let targets: Vec<Arc<Target>> = self
            .members
            .iter()
            .map(|(label, member)| {
                Arc::new(Target {
                    label: label.clone(),
                    output: Arc::clone(&member.output),
                    sender: member.sender.clone(),
                    cancel: member.cancel.clone(),
                })
            })
            .collect();
        self.snapshot.store(Arc::new(targets));
    }

    /// Closes every remaining output at shutdown. This is closure, not
    /// removal: the remove hooks do not run for members that were still
    /// present when the broker itself closed.
    async fn drain_all(&mut self) {
        let members = std::mem::take(&mut self.members);
        self.snapshot.store(Arc::new(Vec::new()));
        for member in members.values() {
            member.output.close_at_leisure();
        }
        for (label, member) in members {
            drop(member.sender);
            if let Err(err) = member.output.wait_closed(MAX_SHUTDOWN_WAIT).await {
                warn!(label = %label, error = %err, "dynamic output did not close within the shutdown window");
            }
        }
    }
}

enum Delivery {
    /// The output acknowledged success.
    Acked,
    /// The output left the broadcast set (label removed or stream gone).
    Halted,
    /// The broker drain request fired mid-delivery.
    Abandoned,
}

/// Copies one transaction to every snapshotted member and aggregates acks.
/// Members that leave the set mid-flight are excluded from the aggregate; a
/// drain request abandons the transaction without an ack.
async fn dispatch(txn: Transaction, targets: &[Arc<Target>], shutdown: &Signaller) {
    let (batch, ack) = txn.into_parts();
    let deliveries = targets
        .iter()
        .map(|target| deliver_to_target(target, batch.clone(), shutdown));
    let outcomes = futures::future::join_all(deliveries).await;
    if outcomes
        .iter()
        .all(|outcome| !matches!(outcome, Delivery::Abandoned))
    {
        ack.ack(Ok(()));
    }
}

async fn deliver_to_target(target: &Target, batch: Batch, shutdown: &Signaller) -> Delivery {
    let mut throttle = Throttle::new();
    loop {
        let (copy, ack_rx) = Transaction::new(batch.clone());
        tokio::select! {
            () = target.cancel.cancelled() => return halted_or_abandoned(shutdown),
            sent = target.sender.send_async(copy) => {
                if sent.is_err() {
                    return Delivery::Halted;
                }
            }
        }
        let outcome = tokio::select! {
            () = target.cancel.cancelled() => return halted_or_abandoned(shutdown),
            outcome = ack_rx => outcome,
        };
        match outcome {
            Ok(Ok(())) => return Delivery::Acked,
            Ok(Err(err)) => {
                warn!(label = %target.label, error = %err, "failed to dispatch fan out transaction");
            }
            Err(_dropped) => {
                warn!(label = %target.label, "fan out ack sink dropped without a response");
            }
        }
        if !throttle.retry(&target.cancel).await {
            return halted_or_abandoned(shutdown);
        }
    }
}

fn halted_or_abandoned(shutdown: &Signaller) -> Delivery {
    if shutdown.is_closing() {
        Delivery::Abandoned
    } else {
        Delivery::Halted
    }
}
