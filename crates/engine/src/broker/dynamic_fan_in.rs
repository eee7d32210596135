// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Merge broker with runtime membership.
//!
//! Like [`FanIn`](crate::broker::FanIn), but inputs are held in a label map
//! that can be mutated while traffic flows. All map mutations travel over a
//! request channel into the manager loop, so the map has a single owner and
//! the traffic path never takes a lock. Each input is served by a dedicated
//! forwarder task that signals its exit through a per-label done token; a
//! removal waits on that token up to the caller's timeout and keeps the label
//! when the wait fails, so the map never lies about liveness.

use crate::broker::DynamicBrokerOptions;
use crate::contract::{transaction_channel, Input, TransactionRx, TransactionTx};
use crate::error::Error;
use crate::shutdown::Signaller;
use async_trait::async_trait;
use manifold_config::Label;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// One second between attempts while draining stragglers at shutdown.
const SHUTDOWN_DRAIN_RETRY: Duration = Duration::from_secs(1);

struct InputChange {
    label: Label,
    input: Option<Arc<dyn Input>>,
    timeout: Duration,
    reply: oneshot::Sender<Result<(), Error>>,
}

struct Member {
    input: Arc<dyn Input>,
    done: CancellationToken,
}

/// Merge broker whose inputs are added and removed by label at runtime.
pub struct DynamicFanIn {
    merged: TransactionRx,
    requests: flume::Sender<InputChange>,
    shutdown: Signaller,
}

impl DynamicFanIn {
    /// Creates a dynamic fan-in broker seeded with `initial` inputs.
    #[must_use]
    pub fn new(
        initial: Vec<(Label, Arc<dyn Input>)>,
        options: DynamicBrokerOptions,
    ) -> Self {
        let (merged_tx, merged_rx) = transaction_channel();
        let (request_tx, request_rx) = flume::bounded(0);
        let shutdown = Signaller::new();

        let manager = Manager {
            members: HashMap::new(),
            merged: merged_tx,
            exits: flume::unbounded(),
            options,
            shutdown: shutdown.clone(),
        };
        drop(tokio::spawn(manager.run(initial, request_rx)));

        Self {
            merged: merged_rx,
            requests: request_tx,
            shutdown,
        }
    }

    /// Adds, replaces or removes the input under `label`.
    ///
    /// A `Some` input with a new label adds it; with an existing label the old
    /// input is drained first (up to `timeout`) and replaced only once it has
    /// quiesced. `None` removes the label. Returns [`Error::Timeout`] when the
    /// old input does not quiesce in time (the label is kept), and
    /// [`Error::Closed`] when the broker is draining.
    pub async fn set_input(
        &self,
        label: Label,
        input: Option<Arc<dyn Input>>,
        timeout: Duration,
    ) -> Result<(), Error> {
        if self.shutdown.is_closing() {
            return Err(Error::Closed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let change = InputChange {
            label,
            input,
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
        reply_rx.await.map_err(|_manager_gone| Error::Closed)?
    }
}

#[async_trait]
impl Input for DynamicFanIn {
    fn transactions(&self) -> TransactionRx {
        self.merged.clone()
    }

    fn connected(&self) -> bool {
        // Membership changes under the caller's feet, so a per-member probe
        // would be stale by the time it returns.
        true
    }

    fn close_at_leisure(&self) {
        self.shutdown.close_at_leisure();
    }

    async fn wait_closed(&self, timeout: Duration) -> Result<(), Error> {
        self.shutdown.wait_closed(timeout).await
    }
}

struct Manager {
    members: HashMap<Label, Member>,
    merged: TransactionTx,
    exits: (flume::Sender<Label>, flume::Receiver<Label>),
    options: DynamicBrokerOptions,
    shutdown: Signaller,
}

impl Manager {
    async fn run(
        mut self,
        initial: Vec<(Label, Arc<dyn Input>)>,
        requests: flume::Receiver<InputChange>,
    ) {
        for (label, input) in initial {
            self.add_member(label, input);
        }

        loop {
            tokio::select! {
                () = self.shutdown.closing() => break,
                request = requests.recv_async() => match request {
                    Ok(change) => self.apply(change).await,
                    Err(_disconnected) => break,
                },
                exited = self.exits.1.recv_async() => {
                    if let Ok(label) = exited {
                        self.reap(&label);
                    }
                }
            }
        }

        self.drain_all().await;
        // Forwarders are all gone; dropping the last sender closes the merged
        // stream for downstream consumers.
        drop(self.merged);
        self.shutdown.signal_closed();
    }

    async fn apply(&mut self, change: InputChange) {
        let mut result = Ok(());
        if self.members.contains_key(&change.label) {
            result = self.remove_member(&change.label, change.timeout).await;
            if let Err(err) = &result {
                error!(label = %change.label, error = %err, "failed to stop old copy of dynamic input");
            }
        }
        if result.is_ok() {
            if let Some(input) = change.input {
                self.add_member(change.label.clone(), input);
            }
        }
        let _caller_gone = change.reply.send(result);
    }

    fn add_member(&mut self, label: Label, input: Arc<dyn Input>) {
        let done = CancellationToken::new();
        let source = input.transactions();
        let sink = self.merged.clone();
        let exit_tx = self.exits.0.clone();
        let forwarder_done = done.clone();
        let forwarder_label = label.clone();
        drop(tokio::spawn(async move {
            forward(source, sink).await;
            forwarder_done.cancel();
            let _manager_gone = exit_tx.send(forwarder_label);
        }));

        debug!(label = %label, "started dynamic input");
        self.options.added(&label);
        let _previous = self.members.insert(label, Member { input, done });
    }

    /// Drains the input under `label` and removes it once its forwarder has
    /// exited. On timeout the member stays in the map.
    async fn remove_member(&mut self, label: &Label, timeout: Duration) -> Result<(), Error> {
        let Some(member) = self.members.get(label) else {
            return Ok(());
        };
        member.input.close_at_leisure();
        let done = member.done.clone();
        if tokio::time::timeout(timeout, done.cancelled()).await.is_err() {
            return Err(Error::Timeout);
        }

        let _member = self.members.remove(label);
        debug!(label = %label, "stopped dynamic input");
        self.options.removed(label);
        Ok(())
    }

    /// Handles a forwarder that exited on its own because its input closed.
    fn reap(&mut self, label: &Label) {
        if self.members.remove(label).is_some() {
            debug!(label = %label, "dynamic input closed its stream");
            self.options.removed(label);
        }
    }

    async fn drain_all(&mut self) {
        for member in self.members.values() {
            member.input.close_at_leisure();
        }
        let labels: Vec<Label> = self.members.keys().cloned().collect();
        for label in labels {
            while self.remove_member(&label, SHUTDOWN_DRAIN_RETRY).await.is_err() {
                debug!(label = %label, "still waiting for dynamic input to quiesce");
            }
        }
    }
}

async fn forward(source: TransactionRx, sink: TransactionTx) {
    loop {
        let txn = match source.recv_async().await {
            Ok(txn) => txn,
            Err(_closed) => return,
        };
        if sink.send_async(txn).await.is_err() {
            return;
        }
    }
}
