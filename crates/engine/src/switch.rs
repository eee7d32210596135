// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Routed fan-out with per-part predicates.
//!
//! Each case carries an optional predicate over a message part, a child
//! output, and a continue flag. Parts are routed to the first matching case
//! (and, for cases that declare continue, to later matching cases as well);
//! the group of parts routed to one case forms a sub-batch sent as a single
//! transaction. Acknowledgments aggregate across the cases used: success only
//! when every sub-batch succeeded, otherwise a batch error whose part indices
//! are mapped back to the original batch.
//!
//! Parts that match nothing are silently dropped, or under strict mode become
//! indexed errors. A predicate that fails to evaluate behaves as a non-match;
//! under strict mode the predicate's error text tags the affected part.

use crate::broker::shutdown_outputs;
use crate::contract::{transaction_channel, Output, TransactionRx, TransactionTx};
use crate::error::{BatchError, Error};
use crate::message::{Batch, Part};
use crate::shutdown::Signaller;
use crate::throttle::Throttle;
use crate::transaction::Transaction;
use async_trait::async_trait;
use manifold_config::broker::SwitchPolicy;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Predicate evaluated against one part. An `Err` behaves as a non-match and
/// its text surfaces in strict-mode part errors.
pub type CaseCheck = Box<dyn Fn(&Part) -> Result<bool, Error> + Send + Sync>;

/// One switch route: predicate, child output, continue flag.
pub struct SwitchCase {
    check: Option<CaseCheck>,
    output: Arc<dyn Output>,
    continue_matching: bool,
}

impl SwitchCase {
    /// Creates a case routing parts that satisfy `check` to `output`. A
    /// `None` check matches every part (a default case).
    pub fn new(output: Arc<dyn Output>, check: Option<CaseCheck>) -> Self {
        Self {
            check,
            output,
            continue_matching: false,
        }
    }

    /// Keeps evaluating later cases for a part even after this case matched.
    #[must_use]
    pub fn with_continue(mut self, continue_matching: bool) -> Self {
        self.continue_matching = continue_matching;
        self
    }
}

struct Route {
    check: Option<CaseCheck>,
    continue_matching: bool,
}

struct LoopState {
    routes: Vec<Route>,
    senders: Vec<TransactionTx>,
}

/// Routed fan-out output with predicate-selected cases.
pub struct Switch {
    outputs: Vec<Arc<dyn Output>>,
    state: Mutex<Option<LoopState>>,
    policy: SwitchPolicy,
    max_in_flight: usize,
    shutdown: Signaller,
}

impl Switch {
    /// Creates a switch over `cases`, binding one fresh channel per case
    /// output. Case order is routing order.
    pub fn new(cases: Vec<SwitchCase>, policy: SwitchPolicy) -> Result<Self, Error> {
        let mut outputs = Vec::with_capacity(cases.len());
        let mut routes = Vec::with_capacity(cases.len());
        let mut senders = Vec::with_capacity(cases.len());
        for case in cases {
            let (tx, rx) = transaction_channel();
            case.output.attach(rx)?;
            outputs.push(case.output);
            senders.push(tx);
            routes.push(Route {
                check: case.check,
                continue_matching: case.continue_matching,
            });
        }
        Ok(Self {
            outputs,
            state: Mutex::new(Some(LoopState { routes, senders })),
            policy,
            max_in_flight: 1,
            shutdown: Signaller::new(),
        })
    }

    /// Sets how many inbound transactions may be routed in parallel. Values
    /// below one are clamped to one. Must be called before `attach`.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }
}

#[async_trait]
impl Output for Switch {
    fn attach(&self, transactions: TransactionRx) -> Result<(), Error> {
        let state = self.state.lock().take().ok_or(Error::AlreadyStarted)?;
        let outputs = self.outputs.clone();
        let shutdown = self.shutdown.clone();
        let policy = self.policy;
        let max_in_flight = self.max_in_flight;
        drop(tokio::spawn(run(
            transactions,
            state,
            outputs,
            policy,
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
    state: LoopState,
    outputs: Vec<Arc<dyn Output>>,
    policy: SwitchPolicy,
    shutdown: Signaller,
    max_in_flight: usize,
) {
    let routes = Arc::new(state.routes);
    let senders = Arc::new(state.senders);
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

        let routes = Arc::clone(&routes);
        let senders = Arc::clone(&senders);
        let task_shutdown = shutdown.clone();
        let _handle = in_flight.spawn(async move {
            dispatch(txn, &routes, &senders, policy, &task_shutdown).await;
        });
    }

    while in_flight.join_next().await.is_some() {}
    drop(senders);
    shutdown_outputs(&outputs).await;
    shutdown.signal_closed();
}

#[derive(Default)]
struct Group {
    /// Original batch indices of the parts routed to this case, in order.
    indices: Vec<usize>,
    parts: Vec<Part>,
}

/// Routes one batch through the cases, sends the per-case sub-batches, and
/// aggregates their acks back onto the inbound sink.
async fn dispatch(
    txn: Transaction,
    routes: &[Route],
    senders: &[TransactionTx],
    policy: SwitchPolicy,
    shutdown: &Signaller,
) {
    let (batch, ack) = txn.into_parts();

    let mut groups: Vec<Group> = (0..routes.len()).map(|_| Group::default()).collect();
    let mut unrouted: Vec<(usize, String)> = Vec::new();

    for (index, part) in batch.iter().enumerate() {
        let mut matched = false;
        let mut check_failure: Option<String> = None;
        for (case, route) in routes.iter().enumerate() {
            let hit = match &route.check {
                None => true,
                Some(check) => match check(part) {
                    Ok(hit) => hit,
                    Err(err) => {
                        let _first = check_failure.get_or_insert_with(|| err.to_string());
                        false
                    }
                },
            };
            if hit {
                matched = true;
                groups[case].indices.push(index);
                groups[case].parts.push(part.clone());
                if !route.continue_matching {
                    break;
                }
            }
        }
        if !matched {
            match (policy.strict_mode, check_failure) {
                (true, failure) => unrouted.push((
                    index,
                    failure.unwrap_or_else(|| "no switch cases matched".to_owned()),
                )),
                (false, Some(failure)) => {
                    debug!(part = index, error = %failure, "switch predicate failed, dropping part");
                }
                (false, None) => {}
            }
        }
    }

    let live: Vec<(usize, Group)> = groups
        .into_iter()
        .enumerate()
        .filter(|(_, group)| !group.parts.is_empty())
        .collect();

    let deliveries = live.iter().map(|(case, group)| {
        deliver_group(
            *case,
            &senders[*case],
            Batch::new(group.parts.clone()),
            policy.retry_until_success,
            shutdown,
        )
    });
    let results = futures::future::join_all(deliveries).await;

    if results.iter().any(Option::is_none) {
        // Drain request fired mid-delivery; the transaction is abandoned.
        return;
    }

    let mut failures: Vec<(usize, Error)> = Vec::new();
    for ((case, _), result) in live.iter().zip(results) {
        if let Some(Err(err)) = result {
            failures.push((*case, err));
        }
    }

    if failures.is_empty() && unrouted.is_empty() {
        ack.ack(Ok(()));
        return;
    }

    let outer_reason = failures
        .first()
        .map(|(_, err)| err.to_string())
        .or_else(|| unrouted.first().map(|(_, reason)| reason.clone()))
        .unwrap_or_else(|| "switch routing failed".to_owned());
    let mut batch_err = BatchError::new(batch, outer_reason);
    for (index, reason) in unrouted {
        batch_err.fail(index, reason);
    }
    for (case, err) in failures {
        let group = live
            .iter()
            .find(|(live_case, _)| *live_case == case)
            .map(|(_, group)| group);
        let Some(group) = group else { continue };
        match err {
            Error::Batch(sub_err) => {
                // Map sub-batch indices back onto the original batch.
                for (sub_index, reason) in sub_err.iter_failed() {
                    if let Some(&original) = group.indices.get(sub_index) {
                        batch_err.fail(original, reason);
                    }
                }
            }
            other => {
                for &original in &group.indices {
                    batch_err.fail(original, other.to_string());
                }
            }
        }
    }
    ack.ack(Err(Error::Batch(batch_err)));
}

/// Sends one sub-batch to a case output. Returns `None` when the drain
/// request interrupted the delivery, `Some(result)` otherwise.
async fn deliver_group(
    case: usize,
    sender: &TransactionTx,
    sub_batch: Batch,
    retry_until_success: bool,
    shutdown: &Signaller,
) -> Option<Result<(), Error>> {
    let mut throttle = Throttle::new();
    loop {
        let (copy, ack_rx) = Transaction::new(sub_batch.clone());
        tokio::select! {
            () = shutdown.closing() => return None,
            sent = sender.send_async(copy) => {
                if sent.is_err() {
                    return None;
                }
            }
        }
        let outcome = tokio::select! {
            () = shutdown.closing() => return None,
            outcome = ack_rx => outcome,
        };
        let err = match outcome {
            Ok(Ok(())) => return Some(Ok(())),
            Ok(Err(err)) => err,
            Err(_dropped) => Error::nacked("delivery dropped without a response"),
        };
        if !retry_until_success {
            return Some(Err(err));
        }
        warn!(case, error = %err, "switch case delivery failed, retrying");
        if !throttle.retry(shutdown.drain_token()).await {
            return None;
        }
    }
}
