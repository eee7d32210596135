// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Stream-routing broker core.
//!
//! The engine multiplexes inbound transaction streams onto downstream
//! consumers under several routing policies while preserving at-least-once
//! delivery, per-transaction acknowledgment, and backpressure:
//!
//! - [`FanOut`] / [`FanOutSequential`]: broadcast with ack aggregation,
//!   concurrent or strictly ordered across outputs.
//! - [`RoundRobin`]: one output per transaction, cyclic cursor.
//! - [`FanIn`] / [`DynamicFanIn`]: merge many inputs into one stream, with
//!   fixed or runtime-mutable membership.
//! - [`DynamicFanOut`]: broadcast over a label map mutable while traffic
//!   flows.
//! - [`Retry`]: exponential-backoff redelivery over a single output.
//! - [`Switch`]: predicate-routed fan-out with per-part batch errors.
//!
//! Everything is built from one abstraction: the [`Transaction`], a payload
//! batch paired with a single-use acknowledgment sink. Producers push
//! transactions into a broker, the broker dispatches copies downstream, and
//! exactly one aggregated acknowledgment flows back per accepted transaction.
//!
//! The crate emits `tracing` events and never installs a global subscriber;
//! binaries and tests own subscriber initialization.

mod backoff;
mod broker;
mod contract;
mod error;
mod message;
mod retry;
mod shutdown;
mod switch;
mod throttle;
mod transaction;

#[cfg(test)]
mod testutil;

pub use broker::{
    DynamicBrokerOptions, DynamicFanIn, DynamicFanOut, FanIn, FanOut, FanOutSequential, LabelHook,
    RoundRobin,
};
pub use contract::{transaction_channel, Input, Output, TransactionRx, TransactionTx};
pub use error::{BatchError, BatchErrorWire, Error, IndexedError};
pub use message::{Batch, Part};
pub use retry::Retry;
pub use shutdown::Signaller;
pub use switch::{CaseCheck, Switch, SwitchCase};
pub use transaction::{AckOutcome, AckReceiver, AckSender, Transaction};
