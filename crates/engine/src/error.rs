// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors produced by the broker core.
//!
//! [`Error`] covers both the structural control-path failures (duplicate
//! attach, draining broker, timed-out wait) and the acknowledgment values that
//! travel through transaction sinks. [`BatchError`] is the partial-failure
//! carrier: it keeps the original batch together with a sparse index→reason
//! mapping so that callers can tell delivered parts from failed ones.

use crate::message::{Batch, Part};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Errors produced by broker operations and acknowledgments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Downstream component is not yet connected to its target.
    #[error("not connected to target source or sink")]
    NotConnected,

    /// A bounded wait elapsed before the operation completed.
    #[error("action timed out")]
    Timeout,

    /// A consumer was attached to an inbound channel twice.
    #[error("component has already been started")]
    AlreadyStarted,

    /// The operation was attempted on a broker that is draining or closed.
    #[error("component was closed")]
    Closed,

    /// The retry budget was exhausted without a successful delivery.
    #[error("transaction failed to reach a target destination")]
    SendFailed,

    /// Partial failure with per-part reasons.
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// Unclassified failure reported by a downstream component.
    #[error("{reason}")]
    Nacked {
        /// Failure text as reported downstream.
        reason: String,
    },
}

impl Error {
    /// Builds an unclassified downstream failure.
    pub fn nacked(reason: impl Into<String>) -> Self {
        Self::Nacked {
            reason: reason.into(),
        }
    }
}

/// Partial-failure acknowledgment carrying per-index part errors.
///
/// Indices refer to the batch as seen by the failing stage. Parts with no
/// recorded error are considered delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct BatchError {
    reason: String,
    batch: Batch,
    failed: BTreeMap<usize, String>,
}

impl BatchError {
    /// Creates a batch error with an outer failure reason and no per-part
    /// entries yet.
    pub fn new(batch: Batch, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            batch,
            failed: BTreeMap::new(),
        }
    }

    /// Records a failure for the part at `index`.
    pub fn fail(&mut self, index: usize, reason: impl Into<String>) {
        let _previous = self.failed.insert(index, reason.into());
    }

    /// The batch this error refers to.
    #[must_use]
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Number of parts with a recorded failure.
    #[must_use]
    pub fn indexed_errors(&self) -> usize {
        self.failed.len()
    }

    /// The failure recorded for `index`, if any.
    #[must_use]
    pub fn error_at(&self, index: usize) -> Option<&str> {
        self.failed.get(&index).map(String::as_str)
    }

    /// Walks every part of the batch in order with its recorded failure.
    pub fn iter_parts(&self) -> impl Iterator<Item = (usize, &Part, Option<&str>)> {
        self.batch
            .iter()
            .enumerate()
            .map(|(index, part)| (index, part, self.error_at(index)))
    }

    /// Iterates over the failed entries only, in index order.
    pub fn iter_failed(&self) -> impl Iterator<Item = (usize, &str)> {
        self.failed
            .iter()
            .map(|(index, reason)| (*index, reason.as_str()))
    }

    /// Returns the serializable wire view of this error.
    #[must_use]
    pub fn to_wire(&self) -> BatchErrorWire {
        BatchErrorWire {
            message: self.reason.clone(),
            parts: self
                .failed
                .iter()
                .map(|(index, reason)| IndexedError {
                    index: *index,
                    message: reason.clone(),
                })
                .collect(),
        }
    }
}

/// Wire layout of a batch error: an outer message plus indexed part errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchErrorWire {
    /// Outer failure message.
    pub message: String,
    /// Per-part failures, 0-based, in index order.
    pub parts: Vec<IndexedError>,
}

/// One failed part in the wire layout of a batch error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedError {
    /// Index into the batch as seen by the failing stage.
    pub index: usize,
    /// Failure message for this part.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_not_present_mean_success() {
        let batch = Batch::from_payloads(["a", "b", "c"]);
        let mut err = BatchError::new(batch, "boom");
        err.fail(1, "meow");

        assert_eq!(err.indexed_errors(), 1);
        assert_eq!(err.error_at(0), None);
        assert_eq!(err.error_at(1), Some("meow"));

        let states: Vec<_> = err
            .iter_parts()
            .map(|(index, _, failure)| (index, failure.is_some()))
            .collect();
        assert_eq!(states, vec![(0, false), (1, true), (2, false)]);
    }

    #[test]
    fn displays_outer_reason() {
        let err = BatchError::new(Batch::empty(), "test");
        assert_eq!(err.to_string(), "test");
        assert_eq!(Error::from(err).to_string(), "test");
    }

    #[test]
    fn wire_layout_serializes_indexed_entries() {
        let mut err = BatchError::new(Batch::from_payloads(["a", "b"]), "partial failure");
        err.fail(1, "meow");

        let encoded = serde_json::to_value(err.to_wire()).expect("wire view should serialize");
        assert_eq!(
            encoded,
            serde_json::json!({
                "message": "partial failure",
                "parts": [{"index": 1, "message": "meow"}],
            })
        );
    }
}
