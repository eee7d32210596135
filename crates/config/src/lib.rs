// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Validated names and policy types shared across the manifold workspace.
//!
//! This crate holds the configuration surface of the broker core: the `Label`
//! type used to identify dynamic broker members, and the policy structs that
//! are injected into brokers at construction time. Loading these from files
//! and validating full pipeline documents happens outside the core.

pub mod broker;
pub mod retry;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Maximum accepted length for a [`Label`], in bytes.
pub const MAX_LABEL_LEN: usize = 128;

/// Error returned when parsing an invalid [`Label`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid label `{raw}`: {reason}")]
pub struct InvalidLabel {
    /// The rejected input.
    pub raw: String,
    /// Why the input was rejected.
    pub reason: &'static str,
}

/// Identifier for a dynamic broker member (an input or output slot).
///
/// Labels are non-empty, at most [`MAX_LABEL_LEN`] bytes, and restricted to
/// alphanumerics plus `-`, `_` and `.`. They are cheap to clone (`Arc<str>`)
/// and usable as map keys with `&str` lookups via `Borrow<str>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(Arc<str>);

impl Label {
    /// Parses and validates a label.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, InvalidLabel> {
        let raw = raw.as_ref();
        if raw.is_empty() {
            return Err(InvalidLabel {
                raw: raw.to_owned(),
                reason: "label must not be empty",
            });
        }
        if raw.len() > MAX_LABEL_LEN {
            return Err(InvalidLabel {
                raw: raw.to_owned(),
                reason: "label exceeds maximum length",
            });
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(InvalidLabel {
                raw: raw.to_owned(),
                reason: "label contains characters outside [a-zA-Z0-9._-]",
            });
        }
        Ok(Self(Arc::from(raw)))
    }

    /// Returns the label as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Label {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Label {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Label {
    type Error = InvalidLabel;

    fn try_from(raw: &str) -> Result<Self, Self::Error> {
        Self::parse(raw)
    }
}

impl Serialize for Label {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl JsonSchema for Label {
    fn schema_name() -> String {
        "Label".to_owned()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}
