// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Core payload types flowing through the broker core.
//!
//! A [`Part`] is one payload plus its metadata; a [`Batch`] is the ordered
//! unit of transaction. Both are cheap to reference-copy: payload bytes are
//! shared (`bytes::Bytes`) and metadata maps are shared behind an `Arc` with
//! copy-on-write mutation. Brokers clone batches freely during fan-out;
//! mutations always produce new parts, so a copy handed to one output can
//! never be observed changing by another.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// One payload inside a batch, with its own string metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    data: Bytes,
    metadata: Arc<HashMap<String, String>>,
}

impl Part {
    /// Creates a part from raw payload bytes with empty metadata.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: Arc::new(HashMap::new()),
        }
    }

    /// Returns the payload bytes.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Returns the payload as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the metadata value stored under `key`, if any.
    #[must_use]
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Returns the full metadata mapping.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Returns a new part with the payload replaced.
    #[must_use]
    pub fn with_data(&self, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: Arc::clone(&self.metadata),
        }
    }

    /// Returns a new part with one metadata entry added or replaced.
    ///
    /// The metadata map is copied only when it is shared with other parts.
    #[must_use]
    pub fn with_meta(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut part = self.clone();
        let metadata = Arc::make_mut(&mut part.metadata);
        let _previous = metadata.insert(key.into(), value.into());
        part
    }
}

/// An ordered sequence of parts processed as one unit.
///
/// An empty batch is legal everywhere in the core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    parts: Vec<Part>,
}

impl Batch {
    /// Creates a batch from parts.
    #[must_use]
    pub fn new(parts: Vec<Part>) -> Self {
        Self { parts }
    }

    /// Creates an empty batch.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a batch from raw payloads, one part per payload.
    pub fn from_payloads<I>(payloads: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        Self {
            parts: payloads.into_iter().map(Part::new).collect(),
        }
    }

    /// Number of parts in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether the batch holds no parts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Returns the part at `index`, if present.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Part> {
        self.parts.get(index)
    }

    /// Iterates over the parts in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Part> {
        self.parts.iter()
    }

    /// Returns the parts as a slice.
    #[must_use]
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }
}

impl FromIterator<Part> for Batch {
    fn from_iter<I: IntoIterator<Item = Part>>(iter: I) -> Self {
        Self {
            parts: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Part;
    type IntoIter = std::slice::Iter<'a, Part>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.iter()
    }
}
