// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Broker implementations: fan-out, sequential fan-out, round-robin, fan-in,
//! and the dynamic label-addressed variants.
//!
//! Every broker follows the same shape: channels to its members are created
//! at construction, the broker loop starts when the inbound stream is bound
//! (`attach` for consumers, construction for producers), and shutdown is the
//! two-phase drain from [`crate::shutdown`]. Loops never block on a single
//! channel without also selecting on the drain request.

mod dynamic_fan_in;
mod dynamic_fan_out;
mod fan_in;
mod fan_out;
mod fan_out_sequential;
mod round_robin;

pub use dynamic_fan_in::DynamicFanIn;
pub use dynamic_fan_out::DynamicFanOut;
pub use fan_in::FanIn;
pub use fan_out::FanOut;
pub use fan_out_sequential::FanOutSequential;
pub use round_robin::RoundRobin;

use crate::contract::Output;
use manifold_config::broker::FanPolicy;
use manifold_config::Label;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[cfg(test)]
mod tests;

/// Upper bound a broker waits for one downstream to finish draining during
/// its own shutdown.
pub(crate) const MAX_SHUTDOWN_WAIT: Duration = Duration::from_secs(3);

/// Callback invoked by a dynamic broker when a label is added or removed.
pub type LabelHook = Arc<dyn Fn(&Label) + Send + Sync>;

/// Construction-time options for the dynamic brokers.
#[derive(Clone, Default)]
pub struct DynamicBrokerOptions {
    /// Invoked for each label before any traffic flows through it.
    pub on_add: Option<LabelHook>,
    /// Invoked for each label after it has fully quiesced.
    pub on_remove: Option<LabelHook>,
    /// Dispatch policy, including parallelism (fan-out only).
    pub fan: FanPolicy,
}

impl DynamicBrokerOptions {
    /// Sets the add hook.
    #[must_use]
    pub fn with_on_add(mut self, hook: impl Fn(&Label) + Send + Sync + 'static) -> Self {
        self.on_add = Some(Arc::new(hook));
        self
    }

    /// Sets the remove hook.
    #[must_use]
    pub fn with_on_remove(mut self, hook: impl Fn(&Label) + Send + Sync + 'static) -> Self {
        self.on_remove = Some(Arc::new(hook));
        self
    }

    /// Sets the dispatch policy. A `max_in_flight` below one is clamped to
    /// one.
    #[must_use]
    pub fn with_fan_policy(mut self, policy: FanPolicy) -> Self {
        self.fan = policy;
        self
    }

    pub(crate) fn effective_max_in_flight(&self) -> usize {
        self.fan.max_in_flight.max(1)
    }

    pub(crate) fn added(&self, label: &Label) {
        if let Some(hook) = &self.on_add {
            hook(label);
        }
    }

    pub(crate) fn removed(&self, label: &Label) {
        if let Some(hook) = &self.on_remove {
            hook(label);
        }
    }
}

impl fmt::Debug for DynamicBrokerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicBrokerOptions")
            .field("on_add", &self.on_add.is_some())
            .field("on_remove", &self.on_remove.is_some())
            .field("fan", &self.fan)
            .finish()
    }
}

/// Cascades closure to a set of downstream outputs after a broker's own drain
/// has completed: request the drain everywhere first, then wait for each.
pub(crate) async fn shutdown_outputs(outputs: &[Arc<dyn Output>]) {
    for output in outputs {
        output.close_at_leisure();
    }
    for (index, output) in outputs.iter().enumerate() {
        if let Err(err) = output.wait_closed(MAX_SHUTDOWN_WAIT).await {
            warn!(output = index, error = %err, "output did not close within the shutdown window");
        }
    }
}
