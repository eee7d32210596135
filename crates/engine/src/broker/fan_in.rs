// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Static merge broker.
//!
//! Joins a fixed set of inputs into one outbound transaction stream. Each
//! input is served by a dedicated forwarder task, so per-input ordering is
//! preserved; no ordering holds across inputs. The merged channel closes once
//! every forwarder has exited, which happens when every input has closed its
//! own stream.

use crate::contract::{transaction_channel, Input, TransactionRx};
use crate::error::Error;
use crate::shutdown::Signaller;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Merge broker over a fixed set of inputs.
pub struct FanIn {
    inputs: Vec<Arc<dyn Input>>,
    merged: TransactionRx,
    shutdown: Signaller,
}

impl FanIn {
    /// Creates a fan-in broker and starts one forwarder per input.
    pub fn new(inputs: Vec<Arc<dyn Input>>) -> Result<Self, Error> {
        let (merged_tx, merged_rx) = transaction_channel();

        let mut forwarders: JoinSet<()> = JoinSet::new();
        for input in &inputs {
            let source = input.transactions();
            let sink = merged_tx.clone();
            let _handle = forwarders.spawn(async move {
                loop {
                    let txn = match source.recv_async().await {
                        Ok(txn) => txn,
                        Err(_closed) => return,
                    };
                    if sink.send_async(txn).await.is_err() {
                        return;
                    }
                }
            });
        }
        drop(merged_tx);

        let shutdown = Signaller::new();
        let completion = shutdown.clone();
        drop(tokio::spawn(async move {
            while forwarders.join_next().await.is_some() {}
            completion.signal_closed();
        }));

        Ok(Self {
            inputs,
            merged: merged_rx,
            shutdown,
        })
    }
}

#[async_trait]
impl Input for FanIn {
    fn transactions(&self) -> TransactionRx {
        self.merged.clone()
    }

    fn connected(&self) -> bool {
        self.inputs.iter().all(|input| input.connected())
    }

    fn close_at_leisure(&self) {
        for input in &self.inputs {
            input.close_at_leisure();
        }
    }

    async fn wait_closed(&self, timeout: Duration) -> Result<(), Error> {
        self.shutdown.wait_closed(timeout).await
    }
}
