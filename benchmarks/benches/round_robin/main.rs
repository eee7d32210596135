// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

//! Benchmarks for the round-robin broker compared to direct channel sends.
//!
//! Scenarios:
//! - round-robin over N pass-through outputs (cursor + ack pass-through)
//! - direct rotation over N raw flume channels (the floor without a broker)

#![allow(missing_docs)]

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use manifold_engine::{
    transaction_channel, Batch, Error, Output, RoundRobin, Transaction, TransactionRx,
};
use std::hint::black_box;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(not(windows))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

const MSG_COUNT: usize = 10_000;
const OUTPUT_COUNT: usize = 3;

/// Output that acks every delivery successfully from a background task.
#[derive(Default)]
struct AckingOutput {
    stream: Mutex<Option<TransactionRx>>,
}

#[async_trait::async_trait]
impl Output for AckingOutput {
    fn attach(&self, transactions: TransactionRx) -> Result<(), Error> {
        let mut slot = self.stream.lock().expect("bench lock should not poison");
        if slot.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let consumer = transactions.clone();
        *slot = Some(transactions);
        drop(tokio::spawn(async move {
            while let Ok(txn) = consumer.recv_async().await {
                txn.ack(Ok(()));
            }
        }));
        Ok(())
    }

    fn close_at_leisure(&self) {}

    async fn wait_closed(&self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }
}

async fn run_round_robin(msg_count: usize) {
    let outputs: Vec<Arc<dyn Output>> = (0..OUTPUT_COUNT)
        .map(|_| Arc::new(AckingOutput::default()) as Arc<dyn Output>)
        .collect();
    let broker = RoundRobin::new(outputs).expect("round robin should start");
    let (tx, rx) = transaction_channel();
    broker.attach(rx).expect("attach should succeed");

    for i in 0..msg_count {
        let (txn, ack_rx) = Transaction::new(Batch::from_payloads([format!("hello world {i}")]));
        tx.send_async(txn).await.expect("broker should accept");
        let outcome = ack_rx.await.expect("ack should arrive");
        _ = black_box(outcome);
    }

    drop(tx);
    broker
        .wait_closed(Duration::from_secs(5))
        .await
        .expect("broker should close");
}

async fn run_raw_rotation(msg_count: usize) {
    let mut senders = Vec::with_capacity(OUTPUT_COUNT);
    let mut consumers = Vec::with_capacity(OUTPUT_COUNT);
    for _ in 0..OUTPUT_COUNT {
        let (tx, rx) = flume::bounded::<Batch>(0);
        senders.push(tx);
        consumers.push(tokio::spawn(async move {
            let mut total = 0usize;
            while let Ok(batch) = rx.recv_async().await {
                total += batch.len();
            }
            _ = black_box(total);
        }));
    }

    for i in 0..msg_count {
        senders[i % OUTPUT_COUNT]
            .send_async(Batch::from_payloads([format!("hello world {i}")]))
            .await
            .expect("receiver should remain open");
    }
    drop(senders);
    for consumer in consumers {
        consumer.await.expect("consumer task should complete");
    }
}

fn round_robin_benches(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime should build");

    let mut group = c.benchmark_group("round_robin");
    group.throughput(Throughput::Elements(MSG_COUNT as u64));
    group.bench_function("broker_3_outputs", |b| {
        b.to_async(&runtime).iter(|| run_round_robin(MSG_COUNT));
    });
    group.bench_function("raw_channel_rotation", |b| {
        b.to_async(&runtime).iter(|| run_raw_rotation(MSG_COUNT));
    });
    group.finish();
}

criterion_group!(benches, round_robin_benches);
criterion_main!(benches);
