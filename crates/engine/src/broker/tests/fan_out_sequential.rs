// Copyright The Manifold Authors
// SPDX-License-Identifier: Apache-2.0

use crate::broker::FanOutSequential;
use crate::contract::{transaction_channel, Output};
use crate::error::Error;
use crate::testutil::{expect_ack, send_payload, MockOutput, TEST_WAIT};
use manifold_config::broker::FanPolicy;
use std::sync::Arc;

fn sequential_over(n: usize) -> (FanOutSequential, Vec<Arc<MockOutput>>) {
    let mocks: Vec<Arc<MockOutput>> = (0..n).map(|_| MockOutput::new()).collect();
    let outputs: Vec<Arc<dyn Output>> = mocks
        .iter()
        .map(|mock| Arc::clone(mock) as Arc<dyn Output>)
        .collect();
    let broker = FanOutSequential::new(outputs).expect("sequential fan out should start");
    (broker, mocks)
}

/// Scenario:
/// 1. Given a sequential fan-out broker over three outputs.
/// 2. When a transaction is sent.
/// 3. Then output `i + 1` receives its copy only after output `i` has acked
///    success, and the producer is acked once all three have.
#[tokio::test]
async fn proceeds_strictly_in_output_order() {
    let (broker, mocks) = sequential_over(3);
    let (tx, rx) = transaction_channel();
    broker.attach(rx).expect("attach should succeed");

    let ack_rx = send_payload(&tx, "hello world").await;

    let first = mocks[0].recv().await;
    assert!(
        mocks[1].stream().is_empty() && mocks[2].stream().is_empty(),
        "later outputs must not be attempted before the first ack"
    );
    first.ack(Ok(()));

    let second = mocks[1].recv().await;
    assert!(
        mocks[2].stream().is_empty(),
        "the final output must wait for the second ack"
    );
    second.ack(Ok(()));

    mocks[2].recv().await.ack(Ok(()));
    expect_ack(ack_rx).await.expect("broker should ack success");

    broker.close_at_leisure();
    broker
        .wait_closed(TEST_WAIT)
        .await
        .expect("broker should close");
}

/// Scenario:
/// 1. Given a sequential fan-out broker over two outputs.
/// 2. When the first output fails its initial delivery and then succeeds.
/// 3. Then the second output is attempted only after the redelivery
///    succeeded, and the producer sees one success ack.
#[tokio::test]
async fn retries_an_output_before_moving_on() {
    let (broker, mocks) = sequential_over(2);
    let (tx, rx) = transaction_channel();
    broker.attach(rx).expect("attach should succeed");

    let ack_rx = send_payload(&tx, "hello world").await;

    mocks[0].recv().await.ack(Err(Error::nacked("boom")));
    assert!(
        mocks[1].stream().is_empty(),
        "a failed first output must hold back the second"
    );

    mocks[0].recv().await.ack(Ok(()));
    mocks[1].recv().await.ack(Ok(()));
    expect_ack(ack_rx).await.expect("broker should ack success");

    broker.close_at_leisure();
    broker
        .wait_closed(TEST_WAIT)
        .await
        .expect("broker should close");
}

/// Scenario:
/// 1. Given a sequential broker with a max-in-flight policy of two.
/// 2. When two transactions are sent back to back.
/// 3. Then both proceed through the output list concurrently, each in its own
///    strict order.
#[tokio::test]
async fn runs_transactions_in_parallel_when_allowed() {
    let (broker, mocks) = sequential_over(2);
    let broker = broker.with_policy(FanPolicy { max_in_flight: 2 });
    let (tx, rx) = transaction_channel();
    broker.attach(rx).expect("attach should succeed");

    let ack_one = send_payload(&tx, "one").await;
    let ack_two = send_payload(&tx, "two").await;

    // Both transactions are waiting on the first output.
    mocks[0].recv().await.ack(Ok(()));
    mocks[0].recv().await.ack(Ok(()));
    mocks[1].recv().await.ack(Ok(()));
    mocks[1].recv().await.ack(Ok(()));

    expect_ack(ack_one).await.expect("first ack should arrive");
    expect_ack(ack_two).await.expect("second ack should arrive");

    broker.close_at_leisure();
    broker
        .wait_closed(TEST_WAIT)
        .await
        .expect("broker should close");
}

#[tokio::test]
async fn rejects_a_second_attach() {
    let (broker, _mocks) = sequential_over(1);
    let (_tx, rx) = transaction_channel();
    broker.attach(rx).expect("first attach should succeed");

    let (_tx2, rx2) = transaction_channel();
    assert_eq!(broker.attach(rx2), Err(Error::AlreadyStarted));
}
