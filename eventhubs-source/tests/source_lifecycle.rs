use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use eventhubs_source::controller::ConsumerController;
use eventhubs_source::error::{BrokerError, SourceError};
use eventhubs_source::producer::QueuedProducer;
use eventhubs_source::test_utils::{batch, NoopRebalanceListener, ScriptedBrokerClient};
use eventhubs_source::types::RawBatch;

fn producer_with_queue(
    client: ScriptedBrokerClient,
    capacity: usize,
) -> (QueuedProducer<ScriptedBrokerClient>, Receiver<RawBatch>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let producer = QueuedProducer::new(
        client,
        Arc::new(NoopRebalanceListener),
        tx,
        "hub",
        "lifecycle#1",
    )
    .with_poll_timeout(Duration::from_millis(50))
    .with_offer_timeout(Duration::from_millis(50));
    (producer, rx)
}

fn controller(client: ScriptedBrokerClient) -> ConsumerController<ScriptedBrokerClient> {
    let (producer, rx) = producer_with_queue(client, 10);
    ConsumerController::new(producer, rx, vec!["out".to_string()])
}

fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_second_start_does_not_subscribe_again() {
    let client = ScriptedBrokerClient::new();
    let stats = client.stats();
    let mut controller = controller(client);

    controller.start().unwrap();
    controller.start().unwrap();
    assert!(wait_until(Duration::from_secs(1), || stats.polls() > 0));

    controller.close(Duration::from_secs(1)).unwrap();
    assert_eq!(stats.subscriptions(), 1);
}

#[test]
fn test_full_queue_blocks_the_polling_thread_without_dropping() {
    let batches: Vec<RawBatch> = (0..11).map(|i| batch("hub", 0, &[i])).collect();
    let client = ScriptedBrokerClient::new().with_batches(batches.clone());
    let stats = client.stats();
    let (mut producer, rx) = producer_with_queue(client, 10);

    producer.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || rx.len() == 10));

    // The 11th batch was polled and is stuck in the hand-off retry loop
    thread::sleep(Duration::from_millis(200));
    assert_eq!(rx.len(), 10);
    assert_eq!(stats.polls(), 11);

    let mut received = vec![rx.recv_timeout(Duration::from_secs(1)).unwrap()];
    for _ in 0..10 {
        received.push(rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }
    producer.stop(Duration::from_secs(1)).unwrap();

    assert_eq!(received, batches);
}

#[test]
fn test_queue_never_exceeds_capacity_while_draining() {
    let batches: Vec<RawBatch> = (0..30).map(|i| batch("hub", i % 3, &[i64::from(i)])).collect();
    let client = ScriptedBrokerClient::new().with_batches(batches.clone());
    let (mut producer, rx) = producer_with_queue(client, 3);

    producer.start().unwrap();
    let mut received = Vec::with_capacity(batches.len());
    while received.len() < batches.len() {
        assert!(rx.len() <= 3, "queue grew to {}", rx.len());
        received.push(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        // Let the polling thread catch up and press against the bound
        if received.len() % 4 == 0 {
            thread::sleep(Duration::from_millis(10));
        }
    }
    producer.stop(Duration::from_secs(1)).unwrap();

    assert_eq!(received, batches);
}

#[test]
fn test_batches_are_emitted_in_poll_order() {
    let client = ScriptedBrokerClient::new()
        .with_batch(batch("hub", 0, &[1, 2]))
        .with_batch(batch("hub", 1, &[100]))
        .with_batch(batch("hub", 0, &[3]));
    let mut controller = controller(client);

    controller.start().unwrap();
    let mut emitted = Vec::new();
    while emitted.len() < 4 {
        let records = controller.poll(Duration::from_secs(1)).unwrap();
        assert!(!records.is_empty(), "expected data before the script ran out");
        emitted.extend(records);
    }
    controller.close(Duration::from_secs(1)).unwrap();

    let positions: Vec<(i32, i64)> = emitted
        .iter()
        .map(|r| (r.source_partition.partition(), r.source_offset.value()))
        .collect();
    assert_eq!(positions, vec![(0, 2), (0, 3), (1, 101), (0, 4)]);
}

#[test]
fn test_empty_poll_waits_for_the_timeout() {
    let mut controller = controller(ScriptedBrokerClient::new());
    controller.start().unwrap();

    let start = Instant::now();
    let records = controller.poll(Duration::from_millis(200)).unwrap();
    let elapsed = start.elapsed();
    controller.close(Duration::from_secs(1)).unwrap();

    assert!(records.is_empty());
    assert!(elapsed >= Duration::from_millis(150), "returned after {elapsed:?}");
}

#[test]
fn test_stop_unblocks_a_poll_stuck_in_the_broker() {
    let client = ScriptedBrokerClient::new().with_blocking_poll();
    let stats = client.stats();
    let (tx, rx) = crossbeam_channel::bounded(10);
    // Default one second poll timeout; the scripted poll ignores it anyway
    let mut producer = QueuedProducer::new(
        client,
        Arc::new(NoopRebalanceListener),
        tx,
        "hub",
        "lifecycle#2",
    );

    producer.start().unwrap();
    assert!(wait_until(Duration::from_secs(1), || stats.polls() == 1));

    let start = Instant::now();
    producer.stop(Duration::from_secs(5)).unwrap();

    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(stats.close_calls(), 1);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_thread_death_surfaces_through_controller_poll() {
    let client = ScriptedBrokerClient::new()
        .with_batch(batch("hub", 0, &[1]))
        .with_failure(BrokerError::Client("broker went away".to_string()));
    let mut controller = controller(client);

    controller.start().unwrap();

    // Data polled before the failure is still delivered
    let records = controller.poll(Duration::from_secs(1)).unwrap();
    assert_eq!(records.len(), 1);

    let failure = controller.poll(Duration::from_secs(1));
    assert!(matches!(
        failure,
        Err(SourceError::Broker(BrokerError::Client(_)))
    ));
    assert!(matches!(
        controller.poll(Duration::from_millis(10)),
        Err(SourceError::ProducerTerminated)
    ));

    controller.close(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_close_before_start_is_safe() {
    let client = ScriptedBrokerClient::new();
    let stats = client.stats();
    let mut controller = controller(client);

    controller.close(Duration::from_secs(1)).unwrap();

    assert_eq!(stats.subscriptions(), 0);
    assert_eq!(stats.polls(), 0);
}
