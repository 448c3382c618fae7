//! Cross-process channel integration tests.
//!
//! Each test spawns a child process that opens the same named channel as
//! the parent, exercising the real shared-memory rendezvous path. The
//! child is this test binary re-invoked with env-var role flags; the
//! parent filters to the same test name so the child runs exactly one
//! role function.

mod common;

use std::process::{Child, Command, Stdio};
use std::time::Duration;

use pika_core::{Channel, ChannelParameters, ChannelType, Timeout};

use common::unique_channel_name;

/// Marks a child-process invocation.
const CHILD_ENV: &str = "PIKA_IPC_CHILD";
/// Carries the channel name to the child.
const CHANNEL_ENV: &str = "PIKA_IPC_CHANNEL";

fn is_child() -> bool {
    std::env::var(CHILD_ENV).is_ok()
}

fn child_channel_name() -> String {
    std::env::var(CHANNEL_ENV).expect("PIKA_IPC_CHANNEL not set")
}

fn inter_process_params(name: &str, queue_size: u64) -> ChannelParameters {
    ChannelParameters {
        channel_name: name.to_string(),
        queue_size,
        channel_type: ChannelType::InterProcess,
        spsc_mode: false,
    }
}

fn spawn_child(test_name: &str, channel_name: &str) -> Child {
    let exe = std::env::current_exe().expect("current_exe");
    Command::new(exe)
        .args([test_name, "--exact", "--nocapture"])
        .env(CHILD_ENV, "1")
        .env(CHANNEL_ENV, channel_name)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to spawn child process")
}

/// Child role: produce a single `42` once a consumer is present.
fn child_ping_producer() {
    let params = inter_process_params(&child_channel_name(), 4);
    let producer = Channel::create_producer::<i32>(&params).expect("child: create producer");
    producer.connect().expect("child: connect");
    assert!(producer.is_connected());
    producer.send(42).expect("child: send");
}

#[test]
fn inter_process_ping() {
    if is_child() {
        child_ping_producer();
        return;
    }

    let name = unique_channel_name("ping");
    let params = inter_process_params(&name, 4);
    let consumer = Channel::create_consumer::<i32>(&params).expect("create consumer");

    let mut child = spawn_child("inter_process_ping", &name);

    consumer.connect().expect("connect");
    assert!(consumer.is_connected());

    let mut value = 0i32;
    consumer
        .receive_timeout(&mut value, Timeout::from_micros(10_000_000))
        .expect("receive");
    assert_eq!(value, 42);

    let status = child.wait().expect("child wait");
    assert!(status.success(), "child exited with {status}");
}

/// Child role: stream `1..=100` to the parent.
fn child_stream_producer() {
    let params = inter_process_params(&child_channel_name(), 8);
    let producer = Channel::create_producer::<u64>(&params).expect("child: create producer");
    producer.connect().expect("child: connect");
    for value in 1..=100u64 {
        producer.send(value).expect("child: send");
    }
}

#[test]
fn inter_process_stream_preserves_order() {
    if is_child() {
        child_stream_producer();
        return;
    }

    let name = unique_channel_name("stream");
    let params = inter_process_params(&name, 8);
    let consumer = Channel::create_consumer::<u64>(&params).expect("create consumer");

    let mut child = spawn_child("inter_process_stream_preserves_order", &name);

    for expected in 1..=100u64 {
        let value = consumer
            .recv_timeout(Timeout::from_micros(10_000_000))
            .expect("receive");
        assert_eq!(value, expected);
    }

    let status = child.wait().expect("child wait");
    assert!(status.success(), "child exited with {status}");
}

/// Child role: connect, prove liveness with one message, and exit so the
/// parent can observe the disconnect.
fn child_disconnect_producer() {
    let params = inter_process_params(&child_channel_name(), 4);
    let producer = Channel::create_producer::<i32>(&params).expect("child: create producer");
    producer.connect().expect("child: connect");
    producer.send(7).expect("child: send");
}

#[test]
fn inter_process_disconnect_is_observed() {
    if is_child() {
        child_disconnect_producer();
        return;
    }

    let name = unique_channel_name("disconnect");
    let params = inter_process_params(&name, 4);
    let consumer = Channel::create_consumer::<i32>(&params).expect("create consumer");

    let mut child = spawn_child("inter_process_disconnect_is_observed", &name);

    // The marker message proves the producer existed and connected.
    let mut value = 0i32;
    consumer
        .receive_timeout(&mut value, Timeout::from_micros(10_000_000))
        .expect("receive");
    assert_eq!(value, 7);

    let status = child.wait().expect("child wait");
    assert!(status.success(), "child exited with {status}");

    std::thread::sleep(Duration::from_millis(1));
    assert!(
        !consumer.is_connected(),
        "producer endpoint destruction must be visible to the consumer"
    );
}
