mod common;

use std::time::Duration;

use common::{collect_transport_until, mock_opener, odrive_port, MOCK_PORT};
use odrive_control_lib::config::SerialSettings;
use odrive_control_lib::serial::{LinkState, SerialError, SerialInterface, TransportEvent};
use pretty_assertions::assert_eq;

fn attempts_in(events: &[TransportEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            TransportEvent::ReconnectAttempt { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_six_unexpected_closes_exhaust_the_budget() {
    let (opener, mut devices) = mock_opener(vec![odrive_port()]);
    let (interface, mut events) = SerialInterface::spawn(opener.clone(), SerialSettings::default());

    interface.connect(MOCK_PORT).await.unwrap();
    assert!(matches!(events.recv().await, Some(TransportEvent::Connected(_))));

    // drop the controller end of every link as soon as it opens
    let mut seen = Vec::new();
    for _ in 0..6 {
        drop(devices.recv().await.unwrap());
        seen.extend(
            collect_transport_until(&mut events, |e| {
                matches!(e, TransportEvent::Connected(_) | TransportEvent::ReconnectExhausted { .. })
            })
            .await,
        );
    }

    assert_eq!(attempts_in(&seen), vec![1, 2, 3, 4, 5]);
    assert_eq!(seen.last(), Some(&TransportEvent::ReconnectExhausted { attempts: 5 }));
    let unexpected = seen
        .iter()
        .filter(|e| matches!(e, TransportEvent::Disconnected { unexpected: true, .. }))
        .count();
    assert_eq!(unexpected, 6);
    assert_eq!(opener.open_count(), 6, "Initial open plus five reconnects");

    let connection = interface.connection();
    assert_eq!(connection.state, LinkState::Closed);
    assert_eq!(connection.reconnect_attempts, 5);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(opener.open_count(), 6, "No attempt may follow exhaustion");
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_failing_reopens_exhaust_the_budget() {
    let (opener, mut devices) = mock_opener(vec![odrive_port()]);
    let (interface, mut events) = SerialInterface::spawn(opener.clone(), SerialSettings::default());

    interface.connect(MOCK_PORT).await.unwrap();
    opener.set_failing(true);
    let started = tokio::time::Instant::now();
    drop(devices.recv().await.unwrap());

    let seen = collect_transport_until(&mut events, |e| matches!(e, TransportEvent::ReconnectExhausted { .. })).await;

    assert_eq!(attempts_in(&seen), vec![1, 2, 3, 4, 5]);
    let failures = seen.iter().filter(|e| matches!(e, TransportEvent::ReconnectFailed { .. })).count();
    assert_eq!(failures, 5);
    assert!(started.elapsed() >= Duration::from_secs(5), "Attempts are spaced by the reconnect delay");
    assert_eq!(interface.connection().state, LinkState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_disconnect_never_reconnects() {
    let (opener, mut devices) = mock_opener(vec![odrive_port()]);
    let (interface, mut events) = SerialInterface::spawn(opener.clone(), SerialSettings::default());

    interface.connect(MOCK_PORT).await.unwrap();
    let _device = devices.recv().await.unwrap();
    interface.disconnect().await;

    let seen = collect_transport_until(&mut events, |e| matches!(e, TransportEvent::Disconnected { .. })).await;
    assert_eq!(
        seen.last(),
        Some(&TransportEvent::Disconnected { port: MOCK_PORT.to_string(), unexpected: false })
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(opener.open_count(), 1);
    assert_eq!(interface.connection().state, LinkState::Closed);

    // idempotent
    interface.disconnect().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_failed_explicit_connect_does_not_schedule_retry() {
    let (opener, _devices) = mock_opener(vec![odrive_port()]);
    opener.set_failing(true);
    let (interface, mut events) = SerialInterface::spawn(opener.clone(), SerialSettings::default());

    assert!(interface.connect(MOCK_PORT).await.is_err());
    assert!(matches!(events.recv().await, Some(TransportEvent::Error(_))));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(opener.open_count(), 1);
    assert_eq!(interface.connection().state, LinkState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_stable_link_resets_attempt_counter() {
    let (opener, mut devices) = mock_opener(vec![odrive_port()]);
    let (interface, mut events) = SerialInterface::spawn(opener.clone(), SerialSettings::default());

    interface.connect(MOCK_PORT).await.unwrap();
    assert!(matches!(events.recv().await, Some(TransportEvent::Connected(_))));
    drop(devices.recv().await.unwrap());

    let first = collect_transport_until(&mut events, |e| matches!(e, TransportEvent::Connected(_))).await;
    assert_eq!(attempts_in(&first), vec![1]);

    // keep the reconnected link up past the stability window
    let device = devices.recv().await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    drop(device);

    let second = collect_transport_until(&mut events, |e| matches!(e, TransportEvent::Connected(_))).await;
    assert_eq!(attempts_in(&second), vec![1], "A stable link should restore the full budget");
}

#[tokio::test(start_paused = true)]
async fn test_stalled_write_counts_as_link_loss() {
    let (opener, mut devices) = mock_opener(vec![odrive_port()]);
    let (interface, mut events) = SerialInterface::spawn(opener.clone(), SerialSettings::default());

    interface.connect(MOCK_PORT).await.unwrap();
    assert!(matches!(events.recv().await, Some(TransportEvent::Connected(_))));
    // kept open, never read: the write fills the link and stalls
    let _stalled = devices.recv().await.unwrap();

    let started = tokio::time::Instant::now();
    let result = interface.send(&[b'x'; 8192]).await;
    assert!(matches!(result, Err(SerialError::Timeout)), "Got {:?}", result);
    assert!(started.elapsed() >= Duration::from_secs(2), "The write timeout should be honoured");

    let seen = collect_transport_until(&mut events, |e| matches!(e, TransportEvent::Connected(_))).await;
    assert!(
        seen.iter().any(|e| matches!(e, TransportEvent::Disconnected { unexpected: true, .. })),
        "Got {:?}",
        seen
    );
    assert_eq!(attempts_in(&seen), vec![1]);
    assert_eq!(opener.open_count(), 2);
}

#[tokio::test]
async fn test_send_requires_an_open_link() {
    let (opener, _devices) = mock_opener(vec![odrive_port()]);
    let (interface, _events) = SerialInterface::spawn(opener, SerialSettings::default());

    let result = interface.send(b"r vbus_voltage\n").await;
    assert!(result.is_err());
    assert!(!interface.is_connected());
}
