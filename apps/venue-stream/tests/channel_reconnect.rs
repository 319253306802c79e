//! Channel Session Integration Tests
//!
//! Drives a single session against a loopback venue: reconnect signals,
//! terminal failure, subscription replay and consumer backpressure.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Bytes;
use tokio_util::sync::CancellationToken;
use venue_stream::infrastructure::venue::{
    ChannelConfig, ChannelSession, Dialer, DialerConfig, SessionError,
};
use venue_stream::{ChannelKind, RestartCause, RestartSignal, SessionStatus, SubscribeRequest};

use common::{MockVenue, wait_until};

struct Harness {
    session: Arc<ChannelSession>,
    frames: mpsc::Receiver<Bytes>,
    restarts: mpsc::UnboundedReceiver<RestartSignal>,
    runner: JoinHandle<Result<(), SessionError>>,
}

async fn connected_session(venue: &MockVenue, capacity: usize, max_retries: u32) -> Harness {
    connected_session_with(venue, capacity, max_retries, Duration::from_millis(10)).await
}

async fn connected_session_with(
    venue: &MockVenue,
    capacity: usize,
    max_retries: u32,
    reconnect_unit: Duration,
) -> Harness {
    let (tx, frames) = mpsc::channel(capacity);
    let (restart_tx, restarts) = mpsc::unbounded_channel();

    let mut config = ChannelConfig::new(ChannelKind::Public, venue.url("/ws"), max_retries);
    config.dial_retry = config.dial_retry.with_unit(Duration::from_millis(10));
    config.reconnect_retry = config.reconnect_retry.with_unit(reconnect_unit);

    let session = Arc::new(ChannelSession::new(
        config,
        Dialer::new(DialerConfig::default()).unwrap(),
        tx,
        restart_tx,
        CancellationToken::new(),
    ));

    let source = session.connect().await.unwrap();
    let runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run(source).await })
    };

    Harness {
        session,
        frames,
        restarts,
        runner,
    }
}

async fn next_signal(restarts: &mut mpsc::UnboundedReceiver<RestartSignal>) -> RestartSignal {
    timeout(Duration::from_secs(5), restarts.recv())
        .await
        .expect("timed out waiting for a restart signal")
        .unwrap()
}

fn request_json(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap()
}

#[tokio::test]
async fn one_restart_signal_per_reconnect() {
    let venue = MockVenue::start().await;
    let mut h = connected_session(&venue, 16, 5).await;
    venue.wait_for_upgrades(1).await;

    for cycle in 1..=2 {
        venue.drop_connections();
        let signal = next_signal(&mut h.restarts).await;
        assert_eq!(signal.channel, ChannelKind::Public);
        assert_eq!(signal.cause, RestartCause::Reconnect);
        venue.wait_for_upgrades(cycle + 1).await;
        assert_eq!(h.session.status(), SessionStatus::Connected);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.restarts.try_recv().is_err(), "no extra signals expected");

    venue.push(r#"{"u":42}"#);
    let frame = timeout(Duration::from_secs(5), h.frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&frame[..], br#"{"u":42}"#);

    h.session.stop();
    h.runner.await.unwrap().unwrap();
    assert_eq!(h.session.status(), SessionStatus::Disconnected);
}

#[tokio::test]
async fn exhausted_reconnect_is_terminal() {
    let venue = MockVenue::start().await;
    let mut h = connected_session(&venue, 16, 2).await;
    venue.wait_for_upgrades(1).await;

    venue.reject_all();
    venue.drop_connections();

    let result = timeout(Duration::from_secs(5), h.runner).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(SessionError::RetriesExhausted {
            channel: ChannelKind::Public,
            attempts: 3,
            ..
        })
    ));
    assert_eq!(h.session.status(), SessionStatus::Failed);
    assert!(h.restarts.try_recv().is_err());

    // One initial connection plus three failed redials, then silence.
    let accepts = venue.accepts();
    assert_eq!(accepts, 4);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(venue.accepts(), accepts);
}

#[tokio::test]
async fn replay_preserves_order_without_duplicates() {
    let mut venue = MockVenue::start().await;
    let mut h = connected_session(&venue, 16, 5).await;
    venue.wait_for_upgrades(1).await;

    for stream in ["btcusdt@bookTicker", "ethusdt@bookTicker", "btcusdt@aggTrade"] {
        h.session
            .write(SubscribeRequest::subscribe([stream]))
            .await
            .unwrap();
    }
    for _ in 0..3 {
        assert_eq!(venue.next_received().await.connection, 0);
    }

    venue.drop_connections();
    next_signal(&mut h.restarts).await;

    let mut replayed = Vec::new();
    for _ in 0..3 {
        let frame = venue.next_received().await;
        assert_eq!(frame.connection, 1);
        replayed.push(request_json(&frame.text));
    }

    let params: Vec<_> = replayed.iter().map(|r| r["params"][0].clone()).collect();
    assert_eq!(
        params,
        ["btcusdt@bookTicker", "ethusdt@bookTicker", "btcusdt@aggTrade"]
    );
    let ids: Vec<_> = replayed.iter().map(|r| r["id"].as_u64().unwrap()).collect();
    assert_eq!(ids, [1, 2, 3]);

    // Replays are not recorded again.
    assert_eq!(h.session.subscriptions().len(), 3);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(venue.drain_received().is_empty());

    h.session.stop();
    h.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn writes_during_reconnect_follow_the_replay() {
    let mut venue = MockVenue::start().await;
    let mut h = connected_session(&venue, 16, 10).await;
    venue.wait_for_upgrades(1).await;

    h.session
        .write(SubscribeRequest::subscribe(["btcusdt@bookTicker"]))
        .await
        .unwrap();
    venue.next_received().await;

    venue.reject_next(2);
    venue.drop_connections();

    // A rejected redial means the reconnect holds the connection lock.
    venue.wait_for_accepts(2).await;
    let writers: Vec<_> = ["ethusdt@bookTicker", "solusdt@bookTicker"]
        .into_iter()
        .map(|stream| {
            let session = Arc::clone(&h.session);
            tokio::spawn(async move { session.write(SubscribeRequest::subscribe([stream])).await })
        })
        .collect();

    next_signal(&mut h.restarts).await;
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    let mut on_new_connection = Vec::new();
    for _ in 0..3 {
        let frame = venue.next_received().await;
        assert_eq!(frame.connection, 1);
        on_new_connection.push(request_json(&frame.text)["params"][0].clone());
    }

    assert_eq!(on_new_connection[0], "btcusdt@bookTicker");
    assert!(on_new_connection[1..].contains(&"ethusdt@bookTicker".into()));
    assert!(on_new_connection[1..].contains(&"solusdt@bookTicker".into()));
    assert_eq!(h.session.subscriptions().len(), 3);

    h.session.stop();
    h.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn full_queue_blocks_without_dropping_or_reconnecting() {
    let venue = MockVenue::start().await;
    let mut h = connected_session(&venue, 1, 5).await;
    venue.wait_for_upgrades(1).await;

    for n in 1..=5 {
        venue.push(&format!(r#"{{"u":{n}}}"#));
    }

    // Consumer idle: the session waits instead of dropping frames.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.session.status(), SessionStatus::Connected);
    assert!(h.restarts.try_recv().is_err());

    for n in 1..=5 {
        let frame = timeout(Duration::from_secs(5), h.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Bytes::from(format!(r#"{{"u":{n}}}"#)));
    }

    h.session.stop();
    h.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_interrupts_blocked_delivery() {
    let venue = MockVenue::start().await;
    let h = connected_session(&venue, 1, 5).await;
    venue.wait_for_upgrades(1).await;

    venue.push(r#"{"u":1}"#);
    venue.push(r#"{"u":2}"#);
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.session.stop();
    timeout(Duration::from_secs(2), h.runner)
        .await
        .expect("stop should unblock the read loop")
        .unwrap()
        .unwrap();
    assert_eq!(h.session.status(), SessionStatus::Disconnected);
    assert_eq!(venue.upgrades(), 1);
}

#[tokio::test]
async fn external_request_reconnects_once() {
    let venue = MockVenue::start().await;
    let mut h = connected_session(&venue, 16, 5).await;
    venue.wait_for_upgrades(1).await;

    h.session.request_reconnect();
    let signal = next_signal(&mut h.restarts).await;
    assert_eq!(signal.cause, RestartCause::Reconnect);

    wait_until(|| venue.upgrades() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(venue.upgrades(), 2);

    h.session.stop();
    h.runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn request_during_reconnect_is_absorbed() {
    let venue = MockVenue::start().await;
    let mut h = connected_session_with(&venue, 16, 5, Duration::from_millis(200)).await;
    venue.wait_for_upgrades(1).await;

    venue.reject_next(2);
    venue.drop_connections();
    venue.wait_for_accepts(2).await;

    // Lands while the session is backing off between failed dials.
    h.session.request_reconnect();

    let signal = next_signal(&mut h.restarts).await;
    assert_eq!(signal.cause, RestartCause::Reconnect);
    venue.wait_for_upgrades(2).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(venue.upgrades(), 2);
    assert!(h.restarts.try_recv().is_err(), "request was served by the running reconnect");
    assert_eq!(h.session.status(), SessionStatus::Connected);

    h.session.stop();
    h.runner.await.unwrap().unwrap();
}
