//! News Streaming Integration Tests
//!
//! Drives the real axum server with WebSocket clients while a fake broker
//! feeds payloads through the normalize-and-broadcast path.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::Message;

use common::{
    Attempt, FakeBroker, WAIT, assert_silent, fast_reconnect, next_json, start_bridge,
};
use news_broadcast_bridge::SubscriptionState;

fn news(title: &str) -> Vec<u8> {
    json!({
        "title": title,
        "abstract": "Spot volumes doubled overnight.",
        "cover": "https://cdn.example/cover.png",
        "published_at": 1_718_000_000,
        "url": format!("https://news.example/{}", title.to_lowercase().replace(' ', "-")),
        "source_name": "Example Wire",
        "type": "market",
        "sort": 7,
        "internal_score": 0.93,
    })
    .to_string()
    .into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn valid_and_passthrough_messages_reach_every_client_and_bad_ones_are_dropped() {
    let bridge = start_bridge(FakeBroker::serving(), fast_reconnect(5)).await;

    let mut a = bridge.connect().await;
    let mut b = bridge.connect().await;
    let mut c = bridge.connect().await;
    bridge.wait_for_clients(3).await;
    bridge
        .wait_for_state(|s| *s == SubscriptionState::Active)
        .await;

    bridge.broker.publish(news("BTC rallies"));
    bridge.broker.publish("this is not json");
    bridge.broker.publish(r#"{"event":"maintenance","eta_minutes":15}"#);
    bridge.broker.publish("[1,2,3]");

    for ws in [&mut a, &mut b, &mut c] {
        let first = next_json(ws).await;
        assert_eq!(first["title"], "BTC rallies");
        assert_eq!(first["abstract"], "Spot volumes doubled overnight.");
        assert_eq!(first["type"], "market");
        assert_eq!(first["published_at"], 1_718_000_000);
        assert_eq!(first["origin_url"], serde_json::Value::Null);
        assert!(first.get("internal_score").is_none());

        let second = next_json(ws).await;
        assert_eq!(second, json!({ "event": "maintenance", "eta_minutes": 15 }));

        assert_silent(ws, Duration::from_millis(150)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_client_observes_broker_order() {
    let bridge = start_bridge(FakeBroker::serving(), fast_reconnect(5)).await;

    let mut clients = vec![bridge.connect().await, bridge.connect().await];
    bridge.wait_for_clients(2).await;
    bridge
        .wait_for_state(|s| *s == SubscriptionState::Active)
        .await;

    for seq in 0..20 {
        bridge.broker.publish(json!({ "seq": seq }).to_string());
    }

    for ws in &mut clients {
        for expected in 0..20 {
            assert_eq!(next_json(ws).await["seq"], expected);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn last_client_leaving_stops_the_subscription() {
    let bridge = start_bridge(FakeBroker::serving(), fast_reconnect(5)).await;

    let mut a = bridge.connect().await;
    let mut b = bridge.connect().await;
    bridge
        .wait_for_state(|s| *s == SubscriptionState::Active)
        .await;
    assert_eq!(bridge.broker.live(), 1);

    a.close(None).await.unwrap();
    bridge.wait_for_clients(1).await;
    assert_eq!(bridge.supervisor.state(), SubscriptionState::Active);

    b.close(None).await.unwrap();
    bridge
        .wait_for_state(|s| *s == SubscriptionState::Stopped)
        .await;
    common::eventually(|| bridge.broker.live() == 0).await;
    assert!(bridge.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_connection_is_removed_and_others_keep_receiving() {
    let bridge = start_bridge(FakeBroker::serving(), fast_reconnect(5)).await;

    let mut stay = bridge.connect().await;
    let leave = bridge.connect().await;
    bridge.wait_for_clients(2).await;
    bridge
        .wait_for_state(|s| *s == SubscriptionState::Active)
        .await;

    bridge.broker.publish(json!({ "seq": 1 }).to_string());
    assert_eq!(next_json(&mut stay).await["seq"], 1);

    // No close frame; the TCP connection just goes away.
    drop(leave);
    bridge.wait_for_clients(1).await;

    bridge.broker.publish(json!({ "seq": 2 }).to_string());
    assert_eq!(next_json(&mut stay).await["seq"], 2);
    assert_eq!(bridge.supervisor.state(), SubscriptionState::Active);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clients_survive_broker_failures() {
    let broker = FakeBroker::new([Attempt::Fail, Attempt::Drop, Attempt::Fail], Attempt::Serve);
    let bridge = start_bridge(broker, fast_reconnect(5)).await;

    let mut ws = bridge.connect().await;
    bridge
        .wait_for_state(|s| *s == SubscriptionState::Active && bridge.broker.attempts() == 4)
        .await;

    assert_eq!(bridge.registry.len(), 1);
    bridge.broker.publish(json!({ "after": "recovery" }).to_string());
    assert_eq!(next_json(&mut ws).await["after"], "recovery");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inbound_frames_are_ignored_and_pings_answered() {
    let bridge = start_bridge(FakeBroker::serving(), fast_reconnect(5)).await;

    let mut ws = bridge.connect().await;
    bridge
        .wait_for_state(|s| *s == SubscriptionState::Active)
        .await;

    ws.send(Message::Text(r#"{"subscribe":"everything"}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Binary(vec![0xde, 0xad].into())).await.unwrap();
    ws.send(Message::Ping(vec![1, 2, 3].into())).await.unwrap();

    let pong = assert_ok!(tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Pong(payload))) => break payload,
                Some(Ok(Message::Text(text))) => panic!("unexpected frame: {text}"),
                Some(Ok(_)) => {}
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await);
    assert_eq!(&pong[..], &[1u8, 2, 3]);
    assert_eq!(bridge.registry.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_endpoint_reports_live_state() {
    let bridge = start_bridge(FakeBroker::serving(), fast_reconnect(5)).await;

    let _ws = bridge.connect().await;
    bridge
        .wait_for_state(|s| *s == SubscriptionState::Active)
        .await;

    let mut stream = TcpStream::connect(bridge.addr).await.unwrap();
    stream
        .write_all(b"GET /api/v1/news/status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = String::new();
    assert_ok!(tokio::time::timeout(WAIT, stream.read_to_string(&mut raw)).await);

    assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");
    let body = raw.split("\r\n\r\n").nth(1).unwrap();
    let status: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(status["code"], 0);
    assert_eq!(status["msg"], "success");
    assert_eq!(status["data"]["state"], "active");
    assert_eq!(status["data"]["clients"], 1);
    assert_eq!(status["data"]["exchange"], "xbuddy.broadcast");
}
