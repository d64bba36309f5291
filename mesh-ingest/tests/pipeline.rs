use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use assert_json_diff::assert_json_include;
use chrono::Utc;
use envconfig::Envconfig;
use futures::StreamExt;
use httpmock::prelude::*;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use mesh_common::config::EnvMsDuration;
use mesh_common::time::ManualClock;
use mesh_ingest::config::DedupConfig;
use mesh_ingest::dedup::Deduplicator;
use mesh_ingest::live::LiveHub;
use mesh_ingest::router::router;
use mesh_ingest::sink::Distributor;
use mesh_ingest::subscriber::TopicRouter;
use mesh_worker::config::WebhookConfig;
use mesh_worker::delivery::DeliveryOutcome;
use mesh_worker::relay::WebhookRelay;

use crate::common::*;
mod common;

fn advertisement(gateway: &str) -> (String, Vec<u8>) {
    (
        format!("meshcore/{gateway}/event/advertisement"),
        json!({"public_key": NODE, "adv_name": "Hilltop", "adv_type": 2})
            .to_string()
            .into_bytes(),
    )
}

#[tokio::test]
async fn it_merges_relays_and_broadcasts_sightings() {
    let webhooks = MockServer::start();
    let sightings_hook = webhooks.mock(|when, then| {
        when.method(POST)
            .path("/events")
            .header("X-Webhook-Secret", "hunter2")
            .json_body_partial(r#"{"event_type": "advertisement"}"#);
        then.status(200);
    });
    let messages_hook = webhooks.mock(|when, then| {
        when.method(POST)
            .path("/messages")
            .json_body_partial(r#"{"event_type": "channel_msg_recv"}"#);
        then.status(200);
    });

    let webhook_config = WebhookConfig::init_from_hashmap(&HashMap::from([
        ("WEBHOOK_EVENTS_URL".to_owned(), webhooks.url("/events")),
        ("WEBHOOK_EVENTS_SECRET".to_owned(), "hunter2".to_owned()),
        ("WEBHOOK_MESSAGE_URL".to_owned(), webhooks.url("/messages")),
    ]))
    .unwrap();
    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let relay = Arc::new(WebhookRelay::with_reports(&webhook_config, reports_tx).unwrap());

    let store = Arc::new(mesh_common::store::MemoryStore::new());
    let live = LiveHub::new(16);
    let distributor = Arc::new(Distributor::new(
        store.clone(),
        3,
        Duration::from_millis(10),
        Some(relay.clone()),
        live.clone(),
    ));
    let dedup_config = DedupConfig {
        window: "10".parse().unwrap(),
        idle_secs: 60,
        persist_attempts: 3,
        persist_retry: EnvMsDuration(Duration::from_millis(10)),
        input_capacity: 64,
    };
    let (dedup, dedup_task) = Deduplicator::spawn(&dedup_config, distributor);

    let addr = serve_router(router(live.clone(), Arc::new(AtomicBool::new(true)), None)).await;
    let (mut viewer, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("failed to connect viewer");
    wait_for("the viewer to subscribe", || {
        let live = live.clone();
        async move { live.viewer_count() == 1 }
    })
    .await;

    let t = Utc::now();
    let clock = Arc::new(ManualClock::new(t));
    let topic_router = TopicRouter::new("meshcore", clock.clone(), dedup);

    let (topic, payload) = advertisement(GATEWAY_1);
    topic_router.route(&topic, &payload).await.unwrap();

    clock.advance(chrono::Duration::seconds(3));
    let (topic, payload) = advertisement(GATEWAY_2);
    topic_router.route(&topic, &payload).await.unwrap();
    // The same gateway again, a QoS 1 redelivery.
    topic_router.route(&topic, &payload).await.unwrap();

    topic_router
        .route(
            &format!("meshcore/{GATEWAY_1}/event/channel_msg_recv"),
            br#"{"channel_idx": 0, "text": "hello mesh"}"#,
        )
        .await
        .unwrap();
    topic_router
        .route("meshcore/not-a-key/event/advertisement", b"{}")
        .await
        .unwrap();

    clock.advance(chrono::Duration::seconds(12));
    let (topic, payload) = advertisement(GATEWAY_3);
    topic_router.route(&topic, &payload).await.unwrap();

    // Dropping the router drops the last handle, which flushes the open sighting.
    drop(topic_router);
    dedup_task.await.unwrap();

    let sightings = store.sightings();
    assert_eq!(sightings.len(), 2);
    assert_eq!(sightings[0].window_start, t);
    assert_eq!(sightings[0].receivers.len(), 2);
    assert_eq!(sightings[1].window_start, t + chrono::Duration::seconds(15));
    assert_eq!(sightings[1].receivers.len(), 1);

    let node = store.node(&NODE.parse().unwrap()).unwrap();
    assert_eq!(node.name.as_deref(), Some("Hilltop"));
    assert_eq!(node.last_seen, Some(t + chrono::Duration::seconds(15)));
    assert_eq!(store.events().len(), 1);

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .expect("timed out waiting for deliveries")
            .unwrap();
        outcomes.push((report.event_type, report.outcome));
    }
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        outcomes,
        vec![
            ("advertisement".to_owned(), DeliveryOutcome::Delivered),
            ("advertisement".to_owned(), DeliveryOutcome::Delivered),
            ("channel_msg_recv".to_owned(), DeliveryOutcome::Delivered),
        ]
    );
    sightings_hook.assert_hits(2);
    messages_hook.assert_hits(1);

    let mut frames = Vec::new();
    while frames.len() < 3 {
        let message = tokio::time::timeout(Duration::from_secs(5), viewer.next())
            .await
            .expect("timed out waiting for frames")
            .expect("viewer closed early")
            .unwrap();
        if let Message::Text(text) = message {
            frames.push(serde_json::from_str::<Value>(&text).unwrap());
        }
    }

    let first_sighting = frames
        .iter()
        .find(|frame| frame["event_name"] == "advertisement")
        .unwrap();
    assert_json_include!(
        actual: first_sighting,
        expected: json!({
            "public_key": NODE,
            "payload": {
                "name": "Hilltop",
                "adv_type": "2",
                "receivers": [
                    {"public_key": GATEWAY_1},
                    {"public_key": GATEWAY_2},
                ],
            },
        })
    );
    assert!(frames
        .iter()
        .any(|frame| frame["event_name"] == "channel_msg_recv"
            && frame["public_key"] == GATEWAY_1
            && frame["payload"]["text"] == "hello mesh"));

    relay.shutdown().await;
    live.close_all();
}
