use std::sync::Arc;
use std::time::Duration;

use openagents_stream::{
    ClientNotification, ConnectionState, LiveSession, MemoryTransport, StreamConfig,
    SubscribeOptions, SubscribeParams,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

async fn wait_for(
    rx: &mut broadcast::Receiver<ClientNotification>,
    mut predicate: impl FnMut(&ClientNotification) -> bool,
) {
    loop {
        match timeout(Duration::from_secs(120), rx.recv()).await {
            Ok(Ok(notification)) if predicate(&notification) => return,
            Ok(Ok(_)) => {}
            Ok(Err(error)) => panic!("notification channel failed: {error}"),
            Err(_) => panic!("timed out waiting for a session notification"),
        }
    }
}

fn is_open(notification: &ClientNotification) -> bool {
    matches!(notification, ClientNotification::Status(status) if status.state == ConnectionState::Open)
}

#[tokio::test(start_paused = true)]
async fn escalations_mitigate_and_fold_into_the_next_subscription() {
    let transport = Arc::new(MemoryTransport::new());
    let feed = transport.accept_next();
    let session = LiveSession::new(Arc::clone(&transport) as _, &StreamConfig::default());
    let base = SubscribeParams::new("mem://live").with_param("runId", "run-1");
    let mut rx = session.notifications();

    session
        .start(&base, SubscribeOptions::default())
        .unwrap_or_else(|error| panic!("{error}"));
    wait_for(&mut rx, is_open).await;
    assert_eq!(transport.connect_log()[0].param("steps"), Some("50"));

    for message in [
        json!({"type": "stability", "runId": "run-1", "level": "high"}),
        json!({"type": "phi", "runId": "run-1", "value": 0.42}),
        json!({"type": "stability", "runId": "run-1", "level": "high"}),
        json!({"type": "stability", "runId": "run-1", "level": "CRITICAL"}),
        json!({"type": "attention", "runId": "run-1", "value": 0.9}),
    ] {
        assert!(feed.send_json(&message));
    }
    wait_for(&mut rx, |notification| {
        matches!(notification, ClientNotification::Appended { seq: 5 })
    })
    .await;
    session.sync();

    assert_eq!(session.mitigation_state().mitigation_count, 2);
    assert_eq!(session.steps(), 32);
    assert!(session.weights().is_normalized(1e-9));
    assert_eq!(session.series("phi"), Some(vec![0.42]));
    assert_eq!(session.series("attention"), Some(vec![0.9]));
    assert_eq!(session.series("missing"), None);
    assert_eq!(session.adjustments().len(), 2);

    session.stop();
    assert_eq!(session.status().state, ConnectionState::Idle);

    let _next = transport.accept_next();
    session
        .start(&base, SubscribeOptions::default())
        .unwrap_or_else(|error| panic!("restart failed: {error}"));
    wait_for(&mut rx, is_open).await;

    let resubscribed = &transport.connect_log()[1];
    assert_eq!(resubscribed.param("runId"), Some("run-1"));
    assert_eq!(resubscribed.param("steps"), Some("32"));
    assert_eq!(resubscribed.param("gwt"), Some("0.3610"));
}

#[tokio::test(start_paused = true)]
async fn observer_task_follows_the_log_without_explicit_sync() {
    let transport = Arc::new(MemoryTransport::new());
    let feed = transport.accept_next();
    let session = LiveSession::new(Arc::clone(&transport) as _, &StreamConfig::default());
    let mut rx = session.notifications();

    session
        .start(&SubscribeParams::new("mem://live"), SubscribeOptions::default())
        .unwrap_or_else(|error| panic!("{error}"));
    wait_for(&mut rx, is_open).await;

    assert!(feed.send_json(&json!({"type": "stability", "level": "high"})));
    wait_for(&mut rx, |notification| {
        matches!(notification, ClientNotification::Appended { .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(session.mitigation_state().mitigation_count, 1);
    assert_eq!(session.steps(), 40);
}
