//! Redis backend integration tests.
//!
//! Each test starts a throwaway Redis container and is skipped when no
//! container runtime is available.

#![cfg(feature = "redis")]

use dockrion_event_backends::RedisBackend;
use dockrion_events_contract::{
    BackendError, Event, EventPayload, EventStreamStore, RedisConfig, Run, RunRecordStore,
    RunStatus, SubscribeOptions, TtlPolicy,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::redis::{Redis, REDIS_PORT};

async fn start_redis() -> Option<(testcontainers::ContainerAsync<Redis>, String)> {
    let container = match Redis::default().start().await {
        Ok(container) => container,
        Err(err) => {
            eprintln!("ignoring redis_stream: unable to start Redis container ({err})");
            return None;
        }
    };
    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("failed to get port");
    let url = format!("redis://{host}:{port}");
    Some((container, url))
}

fn backend_for(url: &str) -> RedisBackend {
    RedisBackend::new(&RedisConfig {
        url: url.to_string(),
        stream_ttl_seconds: 60,
        max_events_per_run: 1000,
        connection_pool_size: 4,
        ttl_policy: TtlPolicy::FixedPostMortem,
    })
    .expect("failed to build redis backend")
}

fn run_id(base: &str) -> String {
    format!("{base}-{}", uuid::Uuid::now_v7().simple())
}

fn event(run_id: &str, sequence: u64, payload: EventPayload) -> Event {
    Event {
        run_id: run_id.to_string(),
        sequence,
        ts: 1_700_000_000_000 + sequence,
        payload,
    }
}

fn token(run_id: &str, sequence: u64) -> Event {
    event(
        run_id,
        sequence,
        EventPayload::Token {
            content: format!("t{sequence}"),
            finish_reason: None,
        },
    )
}

fn complete(run_id: &str, sequence: u64) -> Event {
    event(
        run_id,
        sequence,
        EventPayload::Complete {
            output: json!({"r": 1}),
            latency_seconds: None,
            metadata: None,
        },
    )
}

#[tokio::test]
async fn replay_of_finished_run_is_ordered_and_closes() {
    let Some((_container, url)) = start_redis().await else {
        return;
    };
    let backend = backend_for(&url);
    let rid = run_id("r-replay");

    for seq in 0..9 {
        backend.publish(&rid, &token(&rid, seq)).await.unwrap();
    }
    backend.publish(&rid, &complete(&rid, 9)).await.unwrap();

    let events: Vec<Event> = backend
        .subscribe(&rid, SubscribeOptions::default())
        .await
        .unwrap()
        .collect()
        .await;
    let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, (0..=9).collect::<Vec<u64>>());

    // Replay idempotence: a second subscription sees the same sequence.
    let again: Vec<Event> = backend
        .subscribe(&rid, SubscribeOptions::default())
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(events, again);
}

#[tokio::test]
async fn live_tail_delivers_events_published_after_subscribe() {
    let Some((_container, url)) = start_redis().await else {
        return;
    };
    let backend = Arc::new(backend_for(&url));
    let rid = run_id("r-live");

    backend.publish(&rid, &token(&rid, 0)).await.unwrap();

    let mut stream = backend
        .subscribe(&rid, SubscribeOptions::default())
        .await
        .unwrap();

    let publisher = backend.clone();
    let rid_pub = rid.clone();
    let producer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        for seq in 1..=3 {
            publisher.publish(&rid_pub, &token(&rid_pub, seq)).await.unwrap();
        }
        publisher
            .publish(&rid_pub, &complete(&rid_pub, 4))
            .await
            .unwrap();
    });

    let mut seqs = Vec::new();
    while let Some(ev) = stream.next().await {
        seqs.push(ev.sequence);
    }
    producer.await.unwrap();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn reconnect_resumes_from_sequence() {
    let Some((_container, url)) = start_redis().await else {
        return;
    };
    let backend = backend_for(&url);
    let rid = run_id("r-reconnect");

    for seq in 0..=4 {
        backend.publish(&rid, &token(&rid, seq)).await.unwrap();
    }
    backend.publish(&rid, &complete(&rid, 5)).await.unwrap();

    let events: Vec<Event> = backend
        .subscribe(&rid, SubscribeOptions::from_sequence(3))
        .await
        .unwrap()
        .collect()
        .await;
    let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, vec![3, 4, 5]);

    let past_terminal: Vec<Event> = backend
        .subscribe(&rid, SubscribeOptions::from_sequence(6))
        .await
        .unwrap()
        .collect()
        .await;
    assert!(past_terminal.is_empty());
}

#[tokio::test]
async fn events_round_trip_through_the_stream_entry() {
    let Some((_container, url)) = start_redis().await else {
        return;
    };
    let backend = backend_for(&url);
    let rid = run_id("r-codec");

    let custom = event(
        &rid,
        0,
        EventPayload::Custom {
            name: "fraud_check".to_string(),
            data: json!({"passed": true, "score": 0.02}),
        },
    );
    backend.publish(&rid, &custom).await.unwrap();

    let stored = backend.get_events(&rid, 0, None).await.unwrap();
    assert_eq!(stored, vec![custom]);
}

#[tokio::test]
async fn commit_terminal_is_atomic_and_exactly_once() {
    let Some((_container, url)) = start_redis().await else {
        return;
    };
    let backend = backend_for(&url);
    let rid = run_id("r-commit");

    backend.publish(&rid, &token(&rid, 0)).await.unwrap();

    let mut run = Run::new(&rid, 60);
    run.status = RunStatus::Completed;
    run.result = Some(json!({"r": 1}));
    backend
        .commit_terminal(&run, &complete(&rid, 1))
        .await
        .unwrap();

    let stored = backend.get_run(&rid).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);

    assert!(matches!(
        backend.commit_terminal(&run, &complete(&rid, 2)).await,
        Err(BackendError::AlreadyTerminal(_))
    ));
    assert!(matches!(
        backend.publish(&rid, &token(&rid, 2)).await,
        Err(BackendError::AlreadyTerminal(_))
    ));
    assert_eq!(backend.get_events(&rid, 0, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn run_records_and_trim() {
    let Some((_container, url)) = start_redis().await else {
        return;
    };
    let backend = backend_for(&url);
    let a = run_id("r-a");
    let b = run_id("r-b");

    let mut run_a = Run::new(&a, 60);
    run_a.created_at = 100;
    let mut run_b = Run::new(&b, 60);
    run_b.created_at = 200;
    backend.put_run(&run_a).await.unwrap();
    backend.put_run(&run_b).await.unwrap();

    let listed = backend.list_runs(10).await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|r| r.run_id.as_str()).collect();
    assert!(ids.contains(&a.as_str()) && ids.contains(&b.as_str()));
    assert!(
        ids.iter().position(|id| *id == b.as_str())
            < ids.iter().position(|id| *id == a.as_str()),
        "newest run should list first"
    );

    backend.publish(&a, &token(&a, 0)).await.unwrap();
    backend.trim(&a).await.unwrap();
    assert!(backend.get_events(&a, 0, None).await.unwrap().is_empty());

    backend.delete_run(&a).await.unwrap();
    assert_eq!(backend.get_run(&a).await.unwrap(), None);
}
