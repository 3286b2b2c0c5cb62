use dockrion_event_backends::MemoryBackend;
use dockrion_events_contract::{
    BackendError, Event, EventPayload, EventStreamStore, Run, RunRecordStore, RunStatus,
    SubscribeOptions,
};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn event(run_id: &str, sequence: u64, payload: EventPayload) -> Event {
    Event {
        run_id: run_id.to_string(),
        sequence,
        ts: 1_700_000_000_000 + sequence,
        payload,
    }
}

fn started(run_id: &str) -> Event {
    event(
        run_id,
        0,
        EventPayload::Started {
            agent_name: Some("test-agent".to_string()),
            framework: None,
            metadata: None,
        },
    )
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

async fn collect(backend: &MemoryBackend, run_id: &str, from: u64) -> Vec<Event> {
    backend
        .subscribe(run_id, SubscribeOptions::from_sequence(from))
        .await
        .unwrap()
        .collect()
        .await
}

/// Scenario: every stored event replays in order, stream closes at terminal.
#[tokio::test]
async fn finished_run_replays_in_order_and_closes() {
    let backend = MemoryBackend::new();
    backend.publish("r2", &started("r2")).await.unwrap();
    for seq in 1..9 {
        backend.publish("r2", &token("r2", seq)).await.unwrap();
    }
    backend.publish("r2", &complete("r2", 9)).await.unwrap();

    let events = collect(&backend, "r2", 0).await;
    let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, (0..=9).collect::<Vec<u64>>());
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn replay_is_idempotent_until_ttl() {
    let backend = MemoryBackend::new();
    backend.publish("r", &started("r")).await.unwrap();
    backend.publish("r", &token("r", 1)).await.unwrap();
    backend.publish("r", &complete("r", 2)).await.unwrap();

    let first = collect(&backend, "r", 0).await;
    let second = collect(&backend, "r", 0).await;
    assert_eq!(first, second);
}

/// Scenario: subscriber A got 0..2, reconnects at 3 while the producer keeps
/// going; A observes 3..=8 with no gap.
#[tokio::test]
async fn reconnect_resumes_from_sequence() {
    let backend = Arc::new(MemoryBackend::new());
    backend.publish("r3", &started("r3")).await.unwrap();
    for seq in 1..=4 {
        backend.publish("r3", &token("r3", seq)).await.unwrap();
    }

    let mut stream = backend
        .subscribe("r3", SubscribeOptions::from_sequence(3))
        .await
        .unwrap();

    let publisher = backend.clone();
    let producer = tokio::spawn(async move {
        for seq in 5..=7 {
            publisher.publish("r3", &token("r3", seq)).await.unwrap();
        }
        publisher.publish("r3", &complete("r3", 8)).await.unwrap();
    });

    let mut seqs = Vec::new();
    while let Some(ev) = stream.next().await {
        seqs.push(ev.sequence);
    }
    producer.await.unwrap();
    assert_eq!(seqs, vec![3, 4, 5, 6, 7, 8]);
}

#[tokio::test]
async fn from_sequence_past_terminal_closes_empty() {
    let backend = MemoryBackend::new();
    backend.publish("r", &started("r")).await.unwrap();
    backend.publish("r", &complete("r", 1)).await.unwrap();

    let events = collect(&backend, "r", 2).await;
    assert!(events.is_empty());
}

/// Scenario: cap 5, ten non-mandatory events plus a terminal. Replay keeps
/// the four most recent tokens plus the terminal.
#[tokio::test]
async fn overflow_keeps_mandatory_and_most_recent() {
    let backend = MemoryBackend::with_limits(5, Duration::from_secs(60));
    for seq in 0..10 {
        backend.publish("r6", &token("r6", seq)).await.unwrap();
    }
    backend.publish("r6", &complete("r6", 10)).await.unwrap();

    let events = collect(&backend, "r6", 0).await;
    assert_eq!(events.len(), 5);
    let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(seqs, vec![6, 7, 8, 9, 10]);
    assert_eq!(events.first().unwrap().sequence, 6);
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn trim_ends_live_subscriptions() {
    let backend = Arc::new(MemoryBackend::new());
    backend.publish("r", &started("r")).await.unwrap();
    let mut stream = backend
        .subscribe("r", SubscribeOptions::default())
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().sequence, 0);

    backend.trim("r").await.unwrap();
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn run_records_round_trip_and_list_newest_first() {
    let backend = MemoryBackend::new();
    let mut a = Run::new("a", 3600);
    a.created_at = 100;
    let mut b = Run::new("b", 3600);
    b.created_at = 200;
    backend.put_run(&a).await.unwrap();
    backend.put_run(&b).await.unwrap();

    assert_eq!(backend.get_run("a").await.unwrap().unwrap().run_id, "a");
    assert_eq!(backend.get_run("missing").await.unwrap(), None);

    let listed = backend.list_runs(10).await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(ids, vec!["b", "a"]);

    backend.delete_run("a").await.unwrap();
    assert_eq!(backend.get_run("a").await.unwrap(), None);
}

#[tokio::test]
async fn commit_terminal_fans_out_to_live_subscriber() {
    let backend = Arc::new(MemoryBackend::new());
    backend.publish("r", &started("r")).await.unwrap();
    let mut stream = backend
        .subscribe("r", SubscribeOptions::default())
        .await
        .unwrap();
    assert_eq!(stream.next().await.unwrap().sequence, 0);

    let mut run = Run::new("r", 3600);
    run.status = RunStatus::Completed;
    backend.commit_terminal(&run, &complete("r", 1)).await.unwrap();

    let terminal = stream.next().await.unwrap();
    assert_eq!(terminal.sequence, 1);
    assert!(terminal.is_terminal());
    assert_eq!(stream.next().await, None);

    // A publish racing in after the terminal is refused.
    assert!(matches!(
        backend.publish("r", &token("r", 2)).await,
        Err(BackendError::AlreadyTerminal(_))
    ));
}
