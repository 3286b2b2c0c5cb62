//! Direct in-request streaming (queue-mode contexts).

use dockrion_events::contract::{EventKind, EventsFilter};
use dockrion_events::{current_context, make_direct_context, scope_context};
use serde_json::json;

/// The adapter drains between agent steps and frames each batch; order and
/// density survive the drain boundaries.
#[tokio::test]
async fn drain_between_steps_preserves_order() {
    let ctx = make_direct_context("req-42", EventsFilter::preset("chat").unwrap());

    ctx.emit_started(Some("direct-agent"), None, None).await;
    ctx.emit_token("Hel", None).await;
    let first_batch = ctx.drain_queued_events();

    ctx.emit_token("lo", Some("stop".to_string())).await;
    ctx.emit_complete(json!({"text": "Hello"}), Some(0.2), None).await;
    let second_batch = ctx.drain_queued_events();

    let seqs: Vec<u64> = first_batch
        .iter()
        .chain(second_batch.iter())
        .map(|e| e.sequence)
        .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3]);
    assert!(second_batch.last().unwrap().is_terminal());
    assert!(ctx.is_queue_mode());
}

/// Chat preset: progress is filtered, sequences stay dense, and every
/// drained event frames as a valid SSE record with its sequence as the id.
#[tokio::test]
async fn drained_events_frame_as_sse() {
    let ctx = make_direct_context("req-7", EventsFilter::preset("chat").unwrap());
    ctx.emit_progress("ignored", 0.5, None).await;
    ctx.emit_token("hi", None).await;
    ctx.emit_complete(json!({"ok": true}), None, None).await;

    let events = ctx.drain_queued_events();
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, vec![EventKind::Token, EventKind::Complete]);

    let frames: Vec<String> = events.iter().map(|e| e.to_sse()).collect();
    assert!(frames[0].starts_with("event: token\nid: 0\ndata: "));
    assert!(frames[1].starts_with("event: complete\nid: 1\ndata: "));
    for frame in &frames {
        assert!(frame.ends_with("\n\n"));
        let data_line = frame
            .lines()
            .find(|l| l.starts_with("data: "))
            .expect("data line");
        let parsed: serde_json::Value =
            serde_json::from_str(data_line.trim_start_matches("data: ")).unwrap();
        assert_eq!(parsed["run_id"], "req-7");
    }
}

/// Agent code that was not handed the context explicitly reaches it through
/// the ambient task-local binding installed by the adapter.
#[tokio::test]
async fn adapter_installs_ambient_context_around_invocation() {
    let ctx = make_direct_context("req-9", EventsFilter::all());

    // Stand-in for framework callback code with no context parameter.
    async fn inner_node() {
        if let Some(ctx) = current_context() {
            ctx.emit_step("inner_node", Some(3), vec![], vec![]).await;
        }
    }

    scope_context(ctx.clone(), async {
        inner_node().await;
    })
    .await;
    assert!(current_context().is_none());

    let events = ctx.drain_queued_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), EventKind::Step);
}
