//! Producer-side stream context.
//!
//! Agent code emits events through a [`StreamContext`]. The context owns
//! the run's sequence counter, applies the emit policy, and multiplexes
//! into one of two sinks:
//!
//! - **queue mode** (direct streaming): events collect in an internal
//!   bounded queue that the request handler drains and frames. Nothing is
//!   ever stored server-side; the id is a client-correlation id.
//! - **bus mode** (async runs): events publish through the [`EventBus`]
//!   to the configured backend for replay and fan-out.
//!
//! Sequence numbers are assigned after filter accept, so stored sequences
//! are dense starting at 0. Bus publishes additionally serialize through a
//! per-context async lock, keeping delivery order identical to sequence
//! order even when awaiting and fire-and-forget emissions interleave.

use crate::bus::EventBus;
use dockrion_events_contract::{
    now_unix_millis, BackendError, Event, EventPayload, EventsFilter,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::task_local;

/// Queue-mode high-water mark. Beyond this, oldest non-mandatory events
/// are evicted.
const QUEUE_HIGH_WATER: usize = 1024;

/// Error code attached to the synthesized terminal event when a bus
/// publish exhausts its retry budget.
const BACKEND_UNAVAILABLE_CODE: &str = "BACKEND_UNAVAILABLE";

/// Error code attached to the synthesized terminal event when queue-mode
/// eviction would have to drop mandatory events.
const QUEUE_OVERFLOW_CODE: &str = "QUEUE_OVERFLOW";

struct Sequencer {
    next_sequence: u64,
    last_ts: u64,
    terminated: bool,
    /// Queue-mode sink; stays empty in bus mode.
    queue: VecDeque<Event>,
}

impl Sequencer {
    /// Assign the next sequence number and a monotonic timestamp. Returns
    /// `None` once a terminal event has been recorded.
    fn stamp(&mut self, run_id: &str, payload: EventPayload) -> Option<Event> {
        if self.terminated {
            tracing::debug!(run_id, event_type = %payload.kind(), "emit after terminal dropped");
            return None;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let ts = now_unix_millis().max(self.last_ts);
        self.last_ts = ts;
        if payload.is_terminal() {
            self.terminated = true;
        }
        Some(Event {
            run_id: run_id.to_string(),
            sequence,
            ts,
            payload,
        })
    }
}

/// Emission API handed to agent code, bound to one run.
pub struct StreamContext {
    run_id: String,
    filter: EventsFilter,
    agent_name: Option<String>,
    framework: Option<String>,
    bus: Option<EventBus>,
    high_water: usize,
    sequencer: Mutex<Sequencer>,
    /// Serializes bus publishes so subscribers never observe sequence
    /// inversions.
    publish_lock: tokio::sync::Mutex<()>,
}

impl StreamContext {
    /// Queue-mode context for direct in-request streaming. `run_id` is a
    /// client-correlation identifier that is never stored.
    pub fn queue(run_id: impl Into<String>, filter: EventsFilter) -> Self {
        Self::build(run_id.into(), filter, None)
    }

    /// Bus-mode context for server-managed runs.
    pub fn bus(run_id: impl Into<String>, filter: EventsFilter, bus: EventBus) -> Self {
        Self::build(run_id.into(), filter, Some(bus))
    }

    fn build(run_id: String, filter: EventsFilter, bus: Option<EventBus>) -> Self {
        Self {
            run_id,
            filter,
            agent_name: None,
            framework: None,
            bus,
            high_water: QUEUE_HIGH_WATER,
            sequencer: Mutex::new(Sequencer {
                next_sequence: 0,
                last_ts: 0,
                terminated: false,
                queue: VecDeque::new(),
            }),
            publish_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Default agent identity reported by `started` events.
    pub fn with_agent_identity(
        mut self,
        agent_name: Option<String>,
        framework: Option<String>,
    ) -> Self {
        self.agent_name = agent_name;
        self.framework = framework;
        self
    }

    /// Override the queue high-water mark (queue mode).
    pub fn with_queue_high_water(mut self, high_water: usize) -> Self {
        self.high_water = high_water.max(1);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn filter(&self) -> &EventsFilter {
        &self.filter
    }

    pub fn is_queue_mode(&self) -> bool {
        self.bus.is_none()
    }

    /// Whether a terminal event has been recorded for this context.
    pub fn is_terminated(&self) -> bool {
        self.lock_sequencer().terminated
    }

    fn lock_sequencer(&self) -> std::sync::MutexGuard<'_, Sequencer> {
        // A panic while holding this lock leaves consistent state; recover
        // rather than poisoning every later emit.
        self.sequencer.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Core emission paths
    // =========================================================================

    async fn emit_payload(&self, payload: EventPayload) -> Option<Event> {
        if !self.filter.is_allowed(&payload.kind()) {
            return None;
        }
        match &self.bus {
            None => self.emit_queued(payload),
            Some(bus) => {
                let _ordered = self.publish_lock.lock().await;
                let event = self.lock_sequencer().stamp(&self.run_id, payload)?;
                match bus.publish(&self.run_id, &event).await {
                    Ok(()) => Some(event),
                    Err(BackendError::AlreadyTerminal(_)) => {
                        // Another writer (forced cancel, another instance)
                        // terminated the run; adopt that locally.
                        self.lock_sequencer().terminated = true;
                        tracing::debug!(
                            run_id = %self.run_id,
                            sequence = event.sequence,
                            "publish after terminal dropped"
                        );
                        None
                    }
                    Err(err) => {
                        self.degrade(bus, err).await;
                        None
                    }
                }
            }
        }
    }

    /// Convert an exhausted publish into a terminal `error` event and
    /// attempt it once; never raises to the caller.
    async fn degrade(&self, bus: &EventBus, err: BackendError) {
        tracing::warn!(
            run_id = %self.run_id,
            error = %err,
            "publish failed after retries, surfacing as terminal error event"
        );
        let payload = EventPayload::Error {
            error: err.to_string(),
            code: BACKEND_UNAVAILABLE_CODE.to_string(),
            details: None,
        };
        let Some(event) = self.lock_sequencer().stamp(&self.run_id, payload) else {
            return;
        };
        if let Err(e) = bus.publish(&self.run_id, &event).await {
            tracing::error!(
                run_id = %self.run_id,
                error = %e,
                "degraded error event could not be published"
            );
        }
    }

    /// Queue-mode emission: stamp and append under one critical section,
    /// enforcing the high-water mark.
    fn emit_queued(&self, payload: EventPayload) -> Option<Event> {
        let mut seq = self.lock_sequencer();
        let event = seq.stamp(&self.run_id, payload)?;
        seq.queue.push_back(event.clone());

        while seq.queue.len() > self.high_water {
            if let Some(pos) = seq.queue.iter().position(|e| !e.kind().is_mandatory()) {
                let dropped = seq.queue.remove(pos);
                if let Some(dropped) = dropped {
                    tracing::debug!(
                        run_id = %self.run_id,
                        sequence = dropped.sequence,
                        event_type = %dropped.kind(),
                        "queue high-water reached, oldest non-mandatory event dropped"
                    );
                }
            } else {
                // Only mandatory events are left; dropping any of them is a
                // fatal condition. Replace the queue with one terminal error.
                tracing::error!(
                    run_id = %self.run_id,
                    queued = seq.queue.len(),
                    "queue overflow would drop mandatory events"
                );
                seq.queue.clear();
                let payload = EventPayload::Error {
                    error: "event queue overflowed with mandatory events".to_string(),
                    code: QUEUE_OVERFLOW_CODE.to_string(),
                    details: None,
                };
                if let Some(synthesized) = seq.stamp(&self.run_id, payload) {
                    seq.queue.push_back(synthesized);
                }
                return None;
            }
        }
        Some(event)
    }

    /// Fire-and-forget dispatch. Queue mode is synchronous; bus mode
    /// spawns a task that takes the publish ordering lock.
    fn dispatch_nowait(self: &Arc<Self>, payload: EventPayload) {
        if !self.filter.is_allowed(&payload.kind()) {
            return;
        }
        if self.bus.is_none() {
            self.emit_queued(payload);
            return;
        }
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            ctx.emit_payload(payload).await;
        });
    }

    /// Stamp a terminal event without publishing it. The run manager pairs
    /// this with an atomic `commit_terminal` so the run state and the
    /// terminal event land as one logical commit. Waits for in-flight
    /// publishes so the terminal sequence is last.
    pub(crate) async fn seal(&self, payload: EventPayload) -> Option<Event> {
        let _ordered = self.publish_lock.lock().await;
        self.lock_sequencer().stamp(&self.run_id, payload)
    }

    // =========================================================================
    // Queue draining (direct streaming)
    // =========================================================================

    /// Atomically remove and return all queued events, in sequence order.
    pub fn drain_queued_events(&self) -> Vec<Event> {
        let mut seq = self.lock_sequencer();
        seq.queue.drain(..).collect()
    }

    pub fn has_queued_events(&self) -> bool {
        !self.lock_sequencer().queue.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.lock_sequencer().queue.len()
    }

    // =========================================================================
    // Typed emit operations (awaiting variants)
    // =========================================================================

    pub async fn emit_started(
        &self,
        agent_name: Option<&str>,
        framework: Option<&str>,
        metadata: Option<Value>,
    ) -> Option<Event> {
        self.emit_payload(EventPayload::Started {
            agent_name: agent_name
                .map(str::to_string)
                .or_else(|| self.agent_name.clone()),
            framework: framework
                .map(str::to_string)
                .or_else(|| self.framework.clone()),
            metadata,
        })
        .await
    }

    pub async fn emit_progress(
        &self,
        step: impl Into<String>,
        progress: f64,
        message: Option<String>,
    ) -> Option<Event> {
        self.emit_payload(EventPayload::Progress {
            step: step.into(),
            progress: progress.clamp(0.0, 1.0),
            message,
        })
        .await
    }

    pub async fn emit_checkpoint(&self, name: impl Into<String>, data: Value) -> Option<Event> {
        self.emit_payload(EventPayload::Checkpoint {
            name: name.into(),
            data,
        })
        .await
    }

    pub async fn emit_token(
        &self,
        content: impl Into<String>,
        finish_reason: Option<String>,
    ) -> Option<Event> {
        self.emit_payload(EventPayload::Token {
            content: content.into(),
            finish_reason,
        })
        .await
    }

    pub async fn emit_step(
        &self,
        node_name: impl Into<String>,
        duration_ms: Option<u64>,
        input_keys: Vec<String>,
        output_keys: Vec<String>,
    ) -> Option<Event> {
        self.emit_payload(EventPayload::Step {
            node_name: node_name.into(),
            duration_ms,
            input_keys,
            output_keys,
        })
        .await
    }

    pub async fn emit_complete(
        &self,
        output: Value,
        latency_seconds: Option<f64>,
        metadata: Option<Value>,
    ) -> Option<Event> {
        self.emit_payload(EventPayload::Complete {
            output,
            latency_seconds,
            metadata,
        })
        .await
    }

    pub async fn emit_error(
        &self,
        error: impl Into<String>,
        code: impl Into<String>,
        details: Option<Value>,
    ) -> Option<Event> {
        self.emit_payload(EventPayload::Error {
            error: error.into(),
            code: code.into(),
            details,
        })
        .await
    }

    pub async fn emit_cancelled(&self, reason: Option<String>) -> Option<Event> {
        self.emit_payload(EventPayload::Cancelled { reason }).await
    }

    pub async fn emit_heartbeat(&self) -> Option<Event> {
        self.emit_payload(EventPayload::Heartbeat).await
    }

    pub async fn emit_custom(&self, name: impl Into<String>, data: Value) -> Option<Event> {
        self.emit_payload(EventPayload::Custom {
            name: name.into(),
            data,
        })
        .await
    }

    // =========================================================================
    // Typed emit operations (fire-and-forget variants)
    // =========================================================================

    pub fn emit_started_nowait(
        self: &Arc<Self>,
        agent_name: Option<&str>,
        framework: Option<&str>,
        metadata: Option<Value>,
    ) {
        self.dispatch_nowait(EventPayload::Started {
            agent_name: agent_name
                .map(str::to_string)
                .or_else(|| self.agent_name.clone()),
            framework: framework
                .map(str::to_string)
                .or_else(|| self.framework.clone()),
            metadata,
        });
    }

    pub fn emit_progress_nowait(
        self: &Arc<Self>,
        step: impl Into<String>,
        progress: f64,
        message: Option<String>,
    ) {
        self.dispatch_nowait(EventPayload::Progress {
            step: step.into(),
            progress: progress.clamp(0.0, 1.0),
            message,
        });
    }

    pub fn emit_checkpoint_nowait(self: &Arc<Self>, name: impl Into<String>, data: Value) {
        self.dispatch_nowait(EventPayload::Checkpoint {
            name: name.into(),
            data,
        });
    }

    pub fn emit_token_nowait(
        self: &Arc<Self>,
        content: impl Into<String>,
        finish_reason: Option<String>,
    ) {
        self.dispatch_nowait(EventPayload::Token {
            content: content.into(),
            finish_reason,
        });
    }

    pub fn emit_step_nowait(
        self: &Arc<Self>,
        node_name: impl Into<String>,
        duration_ms: Option<u64>,
        input_keys: Vec<String>,
        output_keys: Vec<String>,
    ) {
        self.dispatch_nowait(EventPayload::Step {
            node_name: node_name.into(),
            duration_ms,
            input_keys,
            output_keys,
        });
    }

    pub fn emit_complete_nowait(
        self: &Arc<Self>,
        output: Value,
        latency_seconds: Option<f64>,
        metadata: Option<Value>,
    ) {
        self.dispatch_nowait(EventPayload::Complete {
            output,
            latency_seconds,
            metadata,
        });
    }

    pub fn emit_error_nowait(
        self: &Arc<Self>,
        error: impl Into<String>,
        code: impl Into<String>,
        details: Option<Value>,
    ) {
        self.dispatch_nowait(EventPayload::Error {
            error: error.into(),
            code: code.into(),
            details,
        });
    }

    pub fn emit_cancelled_nowait(self: &Arc<Self>, reason: Option<String>) {
        self.dispatch_nowait(EventPayload::Cancelled { reason });
    }

    pub fn emit_heartbeat_nowait(self: &Arc<Self>) {
        self.dispatch_nowait(EventPayload::Heartbeat);
    }

    pub fn emit_custom_nowait(self: &Arc<Self>, name: impl Into<String>, data: Value) {
        self.dispatch_nowait(EventPayload::Custom {
            name: name.into(),
            data,
        });
    }
}

// =============================================================================
// Factory hooks for transport adapters
// =============================================================================

/// Queue-mode context for direct in-request streaming. The correlation id
/// is never written to any backend.
pub fn make_direct_context(
    correlation_id: impl Into<String>,
    filter: EventsFilter,
) -> Arc<StreamContext> {
    Arc::new(StreamContext::queue(correlation_id, filter))
}

/// Bus-mode context for a server-managed run.
pub fn make_bus_context(
    run_id: impl Into<String>,
    filter: EventsFilter,
    bus: EventBus,
) -> Arc<StreamContext> {
    Arc::new(StreamContext::bus(run_id, filter, bus))
}

// =============================================================================
// Ambient per-task context
// =============================================================================

task_local! {
    static CURRENT_CONTEXT: Arc<StreamContext>;
}

/// Run `fut` with `context` installed as the task's ambient stream
/// context. The binding is removed on every exit path and never leaks to
/// other tasks.
pub async fn scope_context<F>(context: Arc<StreamContext>, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_CONTEXT.scope(context, fut).await
}

/// The ambient stream context of the current task, if one is installed.
pub fn current_context() -> Option<Arc<StreamContext>> {
    CURRENT_CONTEXT.try_with(Arc::clone).ok()
}
