//! Event bus facade.
//!
//! A thin, cloneable handle over a [`StreamingBackend`]. It owns no state
//! of its own — publish, subscribe, query, trim, and run-record operations
//! all delegate to the configured backend.

use dockrion_event_backends::MemoryBackend;
#[cfg(feature = "redis")]
use dockrion_event_backends::RedisBackend;
use dockrion_events_contract::{
    BackendError, BackendKind, Event, EventStream, Run, StreamingBackend, StreamingConfig,
    SubscribeOptions,
};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// How often the in-memory backend's TTL sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Uniform API over event backends.
#[derive(Clone)]
pub struct EventBus {
    backend: Arc<dyn StreamingBackend>,
}

impl EventBus {
    pub fn new(backend: Arc<dyn StreamingBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StreamingBackend> {
        &self.backend
    }

    /// Persist an event and fan it out to live subscribers.
    pub async fn publish(&self, run_id: &str, event: &Event) -> Result<(), BackendError> {
        self.backend.publish(run_id, event).await
    }

    /// Open a subscription: stored events first, then live events, until
    /// the terminal event or the stream is dropped.
    pub async fn subscribe(
        &self,
        run_id: &str,
        opts: SubscribeOptions,
    ) -> Result<EventStream, BackendError> {
        self.backend.subscribe(run_id, opts).await
    }

    /// One-shot query of stored events, no live tail.
    pub async fn get_events(
        &self,
        run_id: &str,
        from_sequence: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, BackendError> {
        self.backend.get_events(run_id, from_sequence, limit).await
    }

    /// Delete all stored events for a run.
    pub async fn trim(&self, run_id: &str) -> Result<(), BackendError> {
        self.backend.trim(run_id).await
    }

    pub async fn put_run(&self, run: &Run) -> Result<(), BackendError> {
        self.backend.put_run(run).await
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>, BackendError> {
        self.backend.get_run(run_id).await
    }

    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, BackendError> {
        self.backend.list_runs(limit).await
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<(), BackendError> {
        self.backend.delete_run(run_id).await
    }

    /// Atomically persist a terminal run state with its terminal event.
    pub async fn commit_terminal(&self, run: &Run, terminal: &Event) -> Result<(), BackendError> {
        self.backend.commit_terminal(run, terminal).await
    }
}

/// Build an [`EventBus`] for the configured backend.
///
/// Must be called from within a Tokio runtime: the in-memory variant
/// spawns a background TTL sweeper (holding only a weak reference, so the
/// task exits once the bus is dropped).
pub fn create_event_bus(config: &StreamingConfig) -> Result<EventBus, BackendError> {
    match config.backend {
        BackendKind::InMemory => {
            let backend = Arc::new(MemoryBackend::with_limits(
                config.redis.max_events_per_run,
                Duration::from_secs(config.redis.stream_ttl_seconds),
            ));
            spawn_ttl_sweeper(Arc::downgrade(&backend));
            Ok(EventBus::new(backend))
        }
        BackendKind::Redis => {
            #[cfg(feature = "redis")]
            {
                let backend = RedisBackend::new(&config.redis)?;
                Ok(EventBus::new(Arc::new(backend)))
            }
            #[cfg(not(feature = "redis"))]
            {
                Err(BackendError::Unavailable(
                    "redis backend requires the `redis` cargo feature".to_string(),
                ))
            }
        }
    }
}

fn spawn_ttl_sweeper(backend: Weak<MemoryBackend>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            let Some(backend) = backend.upgrade() else {
                break;
            };
            let removed = backend.sweep_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "ttl sweep removed expired runs");
            }
        }
    });
}
