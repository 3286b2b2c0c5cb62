//! Backend capability traits.
//!
//! A backend is a plain capability set — `{publish, subscribe, get_events,
//! trim}` for the event stream plus run-record persistence. Concrete
//! variants (in-memory, Redis Streams) are swapped via configuration; no
//! inheritance, no downcasting.

use crate::event::Event;
use crate::run::Run;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

/// Boxed per-run event stream yielded by `subscribe`.
///
/// The stream ends after the terminal event or when the subscription is
/// dropped. Dropping it never affects the run.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Subscription parameters.
#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    /// First sequence number to deliver.
    pub from_sequence: u64,
    /// Whether stored events are replayed before tailing live ones.
    pub include_historical: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            from_sequence: 0,
            include_historical: true,
        }
    }
}

impl SubscribeOptions {
    pub fn from_sequence(from_sequence: u64) -> Self {
        Self {
            from_sequence,
            ..Self::default()
        }
    }
}

/// Backend failures.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transient backend fault (connection refused, timeout, ...). Reads
    /// are retried; writes get a bounded retry budget and then surface
    /// this on the producer side.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Operation on an unknown run id. Never retried.
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// A terminal event is already recorded for the run.
    #[error("run already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend closed")]
    Closed,
}

/// Event storage and fan-out for runs.
#[async_trait]
pub trait EventStreamStore: Send + Sync {
    /// Persist an event and offer it to live subscribers.
    ///
    /// Safe for concurrent producers; never blocks on subscribers. Returns
    /// [`BackendError::AlreadyTerminal`] when a terminal event is already
    /// stored for the run.
    async fn publish(&self, run_id: &str, event: &Event) -> Result<(), BackendError>;

    /// Open a subscription: stored events with `sequence >=
    /// from_sequence` first (when `include_historical`), then live events,
    /// until the terminal event.
    async fn subscribe(&self, run_id: &str, opts: SubscribeOptions)
        -> Result<EventStream, BackendError>;

    /// One-shot query of stored events, no live tail.
    async fn get_events(
        &self,
        run_id: &str,
        from_sequence: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, BackendError>;

    /// Delete all stored events for a run.
    async fn trim(&self, run_id: &str) -> Result<(), BackendError>;
}

/// Run-record persistence.
#[async_trait]
pub trait RunRecordStore: Send + Sync {
    /// Insert or update a run record.
    async fn put_run(&self, run: &Run) -> Result<(), BackendError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, BackendError>;

    /// Runs ordered newest-first by creation time.
    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, BackendError>;

    /// Remove the record and its events.
    async fn delete_run(&self, run_id: &str) -> Result<(), BackendError>;

    /// Atomically persist a terminal run state together with its terminal
    /// event, as one logical commit. Fails with
    /// [`BackendError::AlreadyTerminal`] if the run already has a terminal
    /// event stored.
    async fn commit_terminal(&self, run: &Run, terminal: &Event) -> Result<(), BackendError>;
}

/// Full backend capability set.
pub trait StreamingBackend: EventStreamStore + RunRecordStore {}

impl<T: EventStreamStore + RunRecordStore + ?Sized> StreamingBackend for T {}
