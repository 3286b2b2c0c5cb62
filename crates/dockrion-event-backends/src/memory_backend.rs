//! Single-process reference backend.
//!
//! Events live in a per-run ring buffer guarded by one mutex per run; the
//! global map takes only short write sections. Fan-out uses bounded
//! channels with non-blocking sends — a subscriber that cannot keep up is
//! dropped and recovers by resubscribing with `from_sequence`.

use async_trait::async_trait;
use dockrion_events_contract::{
    BackendError, Event, EventStream, EventStreamStore, Run, RunRecordStore, SubscribeOptions,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};

/// Capacity of each subscriber's delivery channel.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 128;

struct RunChannel {
    events: VecDeque<Event>,
    subscribers: Vec<mpsc::Sender<Event>>,
    terminated: bool,
    /// Set when the terminal event lands; the sweeper removes the entry
    /// once this instant has passed.
    expires_at: Option<Instant>,
}

impl RunChannel {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            subscribers: Vec::new(),
            terminated: false,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory event backend for development, testing and single-instance
/// deployments.
pub struct MemoryBackend {
    channels: RwLock<HashMap<String, Arc<Mutex<RunChannel>>>>,
    records: RwLock<HashMap<String, Run>>,
    max_events_per_run: usize,
    ttl: Duration,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::with_limits(1000, Duration::from_secs(3600))
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend with an explicit per-run event cap and post-terminal
    /// retention window.
    pub fn with_limits(max_events_per_run: usize, ttl: Duration) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            records: RwLock::new(HashMap::new()),
            max_events_per_run: max_events_per_run.max(1),
            ttl,
        }
    }

    async fn channel(&self, run_id: &str) -> Arc<Mutex<RunChannel>> {
        if let Some(entry) = self.channels.read().await.get(run_id).cloned() {
            if !entry.lock().await.is_expired(Instant::now()) {
                return entry;
            }
        }
        let mut channels = self.channels.write().await;
        if let Some(entry) = channels.get(run_id).cloned() {
            if !entry.lock().await.is_expired(Instant::now()) {
                return entry;
            }
        }
        // Absent or past its retention window: start fresh.
        let fresh = Arc::new(Mutex::new(RunChannel::new()));
        channels.insert(run_id.to_string(), fresh.clone());
        fresh
    }

    async fn existing_channel(&self, run_id: &str) -> Option<Arc<Mutex<RunChannel>>> {
        let entry = self.channels.read().await.get(run_id).cloned()?;
        // Expired runs read as absent even before the sweeper gets to them.
        if entry.lock().await.is_expired(Instant::now()) {
            return None;
        }
        Some(entry)
    }

    /// Append one event, enforcing the ring-buffer cap (oldest
    /// non-mandatory events drop first) and fanning out to subscribers.
    fn append_and_fan_out(&self, chan: &mut RunChannel, run_id: &str, event: &Event) {
        chan.events.push_back(event.clone());
        while chan.events.len() > self.max_events_per_run {
            match chan.events.iter().position(|e| !e.kind().is_mandatory()) {
                Some(pos) => {
                    chan.events.remove(pos);
                }
                // Mandatory events are never evicted.
                None => break,
            }
        }

        chan.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(run_id, "subscriber channel full, dropping subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if event.is_terminal() {
            chan.terminated = true;
            chan.expires_at = Some(Instant::now() + self.ttl);
        }
    }

    /// Remove terminated runs whose retention window has passed. Returns
    /// the number of runs removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let channels = self.channels.read().await;
            for (run_id, entry) in channels.iter() {
                if entry.lock().await.is_expired(now) {
                    expired.push(run_id.clone());
                }
            }
        }
        if expired.is_empty() {
            return 0;
        }
        let mut channels = self.channels.write().await;
        let mut records = self.records.write().await;
        let mut removed = 0;
        for run_id in expired {
            if channels.remove(&run_id).is_some() {
                removed += 1;
            }
            records.remove(&run_id);
            tracing::debug!(run_id, "expired run swept");
        }
        removed
    }

    /// Number of stored events for a run (test/introspection helper).
    pub async fn event_count(&self, run_id: &str) -> usize {
        match self.existing_channel(run_id).await {
            Some(entry) => entry.lock().await.events.len(),
            None => 0,
        }
    }
}

#[async_trait]
impl EventStreamStore for MemoryBackend {
    async fn publish(&self, run_id: &str, event: &Event) -> Result<(), BackendError> {
        let entry = self.channel(run_id).await;
        let mut chan = entry.lock().await;
        if chan.terminated {
            return Err(BackendError::AlreadyTerminal(run_id.to_string()));
        }
        self.append_and_fan_out(&mut chan, run_id, event);
        tracing::debug!(
            run_id,
            event_type = %event.kind(),
            sequence = event.sequence,
            subscribers = chan.subscribers.len(),
            "event published"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        run_id: &str,
        opts: SubscribeOptions,
    ) -> Result<EventStream, BackendError> {
        let entry = self.channel(run_id).await;

        // Snapshot and registration happen under the run mutex so the
        // replay/live handover has no gap and no duplicate.
        let (snapshot, rx) = {
            let mut chan = entry.lock().await;
            let snapshot: Vec<Event> = if opts.include_historical {
                chan.events
                    .iter()
                    .filter(|e| e.sequence >= opts.from_sequence)
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            let rx = if chan.terminated {
                None
            } else {
                let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
                chan.subscribers.push(tx);
                Some(rx)
            };
            (snapshot, rx)
        };

        let stream = async_stream::stream! {
            let mut next_seq = opts.from_sequence;
            for event in snapshot {
                let terminal = event.is_terminal();
                next_seq = event.sequence + 1;
                yield event;
                if terminal {
                    return;
                }
            }
            let Some(mut rx) = rx else { return };
            while let Some(event) = rx.recv().await {
                if event.sequence < next_seq {
                    continue;
                }
                next_seq = event.sequence + 1;
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    break;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn get_events(
        &self,
        run_id: &str,
        from_sequence: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, BackendError> {
        let entry = match self.existing_channel(run_id).await {
            Some(entry) => entry,
            None => {
                if self.records.read().await.contains_key(run_id) {
                    return Ok(Vec::new());
                }
                return Err(BackendError::RunNotFound(run_id.to_string()));
            }
        };
        let chan = entry.lock().await;
        let mut events: Vec<Event> = chan
            .events
            .iter()
            .filter(|e| e.sequence >= from_sequence)
            .cloned()
            .collect();
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn trim(&self, run_id: &str) -> Result<(), BackendError> {
        // Dropping the entry closes every subscriber channel, which ends
        // their streams.
        self.channels.write().await.remove(run_id);
        tracing::debug!(run_id, "run events trimmed");
        Ok(())
    }
}

#[async_trait]
impl RunRecordStore for MemoryBackend {
    async fn put_run(&self, run: &Run) -> Result<(), BackendError> {
        self.records
            .write()
            .await
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, BackendError> {
        Ok(self.records.read().await.get(run_id).cloned())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, BackendError> {
        let records = self.records.read().await;
        let mut runs: Vec<Run> = records.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), BackendError> {
        self.records.write().await.remove(run_id);
        self.trim(run_id).await
    }

    async fn commit_terminal(&self, run: &Run, terminal: &Event) -> Result<(), BackendError> {
        let entry = self.channel(&run.run_id).await;
        // Single critical section: the record update and the terminal
        // event land together or not at all.
        let mut records = self.records.write().await;
        let mut chan = entry.lock().await;
        if chan.terminated {
            return Err(BackendError::AlreadyTerminal(run.run_id.clone()));
        }
        self.append_and_fan_out(&mut chan, &run.run_id, terminal);
        records.insert(run.run_id.clone(), run.clone());
        tracing::debug!(
            run_id = %run.run_id,
            status = ?run.status,
            sequence = terminal.sequence,
            "terminal committed"
        );
        Ok(())
    }
}
