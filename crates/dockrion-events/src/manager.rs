//! Run lifecycle manager.
//!
//! Creates run records, spawns agent tasks with a bus-mode stream context
//! installed as ambient state, emits lifecycle events, enforces the run
//! duration cap, and drives cooperative cancellation.
//!
//! State machine: `PENDING -> RUNNING -> {COMPLETED, FAILED, CANCELLED}`.
//! Terminal transitions persist the run record together with the terminal
//! event in one logical commit (`commit_terminal`), serialized per run so
//! exactly one terminal ever wins.

use crate::bus::EventBus;
use crate::context::{scope_context, StreamContext};
use dockrion_events_contract::{
    generate_run_id, now_unix_millis, validate_run_id, BackendError, Event, EventPayload,
    EventsFilter, FilterError, Run, RunError, RunIdError, RunStatus, StreamingConfig,
};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Error code used when the run duration cap expires.
const TIMEOUT_CODE: &str = "TIMEOUT_ERROR";

/// Error code carried by the run record of a cancelled run.
const CANCELLED_CODE: &str = "CANCELLED";

/// Run manager failures.
#[derive(Debug, Error)]
pub enum RunManagerError {
    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run already exists: {0}")]
    AlreadyExists(String),

    #[error("run already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("run '{run_id}' cannot transition from {status:?}")]
    InvalidTransition { run_id: String, status: RunStatus },

    #[error("client-provided run ids are not allowed")]
    ClientIdsDisabled,

    #[error("run is not terminal yet: {0}")]
    NotTerminal(String),

    #[error(transparent)]
    InvalidRunId(#[from] RunIdError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// Terminal outcome of a run, as exposed by [`RunManager::get_result`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Output(Value),
    Error(RunError),
}

enum Outcome {
    Success { output: Value, latency: Duration },
    Failure(RunError),
    Timeout,
    ForcedCancel(Option<String>),
}

struct ActiveRun {
    context: Arc<StreamContext>,
    cancel: CancellationToken,
    cancel_reason: Arc<std::sync::Mutex<Option<String>>>,
    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
    /// Serializes terminal finalization per run.
    finalize_lock: Arc<Mutex<()>>,
}

impl ActiveRun {
    fn handles(&self) -> ActiveHandles {
        ActiveHandles {
            context: self.context.clone(),
            cancel: self.cancel.clone(),
            cancel_reason: self.cancel_reason.clone(),
            done_tx: self.done_tx.clone(),
            done_rx: self.done_rx.clone(),
            finalize_lock: self.finalize_lock.clone(),
        }
    }
}

#[derive(Clone)]
struct ActiveHandles {
    context: Arc<StreamContext>,
    cancel: CancellationToken,
    cancel_reason: Arc<std::sync::Mutex<Option<String>>>,
    done_tx: Arc<watch::Sender<bool>>,
    done_rx: watch::Receiver<bool>,
    finalize_lock: Arc<Mutex<()>>,
}

struct ManagerInner {
    bus: EventBus,
    config: StreamingConfig,
    filter: EventsFilter,
    agent_name: Option<String>,
    framework: Option<String>,
    active: Mutex<HashMap<String, ActiveRun>>,
}

/// Coordinates run lifecycle on top of an [`EventBus`].
#[derive(Clone)]
pub struct RunManager {
    inner: Arc<ManagerInner>,
}

impl RunManager {
    /// Build a manager. Fails if the configured events filter is invalid.
    pub fn new(bus: EventBus, config: StreamingConfig) -> Result<Self, RunManagerError> {
        let filter = config.events_filter()?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                bus,
                config,
                filter,
                agent_name: None,
                framework: None,
                active: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Default agent identity stamped onto `started` events. Builder-style;
    /// call before the manager is cloned or handed out.
    pub fn with_agent_identity(
        mut self,
        agent_name: Option<String>,
        framework: Option<String>,
    ) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.agent_name = agent_name;
            inner.framework = framework;
        }
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn filter(&self) -> &EventsFilter {
        &self.inner.filter
    }

    /// Allocate a run id and write the PENDING record.
    pub async fn create_run(&self, run_id: Option<String>) -> Result<Run, RunManagerError> {
        let run_id = match run_id {
            Some(id) => {
                if !self.inner.config.allow_client_ids {
                    return Err(RunManagerError::ClientIdsDisabled);
                }
                validate_run_id(&id)?;
                if self.inner.bus.get_run(&id).await?.is_some() {
                    return Err(RunManagerError::AlreadyExists(id));
                }
                id
            }
            None => generate_run_id(),
        };
        let run = Run::new(&run_id, self.inner.config.redis.stream_ttl_seconds);
        self.inner.bus.put_run(&run).await?;
        tracing::info!(run_id = %run_id, "run created");
        Ok(run)
    }

    /// Transition PENDING -> RUNNING, emit `started` at sequence 0, and
    /// spawn the agent task with a bus-mode context bound to the run.
    ///
    /// The agent observes cancellation through the token it receives; on
    /// expiry of `max_run_duration` the run fails with `TIMEOUT_ERROR`.
    pub async fn start<F, Fut>(
        &self,
        run_id: &str,
        payload: Value,
        agent: F,
    ) -> Result<(), RunManagerError>
    where
        F: FnOnce(Value, Arc<StreamContext>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, RunError>> + Send + 'static,
    {
        let inner = &self.inner;
        let mut run = inner
            .bus
            .get_run(run_id)
            .await?
            .ok_or_else(|| RunManagerError::RunNotFound(run_id.to_string()))?;
        if run.status != RunStatus::Pending {
            return Err(RunManagerError::InvalidTransition {
                run_id: run_id.to_string(),
                status: run.status,
            });
        }

        run.status = RunStatus::Running;
        run.started_at = Some(now_unix_millis());
        inner.bus.put_run(&run).await?;

        let context = Arc::new(
            StreamContext::bus(run_id, inner.filter.clone(), inner.bus.clone())
                .with_agent_identity(inner.agent_name.clone(), inner.framework.clone()),
        );
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let done_tx = Arc::new(done_tx);

        {
            let mut active = inner.active.lock().await;
            active.insert(
                run_id.to_string(),
                ActiveRun {
                    context: context.clone(),
                    cancel: cancel.clone(),
                    cancel_reason: Arc::new(std::sync::Mutex::new(None)),
                    done_tx: done_tx.clone(),
                    done_rx: done_rx.clone(),
                    finalize_lock: Arc::new(Mutex::new(())),
                },
            );
        }

        context.emit_started(None, None, None).await;
        tracing::info!(run_id, "run started");

        spawn_heartbeat_loop(
            context.clone(),
            done_rx,
            Duration::from_secs(inner.config.heartbeat_interval.max(1)),
        );

        let inner = self.inner.clone();
        let run_id = run_id.to_string();
        let max_run_duration = Duration::from_secs(inner.config.max_run_duration.max(1));
        let agent_fut = agent(payload, context.clone(), cancel.clone());
        tokio::spawn(async move {
            let started = Instant::now();
            let result =
                tokio::time::timeout(max_run_duration, scope_context(context, agent_fut)).await;
            let outcome = match result {
                Ok(Ok(output)) => Outcome::Success {
                    output,
                    latency: started.elapsed(),
                },
                Ok(Err(err)) => Outcome::Failure(err),
                Err(_) => {
                    cancel.cancel();
                    Outcome::Timeout
                }
            };
            inner.finalize(&run_id, outcome).await;
        });
        Ok(())
    }

    /// Cooperative cancellation. Signals the agent task, waits up to
    /// `cancel_grace_seconds` for it to finish, then forces the run into
    /// CANCELLED. If the task reports success before the grace expires,
    /// the run completes normally.
    pub async fn cancel(
        &self,
        run_id: &str,
        reason: Option<String>,
    ) -> Result<Run, RunManagerError> {
        let inner = &self.inner;
        let run = inner
            .bus
            .get_run(run_id)
            .await?
            .ok_or_else(|| RunManagerError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Err(RunManagerError::AlreadyTerminal(run_id.to_string()));
        }

        let handles = inner.active_handles(run_id).await;
        match handles {
            // No live task (PENDING, or the manager restarted): finalize
            // the record directly.
            None => {
                inner
                    .commit_detached_cancel(run, reason)
                    .await
                    .map_err(RunManagerError::Backend)?;
            }
            Some(handles) => {
                *lock_reason(&handles.cancel_reason) = reason.clone();
                handles.cancel.cancel();
                tracing::info!(run_id, ?reason, "cancellation requested");

                let grace = Duration::from_secs(inner.config.cancel_grace_seconds.max(1));
                let mut done = handles.done_rx.clone();
                let finished = tokio::time::timeout(grace, async move {
                    while !*done.borrow() {
                        if done.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await
                .is_ok();

                if !finished {
                    tracing::warn!(run_id, "cancel grace expired, forcing CANCELLED");
                    inner.finalize(run_id, Outcome::ForcedCancel(reason)).await;
                }
            }
        }

        inner
            .bus
            .get_run(run_id)
            .await?
            .ok_or_else(|| RunManagerError::RunNotFound(run_id.to_string()))
    }

    pub async fn get_status(&self, run_id: &str) -> Result<Run, RunManagerError> {
        self.inner
            .bus
            .get_run(run_id)
            .await?
            .ok_or_else(|| RunManagerError::RunNotFound(run_id.to_string()))
    }

    /// Terminal output or error; `None` while the run is still going.
    pub async fn get_result(&self, run_id: &str) -> Result<Option<RunOutcome>, RunManagerError> {
        let run = self.get_status(run_id).await?;
        Ok(match run.status {
            RunStatus::Completed => Some(RunOutcome::Output(run.result.unwrap_or(Value::Null))),
            RunStatus::Failed | RunStatus::Cancelled => Some(RunOutcome::Error(
                run.error
                    .unwrap_or_else(|| RunError::new("run did not complete", CANCELLED_CODE)),
            )),
            RunStatus::Pending | RunStatus::Running => None,
        })
    }

    /// Runs ordered newest-first.
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, RunManagerError> {
        Ok(self.inner.bus.list_runs(limit).await?)
    }

    /// Run counts by status.
    pub async fn stats(&self) -> Result<HashMap<RunStatus, usize>, RunManagerError> {
        let mut counts = HashMap::new();
        for run in self.inner.bus.list_runs(usize::MAX).await? {
            *counts.entry(run.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Remove a finished run: deletes the record and trims its events.
    pub async fn delete_run(&self, run_id: &str) -> Result<(), RunManagerError> {
        let run = self.get_status(run_id).await?;
        if !run.status.is_terminal() {
            return Err(RunManagerError::NotTerminal(run_id.to_string()));
        }
        self.inner.bus.delete_run(run_id).await?;
        tracing::info!(run_id, "run deleted");
        Ok(())
    }
}

impl ManagerInner {
    async fn active_handles(&self, run_id: &str) -> Option<ActiveHandles> {
        self.active.lock().await.get(run_id).map(ActiveRun::handles)
    }

    async fn remove_active(&self, run_id: &str) {
        self.active.lock().await.remove(run_id);
    }

    /// Cancel a run that has no live task: append a `cancelled` event after
    /// the last stored sequence and commit it with the record.
    async fn commit_detached_cancel(
        &self,
        mut run: Run,
        reason: Option<String>,
    ) -> Result<(), BackendError> {
        let sequence = match self.bus.get_events(&run.run_id, 0, None).await {
            Ok(events) => events.last().map_or(0, |e| e.sequence + 1),
            Err(BackendError::RunNotFound(_)) => 0,
            Err(e) => return Err(e),
        };
        let event = Event {
            run_id: run.run_id.clone(),
            sequence,
            ts: now_unix_millis(),
            payload: EventPayload::Cancelled {
                reason: reason.clone(),
            },
        };
        run.status = RunStatus::Cancelled;
        run.finished_at = Some(now_unix_millis());
        run.error = Some(RunError::new(
            reason.unwrap_or_else(|| "run cancelled".to_string()),
            CANCELLED_CODE,
        ));
        self.bus.commit_terminal(&run, &event).await?;
        tracing::info!(run_id = %run.run_id, "pending run cancelled");
        Ok(())
    }

    /// Terminal finalization. First caller wins; later callers observe the
    /// terminal record and return.
    async fn finalize(&self, run_id: &str, outcome: Outcome) {
        let Some(handles) = self.active_handles(run_id).await else {
            return;
        };
        let _committing = handles.finalize_lock.lock().await;

        let mut run = match self.bus.get_run(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                tracing::warn!(run_id, "finalize: run record disappeared");
                self.remove_active(run_id).await;
                return;
            }
            Err(e) => {
                tracing::error!(run_id, error = %e, "finalize: failed to load run record");
                self.remove_active(run_id).await;
                return;
            }
        };
        if run.status.is_terminal() {
            let _ = handles.done_tx.send(true);
            self.remove_active(run_id).await;
            return;
        }

        run.finished_at = Some(now_unix_millis());
        let payload = match outcome {
            Outcome::Success { output, latency } => {
                run.status = RunStatus::Completed;
                run.result = Some(output.clone());
                EventPayload::Complete {
                    output,
                    latency_seconds: Some(latency.as_secs_f64()),
                    metadata: None,
                }
            }
            Outcome::Failure(err) => {
                if handles.cancel.is_cancelled() {
                    // The agent bailed out after observing the cancellation
                    // signal; that is a cooperative cancel, not a failure.
                    let reason = lock_reason(&handles.cancel_reason).clone();
                    run.status = RunStatus::Cancelled;
                    run.error = Some(RunError::new(
                        reason
                            .clone()
                            .unwrap_or_else(|| "run cancelled".to_string()),
                        CANCELLED_CODE,
                    ));
                    EventPayload::Cancelled { reason }
                } else {
                    run.status = RunStatus::Failed;
                    run.error = Some(err.clone());
                    EventPayload::Error {
                        error: err.message,
                        code: err.code,
                        details: err.details,
                    }
                }
            }
            Outcome::Timeout => {
                let message = format!(
                    "run exceeded max_run_duration of {}s",
                    self.config.max_run_duration
                );
                run.status = RunStatus::Failed;
                run.error = Some(RunError::new(&message, TIMEOUT_CODE));
                EventPayload::Error {
                    error: message,
                    code: TIMEOUT_CODE.to_string(),
                    details: None,
                }
            }
            Outcome::ForcedCancel(reason) => {
                run.status = RunStatus::Cancelled;
                run.error = Some(RunError::new(
                    reason
                        .clone()
                        .unwrap_or_else(|| "run cancelled".to_string()),
                    CANCELLED_CODE,
                ));
                EventPayload::Cancelled { reason }
            }
        };

        match handles.context.seal(payload).await {
            Some(event) => match self.bus.commit_terminal(&run, &event).await {
                Ok(()) => {
                    tracing::info!(run_id, status = ?run.status, "run finalized");
                }
                Err(BackendError::AlreadyTerminal(_)) => {
                    tracing::debug!(run_id, "terminal already committed elsewhere");
                }
                Err(e) => {
                    tracing::error!(run_id, error = %e, "terminal commit failed");
                    let _ = self.bus.put_run(&run).await;
                }
            },
            None => {
                // The producer already emitted a terminal event through the
                // context; the stored terminal is authoritative for status.
                self.align_record_with_stored_terminal(&mut run).await;
                let _ = self.bus.put_run(&run).await;
            }
        }

        let _ = handles.done_tx.send(true);
        self.remove_active(run_id).await;
    }

    async fn align_record_with_stored_terminal(&self, run: &mut Run) {
        let Ok(events) = self.bus.get_events(&run.run_id, 0, None).await else {
            return;
        };
        let Some(terminal) = events.iter().rev().find(|e| e.is_terminal()) else {
            return;
        };
        match &terminal.payload {
            EventPayload::Complete { output, .. } => {
                run.status = RunStatus::Completed;
                run.result = Some(output.clone());
                run.error = None;
            }
            EventPayload::Error {
                error,
                code,
                details,
            } => {
                run.status = RunStatus::Failed;
                run.result = None;
                run.error = Some(RunError {
                    message: error.clone(),
                    code: code.clone(),
                    details: details.clone(),
                });
            }
            EventPayload::Cancelled { reason } => {
                run.status = RunStatus::Cancelled;
                run.error = Some(RunError::new(
                    reason
                        .clone()
                        .unwrap_or_else(|| "run cancelled".to_string()),
                    CANCELLED_CODE,
                ));
            }
            _ => {}
        }
    }
}

fn lock_reason(
    slot: &Arc<std::sync::Mutex<Option<String>>>,
) -> std::sync::MutexGuard<'_, Option<String>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Heartbeat loop for a RUNNING run. Subject to the filter; stops when the
/// run finalizes.
fn spawn_heartbeat_loop(
    context: Arc<StreamContext>,
    mut done: watch::Receiver<bool>,
    interval: Duration,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; heartbeats start one interval in.
        tick.tick().await;
        loop {
            tokio::select! {
                changed = done.changed() => {
                    if changed.is_err() || *done.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    context.emit_heartbeat().await;
                }
            }
        }
    });
}
