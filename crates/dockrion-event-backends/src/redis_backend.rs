//! Redis Streams backend.
//!
//! Production backend for multi-instance deployments: events are appended
//! to one Redis Stream per run (`dockrion:stream:{run_id}`), run records
//! live in a hash (`dockrion:run:{run_id}`), and `dockrion:runs:index` is
//! a sorted set keyed by creation time for enumeration.
//!
//! Ordering is authoritative on the producer-assigned `seq` field, never
//! on the Redis entry id — replay stays stable across failover. Reads are
//! retried with exponential backoff; writes get a small bounded retry
//! budget and then surface [`BackendError::Unavailable`] to the producer
//! side.

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, Runtime};
use dockrion_events_contract::{
    BackendError, Event, EventStream, EventStreamStore, RedisConfig, Run, RunRecordStore,
    SubscribeOptions, TtlPolicy,
};
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use std::time::Duration;

const RUNS_INDEX_KEY: &str = "dockrion:runs:index";

/// XREAD block window. Finite so the tail loop can notice dropped runs
/// and cancelled subscriptions.
const XREAD_BLOCK_MS: u64 = 1000;

/// Total write attempts before a publish is surfaced as unavailable.
const WRITE_ATTEMPTS: u32 = 3;

/// Consecutive read failures tolerated by a tailing subscriber before the
/// stream is closed (the client reconnects with `from_sequence`).
const MAX_TAIL_FAILURES: u32 = 10;

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);

fn stream_key(run_id: &str) -> String {
    format!("dockrion:stream:{run_id}")
}

fn run_key(run_id: &str) -> String {
    format!("dockrion:run:{run_id}")
}

fn backoff(attempt: u32) -> Duration {
    let exp = RETRY_BASE.saturating_mul(2u32.saturating_pow(attempt));
    exp.min(RETRY_MAX)
}

fn unavailable(e: impl std::fmt::Display) -> BackendError {
    BackendError::Unavailable(e.to_string())
}

/// Decode one stream entry back into an [`Event`].
///
/// Entries with a missing or unparsable `payload` field are skipped by
/// callers; they cannot be delivered in order anyway.
fn parse_entry(entry: &StreamId) -> Option<Event> {
    let payload: String = entry.get("payload")?;
    match serde_json::from_str::<Event>(&payload) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(entry_id = %entry.id, error = %e, "skipping undecodable stream entry");
            None
        }
    }
}

/// Redis Streams event backend.
pub struct RedisBackend {
    pool: Pool,
    stream_ttl_seconds: u64,
    max_events_per_run: usize,
    ttl_policy: TtlPolicy,
}

impl RedisBackend {
    /// Build a backend and its connection pool from configuration. No
    /// connection is made until the first command.
    pub fn new(config: &RedisConfig) -> Result<Self, BackendError> {
        let mut pool_config = deadpool_redis::Config::from_url(&config.url);
        pool_config.pool = Some(deadpool_redis::PoolConfig::new(config.connection_pool_size));
        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(unavailable)?;
        Ok(Self {
            pool,
            stream_ttl_seconds: config.stream_ttl_seconds,
            max_events_per_run: config.max_events_per_run.max(1),
            ttl_policy: config.ttl_policy,
        })
    }

    async fn conn(&self) -> Result<Connection, BackendError> {
        self.pool.get().await.map_err(unavailable)
    }

    /// Round-trip health probe.
    pub async fn ping(&self) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn terminal_recorded(
        &self,
        conn: &mut Connection,
        run_id: &str,
    ) -> Result<bool, BackendError> {
        let marker: Option<u64> = redis::cmd("HGET")
            .arg(run_key(run_id))
            .arg("terminal_seq")
            .query_async(conn)
            .await
            .map_err(unavailable)?;
        Ok(marker.is_some())
    }

    /// Build the publish pipeline for one event: XADD with approximate
    /// capping, plus TTL / terminal bookkeeping as configured.
    fn publish_pipeline(&self, run_id: &str, event: &Event, payload: &str) -> redis::Pipeline {
        let skey = stream_key(run_id);
        let mut pipe = redis::pipe();
        pipe.cmd("XADD")
            .arg(&skey)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_events_per_run)
            .arg("*")
            .arg("seq")
            .arg(event.sequence)
            .arg("type")
            .arg(event.kind().as_str().as_ref())
            .arg("ts")
            .arg(event.ts)
            .arg("payload")
            .arg(payload)
            .ignore();
        if self.ttl_policy == TtlPolicy::Sliding {
            pipe.cmd("EXPIRE")
                .arg(&skey)
                .arg(self.stream_ttl_seconds)
                .ignore();
        }
        if event.is_terminal() {
            pipe.cmd("HSET")
                .arg(run_key(run_id))
                .arg("terminal_seq")
                .arg(event.sequence)
                .ignore();
            pipe.cmd("EXPIRE")
                .arg(&skey)
                .arg(self.stream_ttl_seconds)
                .ignore();
            pipe.cmd("EXPIRE")
                .arg(run_key(run_id))
                .arg(self.stream_ttl_seconds)
                .ignore();
        }
        pipe
    }

    async fn fetch_range(&self, run_id: &str) -> Result<StreamRangeReply, BackendError> {
        let mut last_err = None;
        for attempt in 0..WRITE_ATTEMPTS {
            let mut conn = match self.conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
            };
            let range: Result<StreamRangeReply, _> = redis::cmd("XRANGE")
                .arg(stream_key(run_id))
                .arg("-")
                .arg("+")
                .query_async(&mut conn)
                .await;
            match range {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    last_err = Some(unavailable(e));
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
        Err(last_err.unwrap_or(BackendError::Closed))
    }

    async fn load_run(
        &self,
        conn: &mut Connection,
        run_id: &str,
    ) -> Result<Option<Run>, BackendError> {
        let data: Option<String> = redis::cmd("HGET")
            .arg(run_key(run_id))
            .arg("data")
            .query_async(conn)
            .await
            .map_err(unavailable)?;
        match data {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| BackendError::Serialization(e.to_string())),
        }
    }
}

#[async_trait]
impl EventStreamStore for RedisBackend {
    async fn publish(&self, run_id: &str, event: &Event) -> Result<(), BackendError> {
        let payload =
            serde_json::to_string(event).map_err(|e| BackendError::Serialization(e.to_string()))?;

        let mut last_err = None;
        for attempt in 0..WRITE_ATTEMPTS {
            let mut conn = match self.conn().await {
                Ok(conn) => conn,
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
            };
            if self.terminal_recorded(&mut conn, run_id).await? {
                return Err(BackendError::AlreadyTerminal(run_id.to_string()));
            }
            let pipe = self.publish_pipeline(run_id, event, &payload);
            let written: Result<(), _> = pipe.query_async(&mut conn).await;
            match written {
                Ok(()) => {
                    tracing::debug!(
                        run_id,
                        event_type = %event.kind(),
                        sequence = event.sequence,
                        "event published"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(run_id, attempt, error = %e, "redis publish failed");
                    last_err = Some(unavailable(e));
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
        Err(last_err.unwrap_or(BackendError::Closed))
    }

    async fn subscribe(
        &self,
        run_id: &str,
        opts: SubscribeOptions,
    ) -> Result<EventStream, BackendError> {
        let pool = self.pool.clone();
        let run_id = run_id.to_string();
        let skey = stream_key(&run_id);
        let rkey = run_key(&run_id);

        // Replay phase runs eagerly so connection problems surface to the
        // caller instead of producing a silently empty stream.
        let mut last_id = "0-0".to_string();
        let mut next_seq = opts.from_sequence;
        let mut stream_terminated = false;
        let mut replay = Vec::new();
        let range = self.fetch_range(&run_id).await?;
        for entry in &range.ids {
            last_id = entry.id.clone();
            let Some(event) = parse_entry(entry) else {
                continue;
            };
            stream_terminated |= event.is_terminal();
            if event.sequence < next_seq {
                continue;
            }
            next_seq = event.sequence + 1;
            if opts.include_historical {
                replay.push(event);
            }
        }

        let stream = async_stream::stream! {
            for event in replay {
                yield event;
            }
            if stream_terminated {
                // The terminal event is already stored; a subscription past
                // it (or a live-only one) closes immediately.
                return;
            }

            let mut failures = 0u32;
            loop {
                let mut conn = match pool.get().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        failures += 1;
                        if failures > MAX_TAIL_FAILURES {
                            tracing::warn!(run_id = %run_id, error = %e, "subscriber giving up after repeated failures");
                            return;
                        }
                        tokio::time::sleep(backoff(failures)).await;
                        continue;
                    }
                };
                let read: Result<Option<StreamReadReply>, _> = redis::cmd("XREAD")
                    .arg("BLOCK")
                    .arg(XREAD_BLOCK_MS)
                    .arg("STREAMS")
                    .arg(&skey)
                    .arg(&last_id)
                    .query_async(&mut conn)
                    .await;
                match read {
                    Ok(Some(reply)) => {
                        failures = 0;
                        for key in &reply.keys {
                            for entry in &key.ids {
                                last_id = entry.id.clone();
                                let Some(event) = parse_entry(entry) else {
                                    continue;
                                };
                                if event.sequence < next_seq {
                                    continue;
                                }
                                next_seq = event.sequence + 1;
                                let terminal = event.is_terminal();
                                yield event;
                                if terminal {
                                    return;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        failures = 0;
                        // Block window elapsed with no entries. If both the
                        // stream and the run record are gone (TTL expiry or
                        // deletion) there is nothing left to wait for.
                        let gone: Result<(i64, i64), _> = redis::pipe()
                            .cmd("EXISTS").arg(&skey)
                            .cmd("EXISTS").arg(&rkey)
                            .query_async(&mut conn)
                            .await;
                        if matches!(gone, Ok((0, 0))) {
                            return;
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        if failures > MAX_TAIL_FAILURES {
                            tracing::warn!(run_id = %run_id, error = %e, "subscriber giving up after repeated failures");
                            return;
                        }
                        tokio::time::sleep(backoff(failures)).await;
                    }
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
        let range = self.fetch_range(run_id).await?;
        if range.ids.is_empty() {
            let mut conn = self.conn().await?;
            if self.load_run(&mut conn, run_id).await?.is_none() {
                return Err(BackendError::RunNotFound(run_id.to_string()));
            }
        }
        let mut events: Vec<Event> = range
            .ids
            .iter()
            .filter_map(parse_entry)
            .filter(|e| e.sequence >= from_sequence)
            .collect();
        events.sort_by_key(|e| e.sequence);
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn trim(&self, run_id: &str) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(stream_key(run_id))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        tracing::debug!(run_id, "run events trimmed");
        Ok(())
    }
}

#[async_trait]
impl RunRecordStore for RedisBackend {
    async fn put_run(&self, run: &Run) -> Result<(), BackendError> {
        let data =
            serde_json::to_string(run).map_err(|e| BackendError::Serialization(e.to_string()))?;
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.cmd("HSET")
            .arg(run_key(&run.run_id))
            .arg("data")
            .arg(&data)
            .arg("status")
            .arg(format!("{:?}", run.status).to_uppercase())
            .ignore()
            .cmd("ZADD")
            .arg(RUNS_INDEX_KEY)
            .arg(run.created_at)
            .arg(&run.run_id)
            .ignore();
        let written: Result<(), _> = pipe.query_async(&mut conn).await;
        written.map_err(unavailable)?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>, BackendError> {
        let mut conn = self.conn().await?;
        self.load_run(&mut conn, run_id).await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, BackendError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        // -1 means "to the end" in ZREVRANGE; clamp oversized limits to it.
        let stop: i64 = i64::try_from(limit)
            .ok()
            .and_then(|l| l.checked_sub(1))
            .unwrap_or(-1);
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(RUNS_INDEX_KEY)
            .arg(0)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            // Hashes expired by TTL drop out of the listing; the index
            // entry is lazily ignored.
            if let Some(run) = self.load_run(&mut conn, &id).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    async fn delete_run(&self, run_id: &str) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.cmd("DEL")
            .arg(run_key(run_id))
            .ignore()
            .cmd("DEL")
            .arg(stream_key(run_id))
            .ignore()
            .cmd("ZREM")
            .arg(RUNS_INDEX_KEY)
            .arg(run_id)
            .ignore();
        let deleted: Result<(), _> = pipe.query_async(&mut conn).await;
        deleted.map_err(unavailable)?;
        Ok(())
    }

    async fn commit_terminal(&self, run: &Run, terminal: &Event) -> Result<(), BackendError> {
        let payload = serde_json::to_string(terminal)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;
        let data =
            serde_json::to_string(run).map_err(|e| BackendError::Serialization(e.to_string()))?;

        let mut conn = self.conn().await?;
        // The run manager serializes terminal commits per run, so a plain
        // read-then-MULTI/EXEC suffices here.
        if self.terminal_recorded(&mut conn, &run.run_id).await? {
            return Err(BackendError::AlreadyTerminal(run.run_id.clone()));
        }

        let skey = stream_key(&run.run_id);
        let rkey = run_key(&run.run_id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XADD")
            .arg(&skey)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_events_per_run)
            .arg("*")
            .arg("seq")
            .arg(terminal.sequence)
            .arg("type")
            .arg(terminal.kind().as_str().as_ref())
            .arg("ts")
            .arg(terminal.ts)
            .arg("payload")
            .arg(&payload)
            .ignore()
            .cmd("HSET")
            .arg(&rkey)
            .arg("data")
            .arg(&data)
            .arg("status")
            .arg(format!("{:?}", run.status).to_uppercase())
            .arg("terminal_seq")
            .arg(terminal.sequence)
            .ignore()
            .cmd("EXPIRE")
            .arg(&skey)
            .arg(self.stream_ttl_seconds)
            .ignore()
            .cmd("EXPIRE")
            .arg(&rkey)
            .arg(self.stream_ttl_seconds)
            .ignore();
        let committed: Result<(), _> = pipe.query_async(&mut conn).await;
        committed.map_err(unavailable)?;
        tracing::debug!(
            run_id = %run.run_id,
            status = ?run.status,
            sequence = terminal.sequence,
            "terminal committed"
        );
        Ok(())
    }
}
