//! Streaming configuration.
//!
//! All tunables live in one immutable record loaded at startup; there are
//! no mutable globals. Every field has a default so partial configuration
//! deserializes cleanly.

use crate::filter::{CustomEvents, EventsFilter, FilterError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which backend the event bus runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    InMemory,
    Redis,
}

/// When the per-run retention window starts counting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlPolicy {
    /// Expiry is set once, when the terminal event is committed.
    #[default]
    FixedPostMortem,
    /// Expiry is refreshed on every publish.
    Sliding,
}

/// Redis backend tuning. The in-memory backend reuses
/// `stream_ttl_seconds` and `max_events_per_run` as its retention window
/// and per-run cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub stream_ttl_seconds: u64,
    pub max_events_per_run: usize,
    pub connection_pool_size: usize,
    pub ttl_policy: TtlPolicy,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            stream_ttl_seconds: 3600,
            max_events_per_run: 1000,
            connection_pool_size: 10,
            ttl_policy: TtlPolicy::default(),
        }
    }
}

/// Allowed-events configuration: a preset name or an explicit list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowedEvents {
    Preset(String),
    List(Vec<String>),
}

/// Custom-event mode override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomMode {
    None,
    All,
    Explicit,
}

/// Event filtering configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// `None` means all events allowed.
    pub allowed: Option<AllowedEvents>,
    /// Overrides the custom mode inferred from `allowed`. `explicit` keeps
    /// the `custom:<name>` entries from the list.
    pub custom_mode: Option<CustomMode>,
}

/// The streaming core's configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub backend: BackendKind,
    pub redis: RedisConfig,
    /// Seconds between heartbeat events while a run is RUNNING.
    pub heartbeat_interval: u64,
    /// Hard cap on RUNNING, in seconds.
    pub max_run_duration: u64,
    /// Cooperative-cancel wait, in seconds.
    pub cancel_grace_seconds: u64,
    /// Whether clients may supply their own run ids.
    pub allow_client_ids: bool,
    pub events: EventsConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            redis: RedisConfig::default(),
            heartbeat_interval: 15,
            max_run_duration: 3600,
            cancel_grace_seconds: 30,
            allow_client_ids: true,
            events: EventsConfig::default(),
        }
    }
}

impl StreamingConfig {
    /// Resolve the configured [`EventsFilter`].
    pub fn events_filter(&self) -> Result<EventsFilter, FilterError> {
        let mut filter = match &self.events.allowed {
            None => EventsFilter::all(),
            Some(AllowedEvents::Preset(name)) => EventsFilter::preset(name)?,
            Some(AllowedEvents::List(entries)) => EventsFilter::from_list(entries)?,
        };
        if let Some(mode) = self.events.custom_mode {
            filter = match mode {
                CustomMode::None => filter.with_custom(CustomEvents::None),
                CustomMode::All => filter.with_custom(CustomEvents::All),
                // Explicit keeps whatever `custom:<name>` entries the list
                // provided (an empty set when a preset was used).
                CustomMode::Explicit => match filter.custom_events() {
                    CustomEvents::Explicit(_) => filter,
                    _ => filter.with_custom(CustomEvents::Explicit(BTreeSet::new())),
                },
            };
        }
        Ok(filter)
    }
}
