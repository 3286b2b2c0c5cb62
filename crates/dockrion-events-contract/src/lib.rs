//! Shared contracts for the dockrion event streaming core: event model,
//! emit policy, run records, backend capability traits, and configuration.

pub mod config;
pub mod event;
pub mod filter;
pub mod run;
pub mod storage;

pub use config::{
    AllowedEvents, BackendKind, CustomMode, EventsConfig, RedisConfig, StreamingConfig, TtlPolicy,
};
pub use event::{now_unix_millis, Event, EventKind, EventPayload};
pub use filter::{CustomEvents, EventsFilter, FilterError, CONFIGURABLE_EVENTS};
pub use run::{generate_run_id, validate_run_id, Run, RunError, RunIdError, RunStatus};
pub use storage::{
    BackendError, EventStream, EventStreamStore, RunRecordStore, StreamingBackend,
    SubscribeOptions,
};
