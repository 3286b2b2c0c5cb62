//! Event streaming core for agent runs.
//!
//! Delivers real-time execution events from long-running runs to remote
//! subscribers in two patterns:
//!
//! - **Direct streaming**: a queue-mode [`StreamContext`] collects events
//!   in-request; the transport drains and frames them. Nothing is stored.
//! - **Async runs**: the [`RunManager`] owns the run lifecycle; events
//!   flow through the [`EventBus`] into a backend (in-memory or Redis
//!   Streams) that supports ordered replay, reconnection and multi-
//!   subscriber fan-out.

pub use dockrion_events_contract as contract;

pub mod bus;
pub mod context;
pub mod manager;

pub use bus::{create_event_bus, EventBus};
pub use context::{
    current_context, make_bus_context, make_direct_context, scope_context, StreamContext,
};
pub use manager::{RunManager, RunManagerError, RunOutcome};
