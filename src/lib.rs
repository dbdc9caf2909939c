//! # Telebridge - MCP Notification Bridge Core
//!
//! Telebridge sits between AI coding agents and an out-of-process Telegram
//! delivery bridge. It exposes an MCP tool surface, turns tool calls into
//! durable event files in a shared drop-zone, manages the delivery bridge's
//! lifecycle behind a single-flight ready gate, and surfaces user responses
//! (button callbacks, replies) back to the agent.
//!
//! ## Architecture
//!
//! Components are constructed once at startup by the [`runtime`] composition
//! root and injected where needed; cross-component notifications travel over
//! the [`bus`] instead of direct calls. Every external interaction goes
//! through the [`resilience`] fabric (pooled HTTP clients, retry with
//! backoff, circuit breakers) and is instrumented by the [`observability`]
//! stack.

// Core modules
pub mod bridge;
pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod responses;
pub mod runtime;
pub mod server;

// Cross-cutting infrastructure
pub mod alerting;
pub mod buffer_pool;
pub mod domain_types;
pub mod fs_optimizer;
pub mod observability;
pub mod ratelimit;
pub mod resilience;
pub mod security;
pub mod tasks;
pub mod time_provider;

// Re-export the types most callers need
pub use crate::bridge::{BridgeManager, BridgeStatus, EnsureOutcome};
pub use crate::config::Config;
pub use crate::dispatch::{ClientIdentity, Components, ToolDispatcher};
pub use crate::error::{CoreError, ErrorKind, Result};
pub use crate::events::{Event, EventDraft, EventPipeline, EventType};
pub use crate::responses::ResponseEngine;
pub use crate::runtime::CoreRuntime;
pub use crate::time_provider::{SharedTimeProvider, TimeProvider, production_time_provider};
