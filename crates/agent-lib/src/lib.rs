//! Core library for the Wings node agent.
//!
//! Long-running supervision and transport subsystems:
//! - crash guard: event-driven restarts with bounded backoff
//! - metrics emitter: periodic telemetry with overflow buffering
//! - console: per-workload log fan-out with replay and command injection
//! - transport: mTLS client for the control-plane API
//!
//! All of them depend on the container runtime only through the
//! [`runtime::Runtime`] trait.

pub mod console;
pub mod emitter;
pub mod files;
pub mod guard;
pub mod health;
pub mod models;
pub mod observability;
pub mod rcon;
pub mod runtime;
pub mod transport;

pub use health::{Condition, HealthTracker, LivenessReport, ReadinessReport, Subsystem};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
