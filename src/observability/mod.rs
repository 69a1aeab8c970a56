//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (cluster_id, route_id, ...)
//!       → logging.rs (subscriber setup)
//!
//! Dispatcher and health coordinator produce:
//!     → metrics.rs TelemetrySink (stream bytes/iops, request totals,
//!       latency, destination health)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Whatever `metrics` recorder the host installs
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows through request-path log events
//! - Telemetry is write-only; this crate never exposes an endpoint

pub mod logging;
pub mod metrics;
