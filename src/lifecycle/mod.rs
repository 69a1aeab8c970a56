//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     ProxyRuntime::builder → registries → coordinator/worker
//!     → config manager → dispatcher
//!
//! Timers (scheduler.rs):
//!     schedule_entity(key, period) → per-entity task → action(entity)
//!
//! Shutdown (shutdown.rs):
//!     trigger → reconciliation loop exits → probers and timers stopped
//! ```
//!
//! # Design Decisions
//! - Each scheduled entity gets its own task; changing a period re-arms that
//!   task's timer in place, one new period from the change
//! - Shutdown is idempotent

pub mod scheduler;
pub mod shutdown;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{ProxyRuntime, ProxyRuntimeBuilder};
