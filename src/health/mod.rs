//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks:
//!     worker.rs (one prober per cluster, global probe limit)
//!     → active.rs ProbeClient (GET probe address + path)
//!     → active.rs policy (ConsecutiveFailures / StatusCode)
//!     → coordinator.rs → destination active health
//!
//! Passive health checks:
//!     Dispatcher finishes a proxied call
//!     → coordinator.rs → passive.rs policy
//!       (ConsecutiveFailures / TransportFailureRate)
//!     → destination passive health
//!     → Unhealthy: reactivation timer → Unknown
//!
//! Either path:
//!     → state.rs composite health changed
//!     → cluster healthy list recomputed
//! ```
//!
//! # Design Decisions
//! - Active and passive checks are independent dimensions; a destination is
//!   eligible unless an enabled dimension says Unhealthy
//! - Unknown counts as eligible
//! - Policies are looked up by name on every evaluation, so a cluster can
//!   switch policy without restarting anything

pub mod active;
pub mod coordinator;
pub mod passive;
pub mod state;
pub mod worker;
