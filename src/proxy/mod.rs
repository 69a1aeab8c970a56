//! Request forwarding subsystem.
//!
//! # Data Flow
//! ```text
//! Resolved route + incoming request
//!     → dispatcher.rs
//!         → affinity lookup / load balancing (destination)
//!         → ConcurrencyGuard (in-flight counters)
//!         → transforms.rs request transforms
//!         → forwarder.rs (hyper-util client, request timeout)
//!         → stream_copier.rs request body → destination
//!     ← response head
//!         → transforms.rs response transforms
//!         → affinity establish
//!         → stream_copier.rs response body → client
//!     → outcome → health coordinator, telemetry
//! ```
//!
//! # Design Decisions
//! - error.rs fixes one status per failure kind
//! - Only destination-originated failures feed passive health

pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod stream_copier;
pub mod transforms;
