//! Runtime registries.
//!
//! # Data Flow
//! ```text
//! Reconciler
//!     → ClusterManager / RouteManager (manager.rs)
//!         → ClusterInfo (cluster.rs): config swap, destination diff
//!             → DestinationInfo (destination.rs): config swap, health, counters
//!         → RouteInfo (route.rs): RouteConfig swap
//!
//! Request path (read only)
//!     → RouteInfo::config() → ClusterInfo::dynamic_state()
//!     → ConcurrencyGuard (guard.rs) around the upstream call
//! ```
//!
//! # Design Decisions
//! - Objects are created once per id and mutated in place, never replaced
//! - Every piece of content sits behind one `ArcSwap`; it is built fully
//!   before being stored
//! - Counters and health are atomics; no locks on the request path

pub mod cluster;
pub mod destination;
pub mod guard;
pub mod manager;
pub mod route;

use crate::runtime::cluster::ClusterInfo;
use crate::runtime::manager::ItemManager;
use crate::runtime::route::RouteInfo;

pub type ClusterManager = ItemManager<ClusterInfo>;
pub type RouteManager = ItemManager<RouteInfo>;
