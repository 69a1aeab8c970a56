//! Control plane: turns config snapshots into live runtime objects.
//!
//! # Data Flow
//! ```text
//! ConfigSource::get_config
//!     → DynamicConfigBuilder (filters, validation, policy checks)
//!     → config_manager.rs diff
//!         → ClusterManager / destinations / RouteManager
//!         → HealthProbeWorker, HealthCoordinator
//! ```

pub mod config_manager;
