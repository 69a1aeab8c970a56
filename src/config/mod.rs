//! Configuration subsystem.
//!
//! # Data Flow
//! ```text
//! ConfigSource (source.rs)
//!     → RawConfig snapshot (schema.rs)
//!     → builder.rs
//!         → filters (filter.rs), isolated per resource
//!         → cluster checks (validation.rs)
//!         → route parse + checks (parsed.rs, route_validator.rs)
//!     → DynamicConfigRoot + ConfigErrors (errors.rs)
//!
//! Settings file:
//!     loader.rs → ProxySettings (schema.rs) → validation.rs
//! ```
//!
//! # Design Decisions
//! - An invalid resource is dropped and reported; the rest of the snapshot
//!   still applies
//! - Settings fields all have defaults to allow minimal files

pub mod builder;
pub mod errors;
pub mod filter;
pub mod loader;
pub mod parsed;
pub mod route_validator;
pub mod schema;
pub mod source;
pub mod validation;

pub use schema::{Cluster, Destination, ProxyRoute, ProxySettings, RawConfig};
