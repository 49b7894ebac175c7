//! bisq rollout controller
//!
//! Runs tagged versions of one application side by side and routes
//! traffic to the active one.
//!
//! ## Architecture
//!
//! ```text
//! VersionSource ──> Catalog ──(VersionEvent)──> Reconciler ──> InstancePool
//!                                                                  │
//!                        admin listener ──> Reconciler         ProxyRouter <── proxy listener
//! ```
//!
//! ## Modules
//!
//! - `version`: tag classification and ordering
//! - `source`: git-backed and in-memory version sources
//! - `catalog`: cached tag lists and change events
//! - `instance`: per-version process supervision
//! - `pool` / `reconciler`: desired vs running convergence
//! - `proxy` / `admin`: the two HTTP listeners
//! - `server`: wiring and shutdown

pub mod admin;
pub mod catalog;
pub mod config;
pub mod error;
pub mod instance;
pub mod pool;
pub mod port;
pub mod proxy;
pub mod reconciler;
pub mod server;
pub mod source;
pub mod version;

pub use catalog::{Catalog, CatalogSnapshot, VersionEvent};
pub use config::Config;
pub use error::{ControllerError, Result};
pub use instance::{AppInstance, InstanceSpec};
pub use pool::InstancePool;
pub use reconciler::{ApplyReport, Reconciler};
pub use server::{Controller, ServerError};
pub use source::{GitSource, MockSource, VersionSource};
pub use version::{Version, VersionKind};
