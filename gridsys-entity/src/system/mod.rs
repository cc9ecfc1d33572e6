//! Node runtime: kind registration, shard startup, and configuration.
//!
//! # Components
//!
//! - [`EntityRuntime`] - Per-node entry point owning the local shards
//! - [`EntityRuntimeBuilder`] / [`KindConfig`] - Startup-time registration
//! - [`RuntimeOptions`] - Enumerated runtime configuration with defaults
//! - [`SystemError`] / [`ShardStartError`] - Startup and operational errors

mod config;
mod errors;
mod registry;
mod runtime;

pub use config::{
    RuntimeOptions, RuntimeOptionsBuilder, DEFAULT_MAX_CONCURRENT_ENTITY_SHUTDOWNS,
    DEFAULT_MIN_SCHEDULED_PERSIST_INTERVAL, DEFAULT_PERSISTED_MAX_CONCURRENT_SHUTDOWNS,
    DEFAULT_SHARD_SHUTDOWN_TIMEOUT, DEFAULT_SNAPSHOT_INTERVAL,
};
pub use errors::{EntitySpawnFailure, ShardStartError, SystemError};
pub use runtime::{EntityRuntime, EntityRuntimeBuilder, KindConfig, RegistryHandle};

pub(crate) use registry::ShardRegistry;
