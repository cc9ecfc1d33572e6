//! Persisted entities: snapshot, restore, schema migration, and the
//! periodic/scheduled/final persist machinery.
//!
//! # Components
//!
//! - [`PersistedStore`] - Database seam; payloads are opaque blobs
//! - [`InMemoryStore`] - Store backed by a map, for tests and demos
//! - [`PersistedEntity`] - Entity layer adding state snapshot/restore with a
//!   `[min, max]` schema version range
//! - [`MigrationChain`] - Ordered per-version migration steps
//! - [`CompressionAlgorithm`] - Self-identifying byte-framed compression

mod compress;
mod entity;
mod harness;
mod migration;
mod store;

pub use compress::{compress, decompress, CompressionAlgorithm};
pub use entity::PersistedEntity;
pub use migration::MigrationChain;
pub use store::{InMemoryStore, PersistError, PersistedPayload, PersistedStore, SchemaVersion};

pub(crate) use harness::{PersistDriver, PersistedKindRuntime};
