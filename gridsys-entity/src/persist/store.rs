// Layer 1: Standard library imports
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Display};

// Layer 2: Third-party crate imports
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

// Layer 3: Internal module imports
use crate::util::EntityId;

/// Schema version of a persisted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaVersion(pub u32);

impl Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl SchemaVersion {
    /// The next version up.
    pub const fn next(self) -> SchemaVersion {
        SchemaVersion(self.0 + 1)
    }
}

/// One persisted record as stored.
#[derive(Debug, Clone)]
pub struct PersistedPayload {
    /// Compressed, framed payload bytes.
    pub payload: Bytes,
    /// Schema version the payload was written at.
    pub schema_version: SchemaVersion,
    /// Wall-clock time of the write.
    pub persisted_at: DateTime<Utc>,
    /// Whether this was a final (shutdown) persist. A non-final restore
    /// means the previous incarnation crashed.
    pub is_final: bool,
}

/// Errors of the persistence pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// The backing store failed.
    #[error("persisted store operation failed")]
    Store {
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },

    /// Payload (de)serialization failed.
    #[error("persisted payload serialization failed")]
    Codec {
        #[source]
        source: serde_json::Error,
    },

    /// Compression or decompression failed.
    #[error("payload compression failed: {reason}")]
    Compression {
        /// What went wrong.
        reason: String,
    },

    /// The payload header identified an algorithm this build cannot read.
    #[error("unknown compression header byte {header}")]
    UnknownCompression {
        /// The offending header byte.
        header: u8,
    },

    /// The persisted version is newer than this build supports.
    #[error("persisted schema {persisted} is newer than supported {supported}")]
    SchemaTooNew {
        /// Version found in the store.
        persisted: SchemaVersion,
        /// Newest version this build writes.
        supported: SchemaVersion,
    },

    /// No migration step registered for a version inside the supported
    /// range.
    #[error("no migration step registered for {from}")]
    MigrationGap {
        /// The version lacking a step.
        from: SchemaVersion,
    },
}

impl PersistError {
    /// Wrap an arbitrary store error.
    pub fn store(source: impl Error + Send + Sync + 'static) -> Self {
        PersistError::Store { source: Box::new(source) }
    }
}

/// Database seam for persisted entities. Payloads are opaque to the store.
#[async_trait]
pub trait PersistedStore: Send + Sync + 'static {
    /// Load the newest record for `id`, if any.
    async fn load(&self, id: EntityId) -> Result<Option<PersistedPayload>, PersistError>;

    /// Write a record for `id`, replacing any previous one.
    async fn save(
        &self,
        id: EntityId,
        payload: Bytes,
        schema_version: SchemaVersion,
        is_final: bool,
    ) -> Result<(), PersistError>;
}

/// Store backed by an in-process map, for tests and demos.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<EntityId, PersistedPayload>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the stored record for `id`.
    pub fn get(&self, id: EntityId) -> Option<PersistedPayload> {
        self.entries.lock().get(&id).cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Seed a record directly, for restore tests.
    pub fn put(&self, id: EntityId, record: PersistedPayload) {
        self.entries.lock().insert(id, record);
    }
}

#[async_trait]
impl PersistedStore for InMemoryStore {
    async fn load(&self, id: EntityId) -> Result<Option<PersistedPayload>, PersistError> {
        Ok(self.entries.lock().get(&id).cloned())
    }

    async fn save(
        &self,
        id: EntityId,
        payload: Bytes,
        schema_version: SchemaVersion,
        is_final: bool,
    ) -> Result<(), PersistError> {
        self.entries.lock().insert(
            id,
            PersistedPayload { payload, schema_version, persisted_at: Utc::now(), is_final },
        );
        Ok(())
    }
}
