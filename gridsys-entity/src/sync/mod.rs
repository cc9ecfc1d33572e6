//! Paired, in-order synchronize channels between two entities.
//!
//! A synchronize channel bypasses the mailbox: frames flow from the writing
//! entity through its shard straight into the reading entity's channel,
//! enabling phase-based protocols without handler re-entrancy. Frames are
//! at-most-once and in-order within a channel; an empty payload is EOF; each
//! direction half-closes independently.

mod channel;

pub use channel::{SyncChannel, SyncChannelState, SyncError, DEFAULT_SYNC_RECEIVE_TIMEOUT};

pub(crate) use channel::SyncFrame;
