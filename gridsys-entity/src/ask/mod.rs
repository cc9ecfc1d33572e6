//! Correlated request/reply between entities.
//!
//! An ask is a request with a typed reply and a timeout. The asking entity's
//! shard assigns a monotonic [`AskId`], keeps the pending promise, and routes
//! the envelope; the target's reply travels directly back to the owner shard
//! and resolves the promise by id, bypassing mailbox ordering.

// Layer 1: Standard library imports
use std::fmt::{self, Display};
use std::time::Duration;

// Layer 2: Third-party crate imports
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

// Layer 3: Internal module imports
use crate::message::{BoxMessage, EntityMessage, TypeMismatch};
use crate::pubsub::ChannelId;
use crate::shard::ShardRef;
use crate::util::EntityId;

/// Default wall-clock limit an asking entity waits for a reply.
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(10);

/// Correlation id of one ask, unique within the asking entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AskId(pub(crate) u64);

impl Display for AskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ask#{}", self.0)
    }
}

/// Correlation metadata carried by an ask envelope: who asked, under which
/// id, and which shard owns the pending promise.
#[derive(Debug, Clone)]
pub struct AskContext {
    /// Ask id, unique within `source`.
    pub ask_id: AskId,
    /// The asking entity.
    pub source: EntityId,
    /// Shard holding the promise; replies go straight here.
    pub(crate) reply_to: ShardRef,
}

/// Errors an ask can surface at the call site.
#[derive(Debug, Error)]
pub enum AskError {
    /// The target refused with a typed, application-defined payload.
    /// The target stays alive.
    #[error("ask refused by {target}")]
    Refused {
        /// The refusing entity.
        target: EntityId,
        /// Application-defined refusal payload.
        payload: BoxMessage,
    },

    /// The target's handler failed unexpectedly; the target was terminated.
    #[error("unexpected error in ask handler on {target}: {message}")]
    RemoteUnexpected {
        /// The failing entity.
        target: EntityId,
        /// Error type name on the target side.
        type_name: String,
        /// Error message.
        message: String,
        /// Stack trace, when the target captured one.
        stack_trace: Option<String>,
    },

    /// No reply arrived within the wall-clock limit. The target may still
    /// complete; its late reply is dropped as an unknown ask.
    #[error("ask to {target} timed out after {after:?}")]
    Timeout {
        /// The unresponsive entity.
        target: EntityId,
        /// The limit that elapsed.
        after: Duration,
    },

    /// The target could not be reached or died before replying.
    #[error("ask target {target} unavailable: {reason}")]
    TargetUnavailable {
        /// The unreachable entity.
        target: EntityId,
        /// Why.
        reason: String,
    },

    /// The reply payload had a different type than the caller expected.
    #[error("ask reply type mismatch")]
    ReplyType(#[from] TypeMismatch),
}

impl AskError {
    /// Whether this is a target-defined refusal rather than a failure of
    /// the machinery.
    pub fn is_refusal(&self) -> bool {
        matches!(self, AskError::Refused { .. })
    }
}

/// Outcome carried by a reply envelope.
#[derive(Debug)]
pub(crate) enum AskOutcome {
    /// Normal reply payload.
    Reply(BoxMessage),
    /// Subscribe accepted; the owner shard confirms the watch on sight.
    SubscribeAck { response: BoxMessage, target_channel: ChannelId },
    /// Unsubscribe processed; `found` is false for unknown subscribers,
    /// which is a soft outcome rather than an error.
    UnsubscribeAck { found: bool },
    /// Target refused; payload raised at the caller.
    Refused(BoxMessage),
    /// Non-refusal failure; the target actor was terminated.
    Unexpected { type_name: String, message: String, stack_trace: Option<String> },
    /// The target could not be reached or died before handling the ask.
    Unavailable { reason: String },
}

/// Reply envelope, sent directly to the shard owning the pending ask.
#[derive(Debug)]
pub(crate) struct AskReplyEnvelope {
    pub ask_id: AskId,
    /// The original asker; the owning shard resolves its entity state.
    pub asker: EntityId,
    /// The entity that produced the outcome.
    pub from: EntityId,
    pub outcome: AskOutcome,
}

/// What a resolved promise hands back to the asking entity.
#[derive(Debug)]
pub(crate) enum AskResolution {
    Reply(BoxMessage),
    SubscribeAck { response: BoxMessage, target_channel: ChannelId },
    UnsubscribeAck { found: bool },
}

/// A pending ask stored in the owning shard's entity state.
pub(crate) struct PendingAsk {
    pub target: EntityId,
    pub promise: oneshot::Sender<Result<AskResolution, AskError>>,
}

impl PendingAsk {
    /// A pending ask whose caller stopped waiting (timeout or termination)
    /// can be swept without resolving.
    pub fn is_abandoned(&self) -> bool {
        self.promise.is_closed()
    }
}

/// Handle given to explicit ask handlers; must be consumed by exactly one
/// of [`AskHandle::reply`] or [`AskHandle::refuse`].
///
/// Dropping the handle without replying fails the ask on the caller side
/// with an unexpected-error outcome; it does not terminate the target.
#[derive(Debug)]
pub struct AskHandle {
    inner: Option<AskContext>,
    from: EntityId,
}

impl AskHandle {
    pub(crate) fn new(ctx: AskContext, from: EntityId) -> Self {
        Self { inner: Some(ctx), from }
    }

    /// The asking entity.
    pub fn asker(&self) -> Option<EntityId> {
        self.inner.as_ref().map(|ctx| ctx.source)
    }

    /// Resolve the ask with a reply payload.
    pub fn reply<M: EntityMessage>(mut self, reply: M) {
        self.finish(AskOutcome::Reply(Box::new(reply)));
    }

    /// Fail the ask with a typed refusal; the caller sees
    /// [`AskError::Refused`].
    pub fn refuse<M: EntityMessage>(mut self, payload: M) {
        self.finish(AskOutcome::Refused(Box::new(payload)));
    }

    fn finish(&mut self, outcome: AskOutcome) {
        if let Some(ctx) = self.inner.take() {
            let envelope = AskReplyEnvelope { ask_id: ctx.ask_id, asker: ctx.source, from: self.from, outcome };
            if !ctx.reply_to.send(crate::shard::ShardMsg::AskReply(envelope)) {
                debug!(asker = %self.from, "dropping ask reply, owner shard is gone");
            }
        }
    }
}

impl Drop for AskHandle {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.finish(AskOutcome::Unexpected {
                type_name: "AskHandle".to_string(),
                message: "ask handle dropped without reply".to_string(),
                stack_trace: None,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ask_id_display() {
        assert_eq!(AskId(17).to_string(), "ask#17");
    }

    #[test]
    fn test_refusal_classifier() {
        let refusal = AskError::Refused {
            target: crate::util::EntityId::new(crate::util::EntityKind::new(1, "Player"), 1),
            payload: Box::new("nope".to_string()),
        };
        assert!(refusal.is_refusal());

        let timeout = AskError::Timeout {
            target: crate::util::EntityId::new(crate::util::EntityKind::new(1, "Player"), 1),
            after: DEFAULT_ASK_TIMEOUT,
        };
        assert!(!timeout.is_refusal());
    }

    #[test]
    fn test_pending_ask_abandoned_after_receiver_drop() {
        let (tx, rx) = oneshot::channel();
        let pending = PendingAsk {
            target: crate::util::EntityId::new(crate::util::EntityKind::new(1, "Player"), 2),
            promise: tx,
        };
        assert!(!pending.is_abandoned());
        drop(rx);
        assert!(pending.is_abandoned());
    }
}
