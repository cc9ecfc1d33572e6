// Layer 1: Standard library imports
use std::any::{type_name, Any};
use std::fmt::Debug;

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
// (none)

/// Marker trait for message types routable between entities.
///
/// Blanket-implemented for every `Clone + Send + Debug + 'static` type, so
/// plain structs and enums are messages without ceremony. `Clone` is required
/// because publish fan-out delivers the same payload to many local
/// subscribers.
///
/// # Example
/// ```rust
/// use gridsys_entity::message::EntityMessage;
///
/// #[derive(Debug, Clone)]
/// struct Ping { seq: u32 }
///
/// fn assert_message<M: EntityMessage>() {}
/// assert_message::<Ping>();
/// ```
pub trait EntityMessage: Clone + Send + Sync + Debug + 'static {}

impl<T: Clone + Send + Sync + Debug + 'static> EntityMessage for T {}

/// Object-safe view of an [`EntityMessage`], used wherever payloads travel
/// type-erased (envelopes, codecs, fallback handlers).
pub trait AnyMessage: Any + Send + Sync + Debug {
    /// Borrow as `Any` for inspection without consuming.
    fn as_any(&self) -> &dyn Any;

    /// Convert into `Any` for downcasting by value.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;

    /// Clone into a fresh boxed message.
    fn clone_boxed(&self) -> BoxMessage;

    /// Fully-qualified type name, for diagnostics and mismatch errors.
    fn message_type(&self) -> &'static str;
}

impl<T: EntityMessage> AnyMessage for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn clone_boxed(&self) -> BoxMessage {
        Box::new(self.clone())
    }

    fn message_type(&self) -> &'static str {
        type_name::<T>()
    }
}

/// A type-erased message payload.
pub type BoxMessage = Box<dyn AnyMessage>;

/// A payload arrived with a type the receiver did not expect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("expected message type {expected}, got {found}")]
pub struct TypeMismatch {
    /// The type the receiver asked for.
    pub expected: &'static str,
    /// The type actually carried by the payload.
    pub found: &'static str,
}

/// Downcast a boxed message back to its concrete type.
///
/// # Errors
///
/// Returns [`TypeMismatch`] naming both types when the payload is of a
/// different type. The payload is consumed either way.
///
/// # Example
/// ```rust
/// use gridsys_entity::message::{downcast, BoxMessage};
///
/// #[derive(Debug, Clone, PartialEq)]
/// struct Hello(String);
///
/// let boxed: BoxMessage = Box::new(Hello("hi".into()));
/// let hello: Hello = downcast(boxed).unwrap();
/// assert_eq!(hello, Hello("hi".into()));
/// ```
pub fn downcast<M: EntityMessage>(msg: BoxMessage) -> Result<M, TypeMismatch> {
    let found = msg.message_type();
    msg.into_any()
        .downcast::<M>()
        .map(|boxed| *boxed)
        .map_err(|_| TypeMismatch { expected: type_name::<M>(), found })
}

/// Default acknowledgement payload for operations without a meaningful
/// response (e.g. subscribe acks from entities that accept silently).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoResponse;
