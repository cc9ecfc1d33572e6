//! Message traits, type-erased payloads, and routed envelopes.
//!
//! # Components
//!
//! - [`EntityMessage`] - Marker trait every routable message type satisfies
//! - [`AnyMessage`] / [`BoxMessage`] - Type-erased payload used by the
//!   routing layer; handlers downcast back to concrete types
//! - [`RoutedEnvelope`] - A payload plus routing metadata flowing through
//!   shards
//! - [`Codec`] - Wire serialization seam; payloads are opaque to the core

mod codec;
mod envelope;
mod traits;

pub use codec::{Codec, CodecError, EncodedMessage, JsonCodec};
pub use envelope::{Payload, RoutedEnvelope, RoutedKind};
pub use traits::{downcast, AnyMessage, BoxMessage, EntityMessage, NoResponse, TypeMismatch};
