//! Handler registration and typed dispatch.
//!
//! There is no runtime reflection: each entity type registers its handlers
//! in [`Entity::register`](crate::entity::Entity::register) through the
//! [`DispatchTable`] builder, producing an immutable `TypeId -> thunk` map
//! per kind at startup.
//!
//! # Components
//!
//! - [`DispatchTable`] - Per-kind registration builder and dispatch map
//! - [`Handler`] / [`CommandHandler`] / [`AskHandler`] /
//!   [`ExplicitAskHandler`] / [`SyncHandler`] / [`SubscriberHandler`] /
//!   [`SubscriptionHandler`] - The five handler kinds (asks come in implicit
//!   and explicit flavors)

mod handlers;
mod table;

pub use handlers::{
    AskHandler, CommandHandler, ExplicitAskHandler, Handler, SubscriberHandler, SubscriptionHandler,
    SyncHandler,
};
pub use table::DispatchTable;
