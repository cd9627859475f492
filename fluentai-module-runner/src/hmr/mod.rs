//! Hot module reload
//!
//! An [`HmrConnection`] delivers [`HmrPayload`]s. Each runtime with hot
//! reload enabled processes them one at a time through an [`UpdateQueue`],
//! invalidating and re-executing the affected modules and notifying the
//! listeners registered through [`HotContext`].

pub mod client;
pub mod connection;
pub mod context;
pub mod handler;
pub mod payload;
pub mod queue;

pub use client::{AcceptCallback, DataCallback, HmrClient, HmrMessenger, HotData, Listener, ListenerId};
pub use connection::{HmrConnection, MemoryConnection, UpdateHandler};
pub use context::HotContext;
pub use handler::handle_hmr_payload;
pub(crate) use handler::create_hmr_handler;
pub use payload::{ErrorPayload, HmrPayload, Update, UpdateKind};
pub use queue::UpdateQueue;

/// Fired before the modules of an `update` payload are re-executed
pub const BEFORE_UPDATE_EVENT: &str = "hmr:before-update";
/// Fired after the accept callbacks of an `update` payload ran
pub const AFTER_UPDATE_EVENT: &str = "hmr:after-update";
/// Fired before entry points are re-executed
pub const BEFORE_FULL_RELOAD_EVENT: &str = "hmr:before-full-reload";
/// Fired before modules are pruned
pub const BEFORE_PRUNE_EVENT: &str = "hmr:before-prune";
/// Fired for server errors
pub const ERROR_EVENT: &str = "hmr:error";
/// Fired when a module invalidates its own update
pub const INVALIDATE_EVENT: &str = "hmr:invalidate";
