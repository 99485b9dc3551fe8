//! Handler module - serving streams the peer opens.
//!
//! Provides:
//! - [`ServiceRegistry`] - maps method names to handlers and call shapes
//! - [`CallContext`] - caller, method, metadata and deadline of a call
//!
//! # Example
//!
//! ```ignore
//! use streamwire::handler::ServiceRegistry;
//! use streamwire::StreamwireError;
//!
//! let mut services = ServiceRegistry::new();
//!
//! // One request, one response
//! services.register_unary("/kv/Get", |_ctx, key: Key| async move {
//!     lookup(&key).ok_or(StreamwireError::Rpc { ret: 404, msg: "no such key".into() })
//! });
//!
//! // Echo every message back until the client closes
//! services.register_bidi("/kv/Watch", |_ctx, mut rx, mut tx| async move {
//!     while let Some(key) = rx.recv().await? {
//!         tx.send(&lookup_value(&key)).await?;
//!     }
//!     Ok(())
//! });
//! ```

mod context;
mod registry;

pub use context::{CallContext, Completion, ServerCall};
pub use registry::{
    BidiHandler, BoxFuture, ClientStreamingHandler, Handler, ServerStreamingHandler, ServiceRegistry,
    UnaryHandler,
};
