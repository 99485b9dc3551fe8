//! Stream module - lifecycle of one multiplexed stream.
//!
//! - [`StreamSession`] - the sans-io state machine
//! - [`StreamState`], [`CallShape`], [`Role`] - what it tracks
//! - [`Termination`] - how a stream ended

mod session;
mod state;

pub use session::StreamSession;
pub use state::{CallShape, ResetOrigin, Role, StreamState, Termination};
