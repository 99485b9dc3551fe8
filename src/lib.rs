//! # streamwire
//!
//! Multiplexed streaming RPC over a single ordered byte stream.
//!
//! Many independent streams share one connection. Each stream is opened
//! with an INIT handshake that fixes its serialization and compression,
//! carries application messages in DATA frames under a credit-based
//! window replenished by FEEDBACK frames, and ends with CLOSE (graceful)
//! or RESET (abort). All four RPC call shapes map onto streams: unary,
//! client streaming, server streaming and bidirectional.
//!
//! ## Architecture
//!
//! - **Wire format** ([`protocol`]): 16-byte big-endian header plus a
//!   protobuf meta body or opaque DATA payload
//! - **Flow control** ([`flow_control`]): per-stream send and receive windows
//! - **Lifecycle** ([`stream`]): sans-io state machine per stream
//! - **Runtime** ([`Connection`]): read loop, batching writer task and
//!   server handler pool
//!
//! ## Example
//!
//! ```ignore
//! use streamwire::{CallOptions, Connection, Serialization, ServiceRegistry};
//!
//! #[tokio::main]
//! async fn main() -> streamwire::Result<()> {
//!     let mut services = ServiceRegistry::new();
//!     services.register_server_streaming("/feed/Tail", |_ctx, req: TailRequest, mut out| async move {
//!         for line in read_lines(&req.path) {
//!             out.send(&line).await?;
//!         }
//!         Ok(())
//!     });
//!
//!     let (client_io, server_io) = tokio::io::duplex(256 * 1024);
//!     let _server = Connection::builder().server().services(services).build(server_io)?;
//!     let client = Connection::builder().build(client_io)?;
//!
//!     let options = CallOptions::new("/feed/Tail").serialization(Serialization::Json);
//!     let mut lines = client.server_streaming::<_, Line>(options, &request).await?;
//!     while let Some(line) = lines.recv().await? {
//!         println!("{}", line.text);
//!     }
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod handler;
pub mod protocol;
pub mod stream;
pub mod worker;
pub mod writer;

pub use call::{CallOptions, ClientStreamingCall, StreamReceiver, StreamSender};
pub use codec::{CodecRegistry, RawPayload, Serialization, StreamMessage};
pub use config::StreamConfig;
pub use connection::{Connection, ConnectionBuilder, Endpoint, StreamEvent};
pub use error::{ret, ErrorKind, Result, StreamwireError};
pub use handler::{CallContext, ServiceRegistry};
pub use stream::{CallShape, ResetOrigin, Role, StreamState, Termination};
