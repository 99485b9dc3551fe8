//! Fluent configuration of a [`Connection`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch};

use super::{read_loop, Connection, Shared};
use crate::codec::CodecRegistry;
use crate::config::StreamConfig;
use crate::error::Result;
use crate::handler::ServiceRegistry;
use crate::worker::WorkerPool;
use crate::writer::{spawn_writer_task, WriterConfig};

/// Which end of the transport this connection is.
///
/// Only decides the parity of the stream ids this side allocates, so the
/// two ends never pick the same id. Both ends may open streams and serve
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endpoint {
    /// Allocates odd stream ids, starting at 1.
    #[default]
    Client,
    /// Allocates even stream ids, starting at 2.
    Server,
}

impl Endpoint {
    fn first_stream_id(self) -> u32 {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }
}

/// Builder for a [`Connection`].
///
/// ```ignore
/// let connection = Connection::builder()
///     .server()
///     .services(services)
///     .init_window_size(128 * 1024)
///     .stream_timeout(Duration::from_secs(30))
///     .build(socket)?;
/// ```
pub struct ConnectionBuilder {
    endpoint: Endpoint,
    config: StreamConfig,
    writer_config: WriterConfig,
    codecs: CodecRegistry,
    services: Option<ServiceRegistry>,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            endpoint: Endpoint::default(),
            config: StreamConfig::default(),
            writer_config: WriterConfig::default(),
            codecs: CodecRegistry::default(),
            services: None,
        }
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Shorthand for `endpoint(Endpoint::Server)`.
    pub fn server(self) -> Self {
        self.endpoint(Endpoint::Server)
    }

    /// Replace the whole stream configuration.
    pub fn config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    pub fn writer_config(mut self, config: WriterConfig) -> Self {
        self.writer_config = config;
        self
    }

    /// Serializations and compressions this side accepts.
    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Serve the methods in `services` on streams the peer opens.
    ///
    /// Without services every INIT request is rejected with ret 12.
    pub fn services(mut self, services: ServiceRegistry) -> Self {
        self.services = Some(services);
        self
    }

    /// Window advertised to the peer for each stream.
    ///
    /// Default: 65535
    pub fn init_window_size(mut self, size: u32) -> Self {
        self.config.init_window_size = size;
        self
    }

    /// Fraction of the window consumed before FEEDBACK is sent.
    ///
    /// Default: 0.25
    pub fn feedback_threshold(mut self, fraction: f64) -> Self {
        self.config.feedback_threshold = fraction;
        self
    }

    /// Deadline for streams whose call sets none.
    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_timeout_ms = Some(timeout.as_millis().min(u128::from(u64::MAX)) as u64);
        self
    }

    /// Largest frame accepted from the peer or sent to it, header included.
    ///
    /// Default: 10 MiB
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Server handlers allowed to run at once; further streams are
    /// rejected with ret 22.
    ///
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Messages buffered per stream. Never less than the advertised window,
    /// so a peer that respects the window cannot overflow it.
    ///
    /// Default: 1024
    pub fn inbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.inbound_queue_capacity = capacity;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Frames coalesced into one vectored write.
    ///
    /// Default: 64
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.writer_config.max_batch_size = size;
        self
    }

    /// Start the connection over a bidirectional byte stream.
    ///
    /// Must be called within a Tokio runtime.
    pub fn build<T>(self, io: T) -> Result<Connection>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        self.build_split(reader, writer)
    }

    /// Start the connection over separate read and write halves.
    ///
    /// This will:
    /// 1. Validate the configuration
    /// 2. Spawn the writer task
    /// 3. Spawn the read loop
    pub fn build_split<R, W>(self, reader: R, writer: W) -> Result<Connection>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.config.validate()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (writer, writer_task) = spawn_writer_task(writer, self.writer_config, shutdown_rx);
        let (events, _) = broadcast::channel(self.config.event_capacity);

        tracing::debug!(
            endpoint = ?self.endpoint,
            services = self.services.as_ref().map_or(0, ServiceRegistry::len),
            init_window_size = self.config.init_window_size,
            "connection starting"
        );

        let shared = Arc::new(Shared {
            endpoint: self.endpoint,
            workers: WorkerPool::new(self.config.max_concurrent_handlers),
            config: self.config,
            codecs: Arc::new(self.codecs),
            services: self.services.map(Arc::new),
            writer,
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(self.endpoint.first_stream_id()),
            events,
            closed: AtomicBool::new(false),
            shutdown,
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let reason = match read_loop(reader, &reader_shared).await {
                Ok(()) => "connection closed".to_string(),
                Err(e) => {
                    tracing::error!(error = %e, "read loop failed");
                    e.to_string()
                }
            };
            reader_shared.shutdown_streams(&reason, false).await;
        });

        let writer_shared = Arc::downgrade(&shared);
        tokio::spawn(async move {
            let failure = match writer_task.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                tracing::error!(error = %reason, "writer task failed");
                if let Some(shared) = writer_shared.upgrade() {
                    shared.shutdown_streams(&reason, false).await;
                }
            }
        });

        Ok(Connection { shared })
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_configuration() {
        let builder = ConnectionBuilder::new()
            .server()
            .init_window_size(1024)
            .feedback_threshold(0.5)
            .stream_timeout(Duration::from_millis(1500))
            .max_concurrent_handlers(8)
            .channel_capacity(16)
            .max_batch_size(4);

        assert_eq!(builder.endpoint, Endpoint::Server);
        assert_eq!(builder.config.init_window_size, 1024);
        assert_eq!(builder.config.feedback_threshold, 0.5);
        assert_eq!(builder.config.stream_timeout_ms, Some(1500));
        assert_eq!(builder.config.max_concurrent_handlers, 8);
        assert_eq!(builder.writer_config.channel_capacity, 16);
        assert_eq!(builder.writer_config.max_batch_size, 4);
    }

    #[test]
    fn test_endpoint_id_parity() {
        assert_eq!(Endpoint::Client.first_stream_id(), 1);
        assert_eq!(Endpoint::Server.first_stream_id(), 2);
        assert_eq!(Endpoint::default(), Endpoint::Client);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let (io, _peer) = tokio::io::duplex(64);
        let result = ConnectionBuilder::new().init_window_size(0).build(io);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_client_allocates_odd_ids() {
        let (io, _peer) = tokio::io::duplex(64);
        let connection = ConnectionBuilder::new().build(io).unwrap();
        assert_eq!(connection.shared.allocate_stream_id().unwrap(), 1);
        assert_eq!(connection.shared.allocate_stream_id().unwrap(), 3);
        assert_eq!(connection.live_streams(), 0);
        assert!(!connection.is_closed());
    }
}
