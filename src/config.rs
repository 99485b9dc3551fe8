//! Per-connection stream configuration.
//!
//! # Example
//!
//! ```
//! use streamwire::config::StreamConfig;
//!
//! let config = StreamConfig::from_json(r#"{"init_window_size": 131072, "stream_timeout_ms": 5000}"#).unwrap();
//! assert_eq!(config.init_window_size, 131072);
//! assert_eq!(config.feedback_threshold, 0.25);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, StreamwireError};
use crate::flow_control::{DEFAULT_FEEDBACK_THRESHOLD, DEFAULT_INIT_WINDOW_SIZE};
use crate::protocol::{DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};

/// Default capacity of each stream's inbound message queue.
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Default maximum concurrent server handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Default capacity of the lifecycle event broadcast.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Stream-level settings shared by every stream of a connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Window advertised in this side's INIT frames.
    ///
    /// May exceed `max_frame_size`; a single message must still fit in one
    /// frame, so sends larger than `max_frame_size - 16` are refused locally.
    pub init_window_size: u32,
    /// Fraction of the initial window that must be consumed before a
    /// FEEDBACK frame is sent.
    pub feedback_threshold: f64,
    /// Largest frame accepted or sent, header included.
    pub max_frame_size: u32,
    /// Deadline applied to streams whose call sets none. `None` disables it.
    pub stream_timeout_ms: Option<u64>,
    /// Messages buffered per stream between the read loop and the
    /// application. Raised to `init_window_size` where that is larger; see
    /// [`inbound_queue_bound`](Self::inbound_queue_bound).
    pub inbound_queue_capacity: usize,
    /// Server handlers allowed to run at once.
    pub max_concurrent_handlers: usize,
    /// Lifecycle events buffered per subscriber.
    pub event_capacity: usize,
}

impl StreamConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| StreamwireError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Default stream deadline.
    pub fn stream_timeout(&self) -> Option<Duration> {
        self.stream_timeout_ms.map(Duration::from_millis)
    }

    /// Capacity of each stream's inbound queue.
    ///
    /// Unread payload is bounded in bytes by the receive window, and every
    /// DATA frame carries at least one byte, so a queue holding
    /// `init_window_size` messages cannot fill while the peer respects the
    /// window.
    pub fn inbound_queue_bound(&self) -> usize {
        self.inbound_queue_capacity
            .max(self.init_window_size as usize)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.init_window_size == 0 || self.init_window_size > i32::MAX as u32 {
            return Err(StreamwireError::Config(format!(
                "init_window_size must be in 1..={}, got {}",
                i32::MAX,
                self.init_window_size
            )));
        }
        if !(self.feedback_threshold > 0.0 && self.feedback_threshold <= 1.0) {
            return Err(StreamwireError::Config(format!(
                "feedback_threshold must be in (0, 1], got {}",
                self.feedback_threshold
            )));
        }
        if (self.max_frame_size as usize) <= HEADER_SIZE {
            return Err(StreamwireError::Config(format!(
                "max_frame_size must exceed the {} byte header, got {}",
                HEADER_SIZE, self.max_frame_size
            )));
        }
        if self.stream_timeout_ms == Some(0) {
            return Err(StreamwireError::Config(
                "stream_timeout_ms must be positive when set".to_string(),
            ));
        }
        for (name, value) in [
            ("inbound_queue_capacity", self.inbound_queue_capacity),
            ("max_concurrent_handlers", self.max_concurrent_handlers),
            ("event_capacity", self.event_capacity),
        ] {
            if value == 0 {
                return Err(StreamwireError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            init_window_size: DEFAULT_INIT_WINDOW_SIZE,
            feedback_threshold: DEFAULT_FEEDBACK_THRESHOLD,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            stream_timeout_ms: None,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StreamConfig::default();
        config.validate().unwrap();
        assert_eq!(config.init_window_size, 65535);
        assert_eq!(config.max_frame_size, 10 * 1024 * 1024);
        assert_eq!(config.stream_timeout(), None);
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            StreamConfig::from_json(r#"{"feedback_threshold": 0.5, "stream_timeout_ms": 250}"#)
                .unwrap();
        assert_eq!(config.feedback_threshold, 0.5);
        assert_eq!(config.stream_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.init_window_size, DEFAULT_INIT_WINDOW_SIZE);
    }

    #[test]
    fn test_inbound_queue_covers_window() {
        let config = StreamConfig::default();
        assert_eq!(config.inbound_queue_bound(), 65535);

        let config = StreamConfig {
            init_window_size: 512,
            inbound_queue_capacity: 4096,
            ..StreamConfig::default()
        };
        assert_eq!(config.inbound_queue_bound(), 4096);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(StreamConfig::from_json(r#"{"init_window_size": 0}"#).is_err());
        assert!(StreamConfig::from_json(r#"{"feedback_threshold": 1.5}"#).is_err());
        assert!(StreamConfig::from_json(r#"{"max_frame_size": 16}"#).is_err());
        assert!(StreamConfig::from_json(r#"{"inbound_queue_capacity": 0}"#).is_err());
        assert!(StreamConfig::from_json("not json").is_err());
    }
}
