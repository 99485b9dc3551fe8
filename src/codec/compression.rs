//! Compression registry keyed by `content_encoding` codes.
//!
//! Codes: `0` identity, `1` gzip, `3` zlib. Any other code may be claimed by
//! a custom [`Compressor`].

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};

use crate::error::{Result, StreamwireError};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

/// No compression.
pub const IDENTITY: i32 = 0;
/// Gzip (RFC 1952).
pub const GZIP: i32 = 1;
/// Zlib (RFC 1950).
pub const ZLIB: i32 = 3;

/// Default flate2 level for gzip and zlib.
pub const DEFAULT_LEVEL: u32 = 6;

/// Default cap on one decompressed payload.
pub const DEFAULT_MAX_DECOMPRESSED_SIZE: usize = DEFAULT_MAX_FRAME_SIZE as usize;

/// Per-message compression algorithm.
///
/// # Example
///
/// ```ignore
/// struct Lz4;
///
/// impl Compressor for Lz4 {
///     fn name(&self) -> &'static str { "lz4" }
///     fn compress(&self, data: Bytes) -> io::Result<Bytes> { /* ... */ }
///     fn decompress(&self, data: Bytes) -> io::Result<Bytes> { /* ... */ }
/// }
///
/// registry.register(7, Lz4);
/// ```
pub trait Compressor: Send + Sync + 'static {
    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    fn compress(&self, data: Bytes) -> io::Result<Bytes>;

    fn decompress(&self, data: Bytes) -> io::Result<Bytes>;
}

/// Pass-through. Zero-copy in both directions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Compressor for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    #[inline]
    fn compress(&self, data: Bytes) -> io::Result<Bytes> {
        Ok(data)
    }

    #[inline]
    fn decompress(&self, data: Bytes) -> io::Result<Bytes> {
        Ok(data)
    }
}

/// Gzip via flate2.
#[derive(Debug, Clone, Copy)]
pub struct Gzip {
    /// Compression level (0-9).
    pub level: u32,
    /// Largest payload `decompress` will produce.
    pub max_decompressed_size: usize,
}

impl Gzip {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
            ..Self::default()
        }
    }

    pub fn max_decompressed_size(mut self, limit: usize) -> Self {
        self.max_decompressed_size = limit;
        self
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
        }
    }
}

impl Compressor for Gzip {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: Bytes) -> io::Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        encoder.write_all(&data)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    fn decompress(&self, data: Bytes) -> io::Result<Bytes> {
        inflate(GzDecoder::new(&data[..]), self.max_decompressed_size)
    }
}

/// Zlib via flate2.
#[derive(Debug, Clone, Copy)]
pub struct Zlib {
    /// Compression level (0-9).
    pub level: u32,
    /// Largest payload `decompress` will produce.
    pub max_decompressed_size: usize,
}

impl Zlib {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
            ..Self::default()
        }
    }

    pub fn max_decompressed_size(mut self, limit: usize) -> Self {
        self.max_decompressed_size = limit;
        self
    }
}

impl Default for Zlib {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            max_decompressed_size: DEFAULT_MAX_DECOMPRESSED_SIZE,
        }
    }
}

impl Compressor for Zlib {
    fn name(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, data: Bytes) -> io::Result<Bytes> {
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        encoder.write_all(&data)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    fn decompress(&self, data: Bytes) -> io::Result<Bytes> {
        inflate(ZlibDecoder::new(&data[..]), self.max_decompressed_size)
    }
}

/// Read a decoder to the end, failing once the output passes `limit`.
fn inflate<R: Read>(decoder: R, limit: usize) -> io::Result<Bytes> {
    let mut out = Vec::new();
    decoder
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed payload exceeds {} bytes", limit),
        ));
    }
    Ok(Bytes::from(out))
}

/// Shared handle to a registered compressor.
#[derive(Clone)]
pub struct BoxedCompressor(Arc<dyn Compressor>);

impl BoxedCompressor {
    pub fn new<C: Compressor>(compressor: C) -> Self {
        Self(Arc::new(compressor))
    }

    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    pub fn compress(&self, data: Bytes) -> io::Result<Bytes> {
        self.0.compress(data)
    }

    pub fn decompress(&self, data: Bytes) -> io::Result<Bytes> {
        self.0.decompress(data)
    }
}

impl fmt::Debug for BoxedCompressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BoxedCompressor").field(&self.name()).finish()
    }
}

/// Compressors by `content_encoding` code.
///
/// Built once per process (or per connection builder) and shared by
/// reference; there is no global registry.
#[derive(Debug, Clone)]
pub struct CompressionRegistry {
    compressors: HashMap<i32, BoxedCompressor>,
}

impl CompressionRegistry {
    /// Registry with nothing but identity.
    pub fn identity_only() -> Self {
        let mut compressors = HashMap::new();
        compressors.insert(IDENTITY, BoxedCompressor::new(Identity));
        Self { compressors }
    }

    /// Register (or replace) the compressor for `code`.
    pub fn register<C: Compressor>(&mut self, code: i32, compressor: C) -> &mut Self {
        self.compressors.insert(code, BoxedCompressor::new(compressor));
        self
    }

    /// Remove the compressor for `code`.
    pub fn unregister(&mut self, code: i32) -> &mut Self {
        self.compressors.remove(&code);
        self
    }

    pub fn contains(&self, code: i32) -> bool {
        self.compressors.contains_key(&code)
    }

    /// Look up the compressor for `code`.
    pub fn lookup(&self, code: i32) -> Result<&BoxedCompressor> {
        self.compressors
            .get(&code)
            .ok_or(StreamwireError::UnsupportedCompression(code))
    }
}

impl Default for CompressionRegistry {
    /// Identity, gzip and zlib at their default levels.
    fn default() -> Self {
        let mut registry = Self::identity_only();
        registry.register(GZIP, Gzip::default());
        registry.register(ZLIB, Zlib::default());
        registry
    }
}
