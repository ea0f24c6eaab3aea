//! Configuration for WebSocket connections.

/// Default per-message read limit in bytes.
pub const DEFAULT_READ_LIMIT: u64 = 32 * 1024;

/// WebSocket connection configuration.
///
/// The buffer sizes apply to the `BufReader`/`BufWriter` wrapped around the
/// two halves of the stream; they must comfortably exceed the 14-byte
/// maximum header so a header read never needs more than one buffered fill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Read buffer size in bytes.
    ///
    /// Default: 4 KB (4096)
    pub read_buffer_size: usize,

    /// Write buffer size in bytes.
    ///
    /// Default: 4 KB (4096)
    pub write_buffer_size: usize,

    /// Initial per-message read limit in bytes, adjustable at runtime with
    /// [`Conn::set_read_limit`](crate::Conn::set_read_limit).
    ///
    /// Default: 32 KiB (32768)
    pub read_limit: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            read_limit: DEFAULT_READ_LIMIT,
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the read buffer size.
    #[must_use]
    pub const fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the write buffer size.
    #[must_use]
    pub const fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the initial per-message read limit.
    #[must_use]
    pub const fn with_read_limit(mut self, limit: u64) -> Self {
        self.read_limit = limit;
        self
    }
}
