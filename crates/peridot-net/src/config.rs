//! Server configuration.

use std::thread;
use std::time::Duration;

use crate::addr::Address;
use crate::connection::DEFAULT_HIGH_WATERMARK;
use crate::error::NetResult;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name used in logs and connection names.
    pub name: String,
    /// Address to bind to.
    pub bind_addr: Address,
    /// Number of I/O reactor threads.
    pub io_threads: usize,
    /// Cutoff for idle connections, enforced with one-second granularity.
    pub idle_timeout: Duration,
    /// Default output-buffer size at which back-pressure is signaled.
    pub high_watermark: usize,
}

impl ServerConfig {
    /// Creates a configuration binding `ip:port` (use `"0.0.0.0"` for all
    /// interfaces) with default tuning.
    pub fn new(ip: &str, port: u16) -> NetResult<Self> {
        Ok(Self {
            bind_addr: Address::new(ip, port)?,
            ..Self::default()
        })
    }

    /// Sets the server name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the number of I/O reactor threads.
    pub fn with_io_threads(mut self, count: usize) -> Self {
        self.io_threads = count;
        self
    }

    /// Sets the idle-connection cutoff.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the default high watermark for accepted connections.
    pub fn with_high_watermark(mut self, bytes: usize) -> Self {
        self.high_watermark = bytes;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "peridot".to_string(),
            bind_addr: Address::any(0),
            io_threads: thread::available_parallelism().map_or(1, std::num::NonZero::get),
            idle_timeout: Duration::from_secs(300),
            high_watermark: DEFAULT_HIGH_WATERMARK,
        }
    }
}
