use std::time::Duration;

// Each live connection holds one permit, one receive buffer and at most
// one send buffer, so this also sizes both buffer pools.
pub const MAX_CONNECTIONS: usize = 50;

pub const BUFFER_SIZE: usize = 4 * 1024;

// Upper bound of the length prefix a peer may declare.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub const LISTEN_BACKLOG: i32 = 500;

pub const RECV_WORKERS: usize = 4;

pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration.
///
/// ```
/// let config = rawrpc::Config::new()
///     .max_connections(2)
///     .recv_workers(1);
/// assert_eq!(config.max_connections, 2);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub max_connections: usize,
    pub buffer_size: usize,
    pub max_frame_size: usize,
    pub listen_backlog: i32,
    pub recv_workers: usize,
    pub write_timeout: Duration,
    /// Reply with an error to calls for unknown services or methods.
    /// If false these calls are dropped silently.
    pub strict: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS,
            buffer_size: BUFFER_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
            listen_backlog: LISTEN_BACKLOG,
            recv_workers: RECV_WORKERS,
            write_timeout: WRITE_TIMEOUT,
            strict: true,
        }
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        assert!(n > 0, "max_connections must be positive");
        self.max_connections = n;
        self
    }

    pub fn buffer_size(mut self, n: usize) -> Self {
        assert!(n > 0, "buffer_size must be positive");
        self.buffer_size = n;
        self
    }

    pub fn max_frame_size(mut self, n: usize) -> Self {
        assert!(n <= u32::MAX as usize, "frame length must fit the u32 prefix");
        self.max_frame_size = n;
        self
    }

    pub fn listen_backlog(mut self, n: i32) -> Self {
        self.listen_backlog = n;
        self
    }

    pub fn recv_workers(mut self, n: usize) -> Self {
        assert!(n > 0, "recv_workers must be positive");
        self.recv_workers = n;
        self
    }

    pub fn write_timeout(mut self, d: Duration) -> Self {
        self.write_timeout = d;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}
