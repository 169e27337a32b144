//! Server and runtime configuration types.
//!
//! [`ServerOptions`] is the resolved, typed form of everything the server
//! core reads at runtime: connection lifecycle limits, HTTP/2 and HTTP/1
//! protocol caps, request defaults, and the route-cache spec. The
//! file-facing (serde) representation lives in the binary crate and is
//! converted into this one; the protocol services only ever see these
//! resolved values.
//!
//! [`RuntimeConfig`] configures the runtime environment itself: worker
//! threads, io_uring entries, CPU affinity, and the optional blocking
//! thread pool.
use std::time::Duration;

use serde::{Deserialize, Serialize};

// Default iouring/epoll entries: 32k
const DEFAULT_ENTRIES: u32 = 32768;

/// Resolved server options consumed by the protocol services.
///
/// All durations are already normalized; `None` means the corresponding
/// mechanism is disabled.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Close a connection when no frame arrives for this long.
    pub idle_timeout: Option<Duration>,
    /// Send an HTTP/2 PING when the connection has been idle this long.
    pub ping_interval: Option<Duration>,
    /// Drain and close a connection once it has lived this long.
    pub max_connection_age: Option<Duration>,
    /// How long a draining connection keeps serving in-flight streams.
    pub connection_drain_duration: Duration,
    /// Drain and close a connection after serving this many requests.
    pub max_requests_per_connection: Option<usize>,
    /// Reject accepts beyond this many live connections.
    pub max_connections: Option<usize>,

    pub http2: Http2Options,
    pub http1: Http1Options,

    /// Quiet period + hard timeout for graceful shutdown. The quiet period
    /// is clamped to the timeout at load time.
    pub graceful_shutdown: GracefulShutdown,

    /// Server-wide default request timeout; per-route overrides win.
    pub request_timeout: Option<Duration>,
    /// Server-wide default max request body length; 0 = unlimited.
    pub max_request_length: u64,
    /// Include error detail in error response bodies.
    pub verbose_responses: bool,
    /// Caffeine-style spec string for the route cache; `None` disables it.
    pub route_cache_spec: Option<String>,
    /// Ordered sources consulted to determine the client address.
    pub client_address_sources: Vec<ClientAddressSource>,
    /// Milliseconds after response completion at which a still-open request
    /// body is aborted. Negative disables the auto-abort.
    pub request_auto_abort_delay_millis: i64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SEC)),
            ping_interval: None,
            max_connection_age: None,
            connection_drain_duration: Duration::from_secs(1),
            max_requests_per_connection: None,
            max_connections: None,
            http2: Http2Options::default(),
            http1: Http1Options::default(),
            graceful_shutdown: GracefulShutdown::default(),
            request_timeout: Some(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SEC)),
            max_request_length: DEFAULT_MAX_REQUEST_LENGTH,
            verbose_responses: false,
            route_cache_spec: Some(DEFAULT_ROUTE_CACHE_SPEC.to_string()),
            client_address_sources: vec![ClientAddressSource::Peer],
            request_auto_abort_delay_millis: 0,
        }
    }
}

const DEFAULT_IDLE_TIMEOUT_SEC: u64 = 75;
const DEFAULT_REQUEST_TIMEOUT_SEC: u64 = 10;
const DEFAULT_MAX_REQUEST_LENGTH: u64 = 10 * 1024 * 1024;
pub const DEFAULT_ROUTE_CACHE_SPEC: &str = "maximum_size=8192";

/// HTTP/2 protocol caps enforced by the ingress.
#[derive(Debug, Clone)]
pub struct Http2Options {
    pub initial_connection_window: u32,
    pub initial_stream_window: u32,
    pub max_streams_per_connection: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    /// RST flood mitigation: more than this many RST_STREAM frames within
    /// `reset_frames_window` closes the connection with ENHANCE_YOUR_CALM.
    pub max_reset_frames_per_window: usize,
    pub reset_frames_window: Duration,
}

impl Default for Http2Options {
    fn default() -> Self {
        Self {
            initial_connection_window: 1 << 20,
            initial_stream_window: 1 << 20,
            max_streams_per_connection: 1000,
            max_frame_size: 16384,
            max_header_list_size: 8192,
            max_reset_frames_per_window: 400,
            reset_frames_window: Duration::from_secs(60),
        }
    }
}

/// HTTP/1 decoder limits.
#[derive(Debug, Clone)]
pub struct Http1Options {
    pub max_initial_line: usize,
    pub max_header_size: usize,
    pub max_chunk_size: usize,
}

impl Default for Http1Options {
    fn default() -> Self {
        Self {
            max_initial_line: 4096,
            max_header_size: 8192,
            max_chunk_size: 8192,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GracefulShutdown {
    pub quiet_period: Duration,
    pub timeout: Duration,
}

impl GracefulShutdown {
    /// Quiet period must not exceed the timeout.
    pub fn normalized(self) -> Self {
        Self {
            quiet_period: self.quiet_period.min(self.timeout),
            timeout: self.timeout,
        }
    }
}

/// Where the client address may come from, in consultation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAddressSource {
    Forwarded,
    XForwardedFor,
    ProxyProtocol,
    Peer,
}

/// Configuration structure for a service, combining listener and server
/// configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig<LC, SC> {
    /// Configuration for the service listener.
    pub listener: LC,
    /// Configuration for the server component of the service.
    #[serde(flatten)]
    pub server: SC,
}

/// Runtime environment settings: worker count, io_uring tuning, and the
/// optional blocking pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads; one reactor per thread.
    #[serde(default = "default_workers")]
    pub worker_threads: usize,

    /// io_uring/epoll entry count.
    #[serde(default = "default_entries")]
    pub entries: u32,

    /// Submission-queue polling idle time (io_uring only).
    pub sqpoll_idle: Option<u32>,

    #[serde(default)]
    pub runtime_type: RuntimeType,

    /// Pin each worker to a CPU core.
    #[serde(default)]
    pub cpu_affinity: bool,

    /// Blocking thread pool size for blocking handlers.
    pub thread_pool: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: default_workers(),
            entries: DEFAULT_ENTRIES,
            sqpoll_idle: None,
            runtime_type: RuntimeType::default(),
            cpu_affinity: false,
            thread_pool: None,
        }
    }
}

/// Which driver backs the reactors. io_uring where available, with the
/// poll-based driver as the portable fallback.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeType {
    #[cfg(target_os = "linux")]
    #[default]
    IoUring,

    #[cfg_attr(not(target_os = "linux"), default)]
    Legacy,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

const fn default_entries() -> u32 {
    DEFAULT_ENTRIES
}
