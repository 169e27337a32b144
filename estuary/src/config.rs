//! File-facing configuration.
//!
//! The on-disk format (TOML or JSON, detected by the first non-blank byte)
//! uses flat, spec-named option keys with durations in seconds; loading
//! resolves it into the typed [`ServerOptions`] the services consume.
use std::{collections::HashMap, path::Path, time::Duration};

use estuary_core::config::{
    ClientAddressSource, GracefulShutdown, RuntimeConfig, ServerOptions, ServiceConfig,
};
use estuary_core::listener::ListenerBuilder;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub servers: HashMap<String, ServiceConfig<ListenerConfig, ResolvedServerConfig>>,
}

#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub options: ServerOptions,
}

/// One server block as written in the config file. Every recognized option
/// is optional; absent keys keep the built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerUserConfig {
    pub idle_timeout: Option<u64>,
    pub ping_interval: Option<u64>,
    pub max_connection_age: Option<u64>,
    pub connection_drain_duration: Option<u64>,
    pub max_requests_per_connection: Option<usize>,
    pub max_connections: Option<usize>,

    pub http2_initial_connection_window: Option<u32>,
    pub http2_initial_stream_window: Option<u32>,
    pub http2_max_streams_per_connection: Option<u32>,
    pub http2_max_frame_size: Option<u32>,
    pub http2_max_header_list_size: Option<u32>,
    pub http2_max_reset_frames_per_window: Option<usize>,
    pub http2_max_reset_frames_window_seconds: Option<u64>,

    pub http1_max_initial_line: Option<usize>,
    pub http1_max_header_size: Option<usize>,
    pub http1_max_chunk_size: Option<usize>,

    pub graceful_shutdown_quiet_period: Option<u64>,
    pub graceful_shutdown_timeout: Option<u64>,

    pub request_timeout: Option<u64>,
    pub max_request_length: Option<u64>,
    pub verbose_responses: Option<bool>,
    pub route_cache_spec: Option<String>,
    pub client_address_sources: Option<Vec<ClientAddressSource>>,
    pub request_auto_abort_delay_millis: Option<i64>,
}

impl ServerUserConfig {
    pub fn resolve(&self) -> ServerOptions {
        let mut options = ServerOptions::default();
        if let Some(sec) = self.idle_timeout {
            options.idle_timeout = (sec > 0).then(|| Duration::from_secs(sec));
        }
        if let Some(sec) = self.ping_interval {
            options.ping_interval = (sec > 0).then(|| Duration::from_secs(sec));
        }
        if let Some(sec) = self.max_connection_age {
            options.max_connection_age = (sec > 0).then(|| Duration::from_secs(sec));
        }
        if let Some(sec) = self.connection_drain_duration {
            options.connection_drain_duration = Duration::from_secs(sec);
        }
        if let Some(n) = self.max_requests_per_connection {
            options.max_requests_per_connection = (n > 0).then_some(n);
        }
        if let Some(n) = self.max_connections {
            options.max_connections = (n > 0).then_some(n);
        }

        if let Some(v) = self.http2_initial_connection_window {
            options.http2.initial_connection_window = v;
        }
        if let Some(v) = self.http2_initial_stream_window {
            options.http2.initial_stream_window = v;
        }
        if let Some(v) = self.http2_max_streams_per_connection {
            options.http2.max_streams_per_connection = v;
        }
        if let Some(v) = self.http2_max_frame_size {
            options.http2.max_frame_size = v;
        }
        if let Some(v) = self.http2_max_header_list_size {
            options.http2.max_header_list_size = v;
        }
        if let Some(v) = self.http2_max_reset_frames_per_window {
            options.http2.max_reset_frames_per_window = v;
        }
        if let Some(v) = self.http2_max_reset_frames_window_seconds {
            options.http2.reset_frames_window = Duration::from_secs(v);
        }

        if let Some(v) = self.http1_max_initial_line {
            options.http1.max_initial_line = v;
        }
        if let Some(v) = self.http1_max_header_size {
            options.http1.max_header_size = v;
        }
        if let Some(v) = self.http1_max_chunk_size {
            options.http1.max_chunk_size = v;
        }

        options.graceful_shutdown = GracefulShutdown {
            quiet_period: Duration::from_secs(self.graceful_shutdown_quiet_period.unwrap_or(0)),
            timeout: Duration::from_secs(self.graceful_shutdown_timeout.unwrap_or(0)),
        }
        .normalized();

        if let Some(sec) = self.request_timeout {
            options.request_timeout = (sec > 0).then(|| Duration::from_secs(sec));
        }
        if let Some(v) = self.max_request_length {
            options.max_request_length = v;
        }
        if let Some(v) = self.verbose_responses {
            options.verbose_responses = v;
        }
        if let Some(spec) = &self.route_cache_spec {
            options.route_cache_spec = (!spec.is_empty()).then(|| spec.clone());
        }
        if let Some(sources) = &self.client_address_sources {
            options.client_address_sources = sources.clone();
        }
        if let Some(v) = self.request_auto_abort_delay_millis {
            options.request_auto_abort_delay_millis = v;
        }
        options
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ListenerConfig {
    Socket(std::net::SocketAddr),
    Unix(std::path::PathBuf),
}

impl TryFrom<ListenerConfig> for ListenerBuilder {
    type Error = std::io::Error;

    fn try_from(value: ListenerConfig) -> Result<Self, Self::Error> {
        match value {
            ListenerConfig::Socket(addr) => ListenerBuilder::bind_tcp(addr, Default::default()),
            ListenerConfig::Unix(addr) => ListenerBuilder::bind_unix(addr),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub struct UserConfig {
            #[serde(default)]
            pub runtime: RuntimeConfig,
            pub servers: HashMap<String, ServiceConfig<ListenerConfig, ServerUserConfig>>,
        }
        let content = std::fs::read(path)?;
        let user_config = Self::from_slice::<UserConfig>(&content)?;

        let UserConfig { runtime, servers } = user_config;
        let servers = servers
            .into_iter()
            .map(|(key, service)| {
                let ServiceConfig { listener, server } = service;
                (
                    key,
                    ServiceConfig {
                        listener,
                        server: ResolvedServerConfig {
                            options: server.resolve(),
                        },
                    },
                )
            })
            .collect();
        Ok(Config { runtime, servers })
    }

    pub fn from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
        // read first non-space u8
        let is_json = match content
            .iter()
            .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
        {
            Some(first) => *first == b'{',
            None => false,
        };
        match is_json {
            true => serde_json::from_slice::<T>(content).map_err(Into::into),
            false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
        }
    }
}
