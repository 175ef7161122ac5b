//! Configuration for the transport.
//!
//! The transport treats configuration as an externally supplied, immutable
//! object: values are resolved once (defaults, or a TOML document provided by
//! the embedding process) and never change afterwards.

use serde::Deserialize;

/// Top-level transport configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TransportConfig {
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub contexts: ContextConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
}

/// Buffer pool sizing. The arena is allocated once at startup; the chunk
/// count bounds how many receive operations can hold memory system-wide.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Number of fixed-size chunks in the pool.
    #[serde(default = "default_chunk_count")]
    pub chunk_count: usize,
    /// Size of each chunk in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_count: default_chunk_count(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Operation-context pool sizing. Unlike the buffer pool this pool grows on
/// demand; the initial count just pre-warms it.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_context_count")]
    pub initial_count: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            initial_count: default_context_count(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Address to bind to (e.g. 127.0.0.1:7000).
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Listen backlog.
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum sockets accepted per reactor pass.
    #[serde(default = "default_accept_concurrency")]
    pub accept_concurrency: usize,
    /// SO_LINGER grace applied when discarding sockets, in milliseconds.
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            backlog: default_backlog(),
            accept_concurrency: default_accept_concurrency(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

/// Connector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Expected number of simultaneous pending attempts (map pre-sizing).
    #[serde(default = "default_connect_pool_size")]
    pub pool_size: usize,
    /// Period of the timeout reaper, in milliseconds.
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    /// SO_LINGER grace applied when closing half-open sockets, in milliseconds.
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            pool_size: default_connect_pool_size(),
            reap_interval_ms: default_reap_interval_ms(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

fn default_chunk_count() -> usize {
    512
}

fn default_chunk_size() -> usize {
    16 * 1024
}

fn default_context_count() -> usize {
    64
}

fn default_bind() -> String {
    "127.0.0.1:0".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_accept_concurrency() -> usize {
    1
}

fn default_close_grace_ms() -> u64 {
    500
}

fn default_connect_pool_size() -> usize {
    32
}

fn default_reap_interval_ms() -> u64 {
    200
}

impl TransportConfig {
    /// Parse a configuration from a TOML document. Missing sections and
    /// fields fall back to defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(ConfigError::TomlParse)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    TomlParse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::TomlParse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.buffers.chunk_count, 512);
        assert_eq!(config.buffers.chunk_size, 16 * 1024);
        assert_eq!(config.listener.bind, "127.0.0.1:0");
        assert_eq!(config.listener.accept_concurrency, 1);
        assert_eq!(config.connector.reap_interval_ms, 200);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [buffers]
            chunk_count = 64
            chunk_size = 4096

            [listener]
            bind = "0.0.0.0:7000"
            accept_concurrency = 4

            [connector]
            reap_interval_ms = 50
        "#;

        let config = TransportConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.buffers.chunk_count, 64);
        assert_eq!(config.buffers.chunk_size, 4096);
        assert_eq!(config.listener.bind, "0.0.0.0:7000");
        assert_eq!(config.listener.accept_concurrency, 4);
        assert_eq!(config.connector.reap_interval_ms, 50);
        // Untouched sections keep defaults
        assert_eq!(config.contexts.initial_count, 64);
        assert_eq!(config.connector.close_grace_ms, 500);
    }

    #[test]
    fn test_bad_toml_rejected() {
        let err = TransportConfig::from_toml_str("buffers = 3").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}
