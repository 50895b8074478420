use serde_derive::Deserialize;

use crate::support::{ErrorType, TransportError, TransportResult};

/// Process-wide transport configuration. Every field has a usable default so
/// `TransportConfig::default()` produces a working loopback setup; deployments
/// load overrides from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Comma-separated interface whitelist. Mutually exclusive with
    /// `if_exclude`.
    pub if_include: Option<String>,
    /// Comma-separated interface blacklist.
    pub if_exclude: Option<String>,
    /// Lowest listening port to try. 0 lets the kernel pick.
    pub port_min: u16,
    /// Number of ports probed starting at `port_min`.
    pub port_range: u16,
    /// Socket send buffer size. 0 keeps the kernel default.
    pub sndbuf: usize,
    /// Socket receive buffer size. 0 keeps the kernel default.
    pub rcvbuf: usize,
    /// Initial number of fragments per free list.
    pub free_list_num: usize,
    /// Maximum number of fragments per free list. 0 is unbounded.
    pub free_list_max: usize,
    /// Number of fragments added when a free list grows.
    pub free_list_inc: usize,
    /// Per-endpoint prefetch cache size in bytes. 0 disables the cache.
    pub endpoint_cache: usize,
    /// If set, leave Nagle's algorithm enabled on connected sockets.
    pub not_use_nodelay: bool,
    /// Spawn the dedicated progress thread.
    pub enable_progress_thread: bool,
    /// Refuse sockets of the given address family (4 or 6).
    pub disable_family: Option<u8>,
    /// Largest payload served from the eager pool.
    pub eager_limit: usize,
    /// Largest payload a single fragment may carry.
    pub max_send_size: usize,
    /// Bound on the blocking handshake exchange, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Listen backlog for the per-interface listening socket.
    pub listen_backlog: i32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            if_include: None,
            if_exclude: None,
            port_min: 0,
            port_range: 1,
            sndbuf: 0,
            rcvbuf: 0,
            free_list_num: 8,
            free_list_max: 1024,
            free_list_inc: 32,
            endpoint_cache: 30 * 1024,
            not_use_nodelay: false,
            enable_progress_thread: false,
            disable_family: None,
            eager_limit: 32 * 1024,
            max_send_size: 128 * 1024,
            handshake_timeout_ms: 10_000,
            listen_backlog: 128,
        }
    }
}

impl TransportConfig {
    /// Load a configuration from a TOML string. Unknown keys are rejected
    /// by serde so configuration typos surface at bring-up.
    pub fn from_toml_str(toml: &str) -> TransportResult<TransportConfig> {
        let config: TransportConfig =
            serdeconv::from_toml_str(toml).map_err(|_| TransportError::Fatal(ErrorType::Corrupt))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.if_include.is_some() && self.if_exclude.is_some() {
            return Err(TransportError::Fatal(ErrorType::Corrupt));
        }
        if self.eager_limit > self.max_send_size {
            return Err(TransportError::Fatal(ErrorType::Corrupt));
        }
        if self.port_range == 0 {
            return Err(TransportError::Fatal(ErrorType::PortRangeExhausted));
        }
        Ok(())
    }

    /// Splits a comma-separated interface list into names.
    pub(crate) fn split_if_list(list: &Option<String>) -> Vec<String> {
        match list {
            Some(raw) => raw
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
            None => Vec::new(),
        }
    }
}
