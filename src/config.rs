//! Engine configuration
//!
//! All knobs the engine consumes are passed in explicitly at construction;
//! nothing is read from ambient global state.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration for the download engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default user agent sent with every request
    pub user_agent: String,

    /// HTTP driving configuration
    pub http: HttpConfig,

    /// Connection pool configuration
    pub pool: PoolConfig,
}

/// HTTP-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection + TLS handshake timeout in seconds
    pub connect_timeout: u64,

    /// Idle read timeout in seconds: a job showing no read progress for
    /// this long is failed and its transport invalidated
    pub read_timeout: u64,

    /// Optional overall deadline per job in seconds
    pub job_deadline: Option<u64>,

    /// Maximum redirect hops per job. The budget is shared across the
    /// whole job and decremented per hop, never reset.
    pub max_redirects: usize,

    /// Transparent retry attempts on transport failure, applied only
    /// while no response byte has been consumed
    pub max_retries: usize,

    /// Initial retry delay in milliseconds
    pub retry_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    pub max_retry_delay_ms: u64,

    /// Whether to accept invalid TLS certificates (dangerous!)
    pub accept_invalid_certs: bool,

    /// Engine-wide HTTP proxy (absolute URL); a per-job proxy wins
    pub proxy_url: Option<String>,

    /// Ask upstreams to keep the connection open so it can be pooled
    pub persistent_connections: bool,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum idle transports kept per (host, port, secure) identity
    pub max_idle_per_host: usize,

    /// Seconds after which an idle pooled transport is evicted instead
    /// of being handed out
    pub idle_timeout: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("cachefetch/{}", env!("CARGO_PKG_VERSION")),
            http: HttpConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            read_timeout: 60,
            job_deadline: None,
            // matches the original proxy's redirmax default
            max_redirects: 10,
            max_retries: 1,
            retry_delay_ms: 200,
            max_retry_delay_ms: 5000,
            accept_invalid_certs: false,
            proxy_url: None,
            persistent_connections: true,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 4,
            idle_timeout: 90,
        }
    }
}

impl EngineConfig {
    /// Validate the configuration before the engine starts using it
    pub fn validate(&self) -> Result<()> {
        if self.http.connect_timeout == 0 {
            return Err(EngineError::invalid_input(
                "connect_timeout",
                "must be at least 1 second",
            ));
        }
        if self.http.read_timeout == 0 {
            return Err(EngineError::invalid_input(
                "read_timeout",
                "must be at least 1 second",
            ));
        }
        if self.http.retry_delay_ms > self.http.max_retry_delay_ms {
            return Err(EngineError::invalid_input(
                "retry_delay_ms",
                "initial retry delay exceeds the maximum",
            ));
        }
        if let Some(ref proxy) = self.http.proxy_url {
            let parsed = url::Url::parse(proxy)
                .map_err(|e| EngineError::invalid_input("proxy_url", e.to_string()))?;
            if parsed.scheme() != "http" {
                return Err(EngineError::invalid_input(
                    "proxy_url",
                    "only http:// proxies are supported",
                ));
            }
        }
        if self.user_agent.is_empty() {
            return Err(EngineError::invalid_input("user_agent", "must not be empty"));
        }
        Ok(())
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn job_deadline(&self) -> Option<Duration> {
        self.job_deadline.map(Duration::from_secs)
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }
}
