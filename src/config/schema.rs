//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the load
//! balancer. All types derive Serde traits for deserialization from the
//! TOML config file.

use serde::{Deserialize, Serialize};

use crate::proto::DEFAULT_MAX_PDU;

/// Root configuration for the load balancer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LloadConfig {
    /// Client-facing listeners.
    pub listener: ListenerConfig,

    /// Routing engine tuning and feature flags.
    pub proxy: ProxyConfig,

    /// Identity the regular upstream pool authenticates as.
    pub bindconf: Option<BindConfig>,

    /// Backend directory servers, in selection order.
    pub backends: Vec<BackendConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Listen URIs (`ldap://host:port` or `ldapi://<encoded path>`).
    pub listen: Vec<String>,

    /// Maximum concurrent client connections per listener (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen: vec!["ldap://0.0.0.0:1389".to_string()],
            max_connections: 10_000,
        }
    }
}

/// Optional behaviours toggled in `[proxy].features`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    /// Forward binds as verify-credentials extended operations.
    VirtualBind,
    /// Accepted for compatibility; has no effect on routing.
    ProxyAuthz,
}

/// Routing engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub features: Vec<Feature>,

    /// PDUs a reader handles before yielding to other connections.
    pub pdus_per_cycle: usize,

    /// Largest PDU accepted from a client.
    pub client_max_pdu: usize,

    /// Largest PDU accepted from a backend.
    pub upstream_max_pdu: usize,

    /// Operations older than this are failed back to the client (0 = off).
    pub operation_timeout_secs: u64,

    /// Bound on a single upstream connect attempt.
    pub connect_timeout_ms: u64,

    /// Connections whose peer stops reading for this long are closed (0 = off).
    pub write_timeout_ms: u64,
}

impl ProxyConfig {
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            features: Vec::new(),
            pdus_per_cycle: 10,
            client_max_pdu: DEFAULT_MAX_PDU,
            upstream_max_pdu: DEFAULT_MAX_PDU,
            operation_timeout_secs: 0,
            connect_timeout_ms: 5_000,
            write_timeout_ms: 10_000,
        }
    }
}

/// Simple-bind identity for regular upstream connections.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BindConfig {
    pub bind_dn: String,
    pub credentials: String,
}

/// StartTLS policy for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StartTls {
    #[default]
    Off,
    On,
    Critical,
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique backend identifier used in logs and metrics.
    pub name: String,

    /// Backend URI (e.g., "ldap://127.0.0.1:389").
    pub uri: String,

    /// Regular pool size.
    #[serde(default = "default_numconns")]
    pub numconns: usize,

    /// Bind-only pool size (unused with virtual-bind).
    #[serde(default = "default_bindconns")]
    pub bindconns: usize,

    /// Pending operations allowed on the whole backend (0 = unlimited).
    #[serde(default)]
    pub max_pending: usize,

    /// Pending operations allowed per upstream connection (0 = unlimited).
    #[serde(default)]
    pub conn_max_pending: usize,

    /// Delay before reconnecting after a failed attempt.
    #[serde(default = "default_retry_ms")]
    pub retry_ms: u64,

    #[serde(default)]
    pub starttls: StartTls,
}

fn default_numconns() -> usize {
    1
}

fn default_bindconns() -> usize {
    1
}

fn default_retry_ms() -> u64 {
    5_000
}

impl BackendConfig {
    /// A backend with default pool settings.
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            numconns: default_numconns(),
            bindconns: default_bindconns(),
            max_pending: 0,
            conn_max_pending: 0,
            retry_ms: default_retry_ms(),
            starttls: StartTls::Off,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9389".to_string(),
        }
    }
}
