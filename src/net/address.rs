//! LDAP URI parsing for listeners and backends.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use url::Url;

use crate::config::schema::StartTls;

/// Where a socket connects or listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Local(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Transport security requested for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Cleartext,
    /// `ldaps://`, TLS from the first byte.
    Ldaps,
    StartTls,
    StartTlsCritical,
}

/// A parsed `ldap://`, `ldaps://` or `ldapi://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUri {
    pub endpoint: Endpoint,
    pub tls: TlsMode,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("invalid URI '{0}': {1}")]
    Malformed(String, String),

    #[error("unsupported scheme '{0}'")]
    Scheme(String),

    #[error("URI '{0}' has no host")]
    MissingHost(String),

    #[error("URI '{0}' has no socket path")]
    MissingPath(String),
}

impl LdapUri {
    pub fn parse(uri: &str) -> Result<Self, UriError> {
        let url = Url::parse(uri).map_err(|e| UriError::Malformed(uri.to_string(), e.to_string()))?;

        match url.scheme() {
            "ldap" | "ldaps" => {
                let tls = if url.scheme() == "ldaps" {
                    TlsMode::Ldaps
                } else {
                    TlsMode::Cleartext
                };
                let default_port = if tls == TlsMode::Ldaps { 636 } else { 389 };
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| UriError::MissingHost(uri.to_string()))?;
                let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
                Ok(Self {
                    endpoint: Endpoint::Tcp {
                        host,
                        port: url.port().unwrap_or(default_port),
                    },
                    tls,
                })
            }
            "ldapi" => {
                let raw = match url.host_str().filter(|h| !h.is_empty()) {
                    Some(host) => host.to_string(),
                    None => url.path().to_string(),
                };
                let path = percent_decode(&raw);
                if path.is_empty() || path == "/" {
                    return Err(UriError::MissingPath(uri.to_string()));
                }
                Ok(Self {
                    endpoint: Endpoint::Local(PathBuf::from(path)),
                    tls: TlsMode::Cleartext,
                })
            }
            other => Err(UriError::Scheme(other.to_string())),
        }
    }

    /// Fold a backend's `starttls` policy into the URI's mode.
    pub fn with_starttls(mut self, policy: StartTls) -> Self {
        if self.tls == TlsMode::Cleartext {
            self.tls = match policy {
                StartTls::Off => TlsMode::Cleartext,
                StartTls::On => TlsMode::StartTls,
                StartTls::Critical => TlsMode::StartTlsCritical,
            };
        }
        self
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
