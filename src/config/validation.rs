//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check every listener and backend URI parses
//! - Validate value ranges (pool sizes, retry interval, PDU limits)
//! - Reject transports this build cannot speak (TLS)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: LloadConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;

use crate::config::schema::LloadConfig;
use crate::net::address::{LdapUri, TlsMode, UriError};

/// A single semantic problem in the configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no listen URIs configured")]
    NoListeners,

    #[error("listener: {0}")]
    ListenerUri(UriError),

    #[error("listener '{0}' requests TLS, which is not supported")]
    ListenerTls(String),

    #[error("listener max_connections must be greater than zero")]
    ZeroMaxConnections,

    #[error("backend '{name}': {source}")]
    BackendUri { name: String, source: UriError },

    #[error("backend '{0}' requests TLS, which is not supported")]
    BackendTls(String),

    #[error("backend '{0}' must have numconns > 0")]
    ZeroNumconns(String),

    #[error("backend '{0}' must have retry_ms > 0")]
    ZeroRetry(String),

    #[error("duplicate backend name '{0}'")]
    DuplicateBackend(String),

    #[error("pdus_per_cycle must be greater than zero")]
    ZeroPdusPerCycle,

    #[error("{0} must be greater than zero")]
    ZeroPduLimit(&'static str),
}

/// Validate the whole configuration, collecting every problem found.
pub fn validate_config(config: &LloadConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.listen.is_empty() {
        errors.push(ValidationError::NoListeners);
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }
    for listen in &config.listener.listen {
        match LdapUri::parse(listen) {
            Ok(uri) if uri.tls != TlsMode::Cleartext => {
                errors.push(ValidationError::ListenerTls(listen.clone()));
            }
            Ok(_) => {}
            Err(e) => errors.push(ValidationError::ListenerUri(e)),
        }
    }

    let mut names = HashSet::new();
    for backend in &config.backends {
        if !names.insert(backend.name.as_str()) {
            errors.push(ValidationError::DuplicateBackend(backend.name.clone()));
        }
        match LdapUri::parse(&backend.uri) {
            Ok(uri) => {
                if uri.with_starttls(backend.starttls).tls != TlsMode::Cleartext {
                    errors.push(ValidationError::BackendTls(backend.name.clone()));
                }
            }
            Err(source) => errors.push(ValidationError::BackendUri {
                name: backend.name.clone(),
                source,
            }),
        }
        if backend.numconns == 0 {
            errors.push(ValidationError::ZeroNumconns(backend.name.clone()));
        }
        if backend.retry_ms == 0 {
            errors.push(ValidationError::ZeroRetry(backend.name.clone()));
        }
    }

    if config.proxy.pdus_per_cycle == 0 {
        errors.push(ValidationError::ZeroPdusPerCycle);
    }
    if config.proxy.client_max_pdu == 0 {
        errors.push(ValidationError::ZeroPduLimit("client_max_pdu"));
    }
    if config.proxy.upstream_max_pdu == 0 {
        errors.push(ValidationError::ZeroPduLimit("upstream_max_pdu"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
