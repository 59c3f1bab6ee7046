//! Client listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to a configured `ldap://` or `ldapi://` URI
//! - Accept incoming client connections
//! - Enforce max_connections limit via semaphore
//! - Graceful handling of accept errors

use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::net::address::{Endpoint, LdapUri, UriError};
use crate::net::Stream;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Invalid listen URI: {0}")]
    Uri(#[from] UriError),

    #[error("Failed to bind: {0}")]
    Bind(std::io::Error),

    #[error("Failed to accept: {0}")]
    Accept(std::io::Error),

    #[error("Listener closed")]
    Closed,
}

enum Socket {
    Tcp(TcpListener),
    Local(UnixListener),
}

/// A bounded listener that limits concurrent client connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    inner: Socket,
    /// Printable listen address.
    name: String,
    /// Semaphore to limit concurrent connections.
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind to a listen URI with connection limits.
    pub async fn bind(uri: &str, max_connections: usize) -> Result<Self, ListenerError> {
        let parsed = LdapUri::parse(uri)?;
        let (inner, name) = match &parsed.endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .map_err(ListenerError::Bind)?;
                let local = listener.local_addr().map_err(ListenerError::Bind)?;
                (Socket::Tcp(listener), local.to_string())
            }
            Endpoint::Local(path) => {
                if path.exists() {
                    // stale socket from a previous run
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path).map_err(ListenerError::Bind)?;
                (Socket::Local(listener), path.display().to_string())
            }
        };

        tracing::info!(
            address = %name,
            max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            name,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached.
    /// Returns the stream, the peer name and a permit that must be held for
    /// the connection's lifetime.
    pub async fn accept(&self) -> Result<(Box<dyn Stream>, String, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, peer): (Box<dyn Stream>, String) = match &self.inner {
            Socket::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(ListenerError::Accept)?;
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(peer_addr = %addr, error = %e, "Failed to set TCP_NODELAY");
                }
                (Box::new(stream), addr.to_string())
            }
            Socket::Local(listener) => {
                let (stream, _) = listener.accept().await.map_err(ListenerError::Accept)?;
                (Box::new(stream), format!("PATH={}", self.name))
            }
        };

        tracing::debug!(
            peer_addr = %peer,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, peer, ConnectionPermit { _permit: permit }))
    }

    /// Printable local address (socket address or path).
    pub fn local_name(&self) -> &str {
        &self.name
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
