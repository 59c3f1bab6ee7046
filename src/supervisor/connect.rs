//! Upstream connection establishment.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{lookup_host, TcpStream, UnixStream};
use tokio::time::timeout;

use crate::fleet::Fleet;
use crate::load_balancer::backend::Backend;
use crate::net::address::{Endpoint, TlsMode};
use crate::net::Stream;
use crate::observability::metrics;
use crate::session::upstream::upstream_init;
use crate::supervisor::retry::backend_retry;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("{0} resolved to no addresses")]
    NoAddress(String),

    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("connect to {0} timed out")]
    Timeout(String),

    #[error("TLS to {0} is not supported")]
    Tls(String),
}

/// Make one connection attempt for `backend` and hand a connected socket
/// to the upstream session layer.
pub async fn backend_connect(fleet: Weak<Fleet>, backend: Arc<Backend>) {
    backend.record_connect_attempt();
    let Some(fleet) = fleet.upgrade() else {
        return;
    };

    match open(&backend, fleet.settings().connect_timeout).await {
        Ok((stream, peer)) => {
            backend.lock().connect_task = None;
            if fleet.is_shutting_down() {
                return;
            }
            upstream_init(&fleet, &backend, stream, peer);
        }
        Err(e) => {
            let failed = {
                let mut state = backend.lock();
                state.opening = state.opening.saturating_sub(1);
                state.failed += 1;
                state.connect_task = None;
                state.failed
            };
            tracing::warn!(
                backend = %backend.name,
                uri = %backend.uri.endpoint,
                error = %e,
                failed,
                "Upstream connect failed"
            );
            metrics::record_connect_failure(&backend.name);
            backend_retry(&fleet, &backend);
        }
    }
}

async fn open(backend: &Backend, limit: Duration) -> Result<(Box<dyn Stream>, String), ConnectError> {
    if backend.uri.tls != TlsMode::Cleartext {
        return Err(ConnectError::Tls(backend.uri.endpoint.to_string()));
    }

    match &backend.uri.endpoint {
        Endpoint::Local(path) => {
            let stream = UnixStream::connect(path)
                .await
                .map_err(|source| ConnectError::Connect {
                    addr: path.display().to_string(),
                    source,
                })?;
            Ok((Box::new(stream), format!("PATH={}", path.display())))
        }
        Endpoint::Tcp { host, port } => {
            let addrs = lookup_host((host.as_str(), *port))
                .await
                .map_err(|source| ConnectError::Resolve {
                    host: host.clone(),
                    source,
                })?;

            let mut last_error = None;
            for addr in addrs {
                tracing::debug!(backend = %backend.name, addr = %addr, "Connecting to backend");
                match timeout(limit, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            tracing::debug!(backend = %backend.name, addr = %addr, error = %e, "Failed to set TCP_NODELAY");
                        }
                        return Ok((Box::new(stream), addr.to_string()));
                    }
                    Ok(Err(source)) => {
                        last_error = Some(ConnectError::Connect {
                            addr: addr.to_string(),
                            source,
                        })
                    }
                    Err(_) => last_error = Some(ConnectError::Timeout(addr.to_string())),
                }
            }
            Err(last_error.unwrap_or_else(|| ConnectError::NoAddress(host.clone())))
        }
    }
}
