//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the fleet from a validated configuration
//! - Bind every listener
//! - Start backend reconnects, accept loops and the timeout sweep
//! - On shutdown, close everything the fleet owns

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;

use crate::config::{validation, ConfigError, LloadConfig};
use crate::fleet::Fleet;
use crate::lifecycle::Shutdown;
use crate::net::address::UriError;
use crate::net::listener::{Listener, ListenerError};
use crate::resilience::OperationSweeper;
use crate::session::client::client_init;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid backend: {0}")]
    Backend(#[from] UriError),

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// A bound, not yet running, load balancer.
pub struct Daemon {
    fleet: Arc<Fleet>,
    listeners: Vec<Listener>,
}

impl Daemon {
    pub async fn bind(config: &LloadConfig) -> Result<Self, StartupError> {
        validation::validate_config(config).map_err(ConfigError::Validation)?;
        let fleet = Fleet::from_config(config)?;

        let mut listeners = Vec::with_capacity(config.listener.listen.len());
        for uri in &config.listener.listen {
            listeners.push(Listener::bind(uri, config.listener.max_connections).await?);
        }

        Ok(Self { fleet, listeners })
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    /// Bound addresses, with any ephemeral port resolved.
    pub fn local_names(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.local_name().to_string()).collect()
    }

    /// Serve until `shutdown` fires, then tear everything down.
    pub async fn run(self, shutdown: Shutdown) {
        let Daemon { fleet, listeners } = self;
        fleet.start();

        let mut tasks = JoinSet::new();
        for listener in listeners {
            tasks.spawn(accept_loop(fleet.clone(), listener, shutdown.clone()));
        }
        if let Some(timeout) = fleet.settings().operation_timeout {
            let sweeper = OperationSweeper::new(fleet.clone(), timeout);
            tasks.spawn(sweeper.run(shutdown.subscribe()));
        }

        shutdown.wait().await;
        tracing::info!("Shutting down");
        fleet.shutdown();
        while tasks.join_next().await.is_some() {}
        tracing::info!("Shutdown complete");
    }
}

async fn accept_loop(fleet: Arc<Fleet>, listener: Listener, shutdown: Shutdown) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer, permit)) => {
                    client_init(&fleet, stream, peer, Some(permit));
                }
                Err(ListenerError::Closed) => break,
                Err(e) => {
                    tracing::warn!(address = %listener.local_name(), error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.wait() => break,
        }
    }
    tracing::debug!(address = %listener.local_name(), "Listener stopped");
}
