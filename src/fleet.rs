//! Shared routing context.
//!
//! # Responsibilities
//! - Own the configured backends and the backend selection strategy
//! - Hand out connection ids from one atomic counter
//! - Track live client connections
//! - Carry the feature flags and tuning knobs every session consults
//! - Start reconnection for every backend and tear everything down on exit

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::{BindConfig, Feature, LloadConfig, ProxyConfig};
use crate::load_balancer::backend::Backend;
use crate::load_balancer::round_robin::RoundRobin;
use crate::load_balancer::LoadBalancer;
use crate::net::address::UriError;
use crate::net::connection::{Connection, ConnectionId, IoLimits};
use crate::session;
use crate::supervisor;

/// Settings derived from configuration once at startup.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub virtual_bind: bool,
    pub proxy_authz: bool,
    pub client_limits: IoLimits,
    pub upstream_limits: IoLimits,
    pub operation_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub bindconf: Option<BindConfig>,
}

impl FleetSettings {
    pub fn from_config(proxy: &ProxyConfig, bindconf: Option<BindConfig>) -> Self {
        let write_timeout = (proxy.write_timeout_ms > 0).then(|| Duration::from_millis(proxy.write_timeout_ms));
        Self {
            virtual_bind: proxy.has_feature(Feature::VirtualBind),
            proxy_authz: proxy.has_feature(Feature::ProxyAuthz),
            client_limits: IoLimits {
                max_pdu: proxy.client_max_pdu,
                pdus_per_cycle: proxy.pdus_per_cycle,
                write_timeout,
            },
            upstream_limits: IoLimits {
                max_pdu: proxy.upstream_max_pdu,
                pdus_per_cycle: proxy.pdus_per_cycle,
                write_timeout,
            },
            operation_timeout: (proxy.operation_timeout_secs > 0)
                .then(|| Duration::from_secs(proxy.operation_timeout_secs)),
            connect_timeout: Duration::from_millis(proxy.connect_timeout_ms),
            bindconf,
        }
    }
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default(), None)
    }
}

/// Everything the routing engine shares between connections.
pub struct Fleet {
    settings: FleetSettings,
    backends: Vec<Arc<Backend>>,
    balancer: Box<dyn LoadBalancer>,
    next_conn_id: AtomicU64,
    clients: DashMap<ConnectionId, Arc<Connection>>,
    shutting_down: AtomicBool,
}

impl Fleet {
    pub fn new(settings: FleetSettings, backends: Vec<Backend>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            backends: backends.into_iter().map(Arc::new).collect(),
            balancer: Box::new(RoundRobin::new()),
            next_conn_id: AtomicU64::new(1),
            clients: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &LloadConfig) -> Result<Arc<Self>, UriError> {
        let backends = config
            .backends
            .iter()
            .map(Backend::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        let settings = FleetSettings::from_config(&config.proxy, config.bindconf.clone());
        Ok(Self::new(settings, backends))
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    /// Backends in configured order.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn backend(&self, name: &str) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn balancer(&self) -> &dyn LoadBalancer {
        self.balancer.as_ref()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register_client(&self, conn: &Arc<Connection>) {
        self.clients.insert(conn.id(), conn.clone());
    }

    pub fn unregister_client(&self, id: ConnectionId) {
        self.clients.remove(&id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn clients(&self) -> Vec<Arc<Connection>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Begin filling every backend's pools.
    pub fn start(self: &Arc<Self>) {
        for backend in &self.backends {
            supervisor::backend_retry(self, backend);
        }
    }

    /// Close every client and upstream and cancel pending reconnects.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let clients = self.clients();
        tracing::info!(clients = clients.len(), "Closing client connections");
        for client in clients {
            session::client::destroy(&client);
        }
        for backend in &self.backends {
            for upstream in backend.shutdown() {
                session::upstream::destroy(&upstream);
            }
        }
    }
}
