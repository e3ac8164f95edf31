//! Process-wide tunnel registry (§4.2): `subdomain -> Tunnel`, uniqueness,
//! reconnect eviction and shutdown teardown.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use tunnelforge_core::events::{ConnectionState, EventSender, TunnelEvent};

use crate::tunnel::Tunnel;

#[derive(Clone)]
pub struct TunnelRegistry {
    tunnels: Arc<DashMap<String, Arc<Tunnel>>>,
    events: EventSender,
}

impl TunnelRegistry {
    pub fn new(events: EventSender) -> Self {
        Self {
            tunnels: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Insert a freshly authenticated Tunnel. Callers are responsible for
    /// applying the reconnect-eviction policy (§4.2) before calling this —
    /// the registry itself refuses to silently clobber a live entry.
    pub fn register(&self, tunnel: Arc<Tunnel>) {
        let subdomain = tunnel.subdomain.clone();
        self.tunnels.insert(subdomain.clone(), tunnel);
        info!(%subdomain, "tunnel registered");
        tunnelforge_core::events::publish(
            &self.events,
            TunnelEvent::ConnectionStateChanged {
                subdomain,
                state: ConnectionState::Connected,
            },
        );
    }

    pub fn get(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(subdomain).map(|e| e.value().clone())
    }

    pub fn has(&self, subdomain: &str) -> bool {
        self.tunnels.contains_key(subdomain)
    }

    /// Atomically tear down and remove a tunnel: reject every pending
    /// request/upgrade, abort every stream, close every browser socket, then
    /// drop it from the map.
    pub async fn unregister(&self, subdomain: &str, reason: &str) {
        if let Some((_, tunnel)) = self.tunnels.remove(subdomain) {
            tunnel.teardown(reason).await;
            info!(%subdomain, %reason, "tunnel unregistered");
            tunnelforge_core::events::publish(
                &self.events,
                TunnelEvent::ConnectionStateChanged {
                    subdomain: subdomain.to_string(),
                    state: ConnectionState::Disconnected,
                },
            );
        }
    }

    pub fn enumerate(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.iter().map(|e| e.value().clone()).collect()
    }

    pub fn has_pending_requests(&self) -> bool {
        self.tunnels.iter().any(|e| e.value().pending_request_count() > 0)
    }
}
