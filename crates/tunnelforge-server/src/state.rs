use tunnelforge_core::events::EventSender;
use tunnelforge_core::subdomain::SubdomainCache;

use crate::config::ServerConfig;
use crate::registry::TunnelRegistry;

pub struct AppState {
    pub config: ServerConfig,
    pub registry: TunnelRegistry,
    pub cache: SubdomainCache,
    pub events: EventSender,
}

impl AppState {
    pub fn new(config: ServerConfig, cache: SubdomainCache, events: EventSender) -> Self {
        let registry = TunnelRegistry::new(events.clone());
        Self {
            config,
            registry,
            cache,
            events,
        }
    }
}
