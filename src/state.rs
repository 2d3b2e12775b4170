use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::registry::SessionRegistry;
use crate::relay::SignalingRelay;
use crate::ws::ConnectionGateway;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Mutex<SessionRegistry>>,
    pub gateway: Arc<ConnectionGateway>,
    pub relay: Arc<SignalingRelay>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Mutex::new(SessionRegistry::new()));
        let gateway = Arc::new(ConnectionGateway::new());
        let relay = Arc::new(SignalingRelay::new(gateway.clone(), registry.clone()));
        Self {
            config: Arc::new(config),
            registry,
            gateway,
            relay,
        }
    }
}
