use tokio::sync::mpsc;

use crate::ws::WireMessage;

/// Client connection handle for sending messages
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub connection_id: String,
    pub display_name: String,
    pub sender: mpsc::UnboundedSender<WireMessage>,
}

impl ClientHandle {
    pub fn new(
        connection_id: String,
        display_name: String,
        sender: mpsc::UnboundedSender<WireMessage>,
    ) -> Self {
        Self {
            connection_id,
            display_name,
            sender,
        }
    }

    pub fn send(&self, msg: WireMessage) -> Result<(), mpsc::error::SendError<WireMessage>> {
        self.sender.send(msg)
    }
}

/// Tracks every live transport connection by its connection id.
///
/// Flat on purpose: a connection id is stable across all room memberships
/// the connection holds, so room addressing lives in the registry, not here.
pub struct ConnectionGateway {
    clients: dashmap::DashMap<String, ClientHandle>, // connection_id -> ClientHandle
}

impl ConnectionGateway {
    pub fn new() -> Self {
        Self {
            clients: dashmap::DashMap::new(),
        }
    }

    pub fn add_client(&self, handle: ClientHandle) {
        self.clients.insert(handle.connection_id.clone(), handle);
    }

    pub fn remove_client(&self, connection_id: &str) -> Option<ClientHandle> {
        self.clients.remove(connection_id).map(|(_, v)| v)
    }

    pub fn get_client(&self, connection_id: &str) -> Option<ClientHandle> {
        self.clients.get(connection_id).map(|r| r.clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ConnectionGateway {
    fn default() -> Self {
        Self::new()
    }
}
