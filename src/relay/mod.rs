use std::sync::{Arc, Mutex};

use crate::registry::SessionRegistry;
use crate::ws::{msg_types, ClientHandle, ConnectionGateway, SignalDeliverPayload, WireMessage};

/// Signaling Relay: a pure addressed forwarder.
///
/// Delivers opaque negotiation payloads between named connections and fans
/// membership/presence events out to a room. Performs no interpretation,
/// buffering, or reordering of payload contents.
pub struct SignalingRelay {
    gateway: Arc<ConnectionGateway>,
    registry: Arc<Mutex<SessionRegistry>>,
}

impl SignalingRelay {
    pub fn new(gateway: Arc<ConnectionGateway>, registry: Arc<Mutex<SessionRegistry>>) -> Self {
        Self { gateway, registry }
    }

    /// Forward `payload` verbatim to the live connection `target`, tagged
    /// with the origin id. A missing target is an expected race with
    /// disconnection: the message is dropped and logged, never escalated
    /// to the sender.
    pub fn relay(&self, origin: &str, target: &str, payload: serde_json::Value) {
        let Some(client) = self.gateway.get_client(target) else {
            tracing::debug!(
                origin = %origin,
                target = %target,
                "Relay target no longer connected, dropping signal"
            );
            return;
        };

        let msg = WireMessage::new(
            msg_types::SIGNAL,
            serde_json::to_value(SignalDeliverPayload {
                origin_connection_id: origin.to_string(),
                payload,
            })
            .unwrap(),
        );
        self.deliver(&client, msg);
    }

    /// Deliver `msg` to every current member of `room_id` except
    /// `exclude`.
    pub fn broadcast(&self, room_id: &str, exclude: Option<&str>, msg: WireMessage) {
        let recipients = self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .member_ids(room_id, exclude);
        self.send_to_many(&recipients, msg);
    }

    /// Deliver `msg` to an explicit recipient list (used with recipient
    /// lists computed atomically by a registry operation).
    pub fn send_to_many(&self, connection_ids: &[String], msg: WireMessage) {
        for connection_id in connection_ids {
            if let Some(client) = self.gateway.get_client(connection_id) {
                self.deliver(&client, msg.clone());
            }
        }
    }

    /// Deliver `msg` to a single connection; returns false when the target
    /// is gone.
    pub fn send_to(&self, connection_id: &str, msg: WireMessage) -> bool {
        match self.gateway.get_client(connection_id) {
            Some(client) => {
                self.deliver(&client, msg);
                true
            }
            None => false,
        }
    }

    fn deliver(&self, client: &ClientHandle, msg: WireMessage) {
        if client.send(msg).is_err() {
            tracing::debug!(
                connection_id = %client.connection_id,
                "Outbound channel closed mid-delivery"
            );
        }
    }
}
