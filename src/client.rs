//! Demo broker - Client record registry (spec §3, §4.1)
//!
//! Tracks every currently-connected WebSocket client: its connection
//! state, remote address, and user agent. The gateway owns the outbound
//! half of each connection; this registry is the shared lookup used by
//! the queue and supervisor to address clients by id.

use std::collections::HashMap;
use std::net::IpAddr;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Where a client currently sits in the broker's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Queued,
    Active,
    DisconnectedGrace,
}

pub struct ClientRecord {
    pub client_id: Uuid,
    pub remote_address: IpAddr,
    pub user_agent: String,
    pub state: ClientState,
    pub sender: mpsc::UnboundedSender<ServerMessage>,
}

/// Registry of live clients, keyed by id.
pub struct ClientRegistry {
    clients: Mutex<HashMap<Uuid, ClientRecord>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self { clients: Mutex::new(HashMap::new()) }
    }

    pub async fn register(
        &self,
        client_id: Uuid,
        remote_address: IpAddr,
        user_agent: String,
        sender: mpsc::UnboundedSender<ServerMessage>,
    ) {
        let mut clients = self.clients.lock().await;
        clients.insert(
            client_id,
            ClientRecord { client_id, remote_address, user_agent, state: ClientState::Connected, sender },
        );
    }

    pub async fn unregister(&self, client_id: Uuid) {
        self.clients.lock().await.remove(&client_id);
    }

    pub async fn set_state(&self, client_id: Uuid, state: ClientState) {
        if let Some(record) = self.clients.lock().await.get_mut(&client_id) {
            record.state = state;
        }
    }

    pub async fn state_of(&self, client_id: Uuid) -> Option<ClientState> {
        self.clients.lock().await.get(&client_id).map(|r| r.state)
    }

    /// Best-effort send; a closed channel means the client already
    /// disconnected, which is not an error the caller needs to react to.
    pub async fn send(&self, client_id: Uuid, message: ServerMessage) {
        if let Some(record) = self.clients.lock().await.get(&client_id) {
            let _ = record.sender.send(message);
        }
    }

    pub async fn remote_address_of(&self, client_id: Uuid) -> Option<IpAddr> {
        self.clients.lock().await.get(&client_id).map(|r| r.remote_address)
    }

    pub async fn user_agent_of(&self, client_id: Uuid) -> Option<String> {
        self.clients.lock().await.get(&client_id).map(|r| r.user_agent.clone())
    }

    pub async fn count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[tokio::test]
    async fn register_then_lookup_state() {
        let registry = ClientRegistry::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(id, addr(), "test-agent".into(), tx).await;
        assert_eq!(registry.state_of(id).await, Some(ClientState::Connected));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn unregister_removes_client() {
        let registry = ClientRegistry::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(id, addr(), "test-agent".into(), tx).await;
        registry.unregister(id).await;
        assert_eq!(registry.state_of(id).await, None);
    }

    #[tokio::test]
    async fn set_state_transitions_are_visible() {
        let registry = ClientRegistry::new();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(id, addr(), "test-agent".into(), tx).await;
        registry.set_state(id, ClientState::Active).await;
        assert_eq!(registry.state_of(id).await, Some(ClientState::Active));
    }

    #[tokio::test]
    async fn send_to_unknown_client_is_a_no_op() {
        let registry = ClientRegistry::new();
        registry.send(Uuid::new_v4(), ServerMessage::Error { message: "x".into() }).await;
    }
}
