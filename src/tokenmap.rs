//! Demo broker - Session token map (spec §3, §6)
//!
//! Backs the external session-validation and cookie-set endpoints: given
//! a session token, answer whether it belongs to a pending-or-active
//! session and whether the caller's remote address matches the one that
//! minted it. The Supervisor is the sole writer (spec §3 ownership rules);
//! the Gateway only reads it to serve §6's HTTP surface.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use tokio::sync::Mutex;
use uuid::Uuid;

/// One minted session token's binding. `active` distinguishes a session
/// still in Starting (pending) from one that has reached Active; both
/// are valid for the validation endpoint per spec §6.
#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub session_id: Uuid,
    pub client_id: Uuid,
    pub remote_address: IpAddr,
    pub created_at: Instant,
    pub active: bool,
}

/// token -> binding, for active and pending sessions (spec §3).
pub struct SessionTokenMap {
    entries: Mutex<HashMap<String, TokenEntry>>,
}

impl SessionTokenMap {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Record a freshly minted token while its session is still Starting.
    pub async fn insert_pending(&self, token: String, session_id: Uuid, client_id: Uuid, remote_address: IpAddr) {
        let mut entries = self.entries.lock().await;
        entries.insert(token, TokenEntry { session_id, client_id, remote_address, created_at: Instant::now(), active: false });
    }

    /// Flip a pending entry to active once promotion completes.
    pub async fn mark_active(&self, token: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(token) {
            entry.active = true;
        }
    }

    /// Rebind an entry to a freshly reconnected client id, preserving its
    /// remote-address binding for future validation calls.
    pub async fn rebind_client(&self, token: &str, new_client_id: Uuid, new_remote_address: IpAddr) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(token) {
            entry.client_id = new_client_id;
            entry.remote_address = new_remote_address;
        }
    }

    /// Remove a token, e.g. on session end or client departure (spec §3:
    /// "Tokens removed on session end or client departure").
    pub async fn remove(&self, token: &str) {
        self.entries.lock().await.remove(token);
    }

    /// Spec §6 session-validation endpoint: 200 iff the token is known
    /// (active or pending) AND the caller's address matches the one that
    /// minted it.
    pub async fn validate(&self, token: &str, caller: IpAddr) -> Option<Uuid> {
        let entries = self.entries.lock().await;
        entries.get(token).filter(|e| e.remote_address == caller).map(|e| e.session_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl Default for SessionTokenMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, last))
    }

    #[tokio::test]
    async fn pending_entry_validates_before_active() {
        let map = SessionTokenMap::new();
        let session_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        map.insert_pending("tok".into(), session_id, client_id, ip(1)).await;
        assert_eq!(map.validate("tok", ip(1)).await, Some(session_id));
    }

    #[tokio::test]
    async fn wrong_remote_address_is_rejected() {
        let map = SessionTokenMap::new();
        map.insert_pending("tok".into(), Uuid::new_v4(), Uuid::new_v4(), ip(1)).await;
        assert_eq!(map.validate("tok", ip(2)).await, None);
    }

    #[tokio::test]
    async fn remove_forgets_the_token() {
        let map = SessionTokenMap::new();
        map.insert_pending("tok".into(), Uuid::new_v4(), Uuid::new_v4(), ip(1)).await;
        map.remove("tok").await;
        assert_eq!(map.validate("tok", ip(1)).await, None);
    }

    #[tokio::test]
    async fn rebind_client_updates_owner_and_address() {
        let map = SessionTokenMap::new();
        let session_id = Uuid::new_v4();
        map.insert_pending("tok".into(), session_id, Uuid::new_v4(), ip(1)).await;
        let new_client = Uuid::new_v4();
        map.rebind_client("tok", new_client, ip(2)).await;
        assert_eq!(map.validate("tok", ip(2)).await, Some(session_id));
        assert_eq!(map.validate("tok", ip(1)).await, None);
    }
}
