//! Demo broker - Session Supervisor (spec §4.4)
//!
//! Owns the at-most-one active session. This is the heart of the broker:
//! a single global slot moves through Idle -> Starting -> Active ->
//! Ending, with DisconnectedGrace as a substate of Active entered when
//! the owning client's WebSocket drops but the terminal process is kept
//! alive for a short reconnect window.
//!
//! Lock ordering (spec §9): Supervisor > Queue > Clients > Tokens. This
//! module's own mutex is always the first acquired; it never calls out
//! to the queue or client registry while already holding its lock
//! through an await boundary that reenters this struct.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::{ClientRegistry, ClientState};
use crate::config::Config;
use crate::credential::{self, CredentialHandle, Credentials};
use crate::invite::{InviteStore, SessionUsageRecord};
use crate::kv::KvStore;
use crate::protocol::{ServerMessage, SessionEndReason};
use crate::pty::{self, OwnedPty};
use crate::queue::QueueManager;
use crate::token;
use crate::tokenmap::SessionTokenMap;

/// Global singleton slot state (spec §4.4 state table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Active,
    Ending,
    DisconnectedGrace,
}

struct ActiveSession {
    session_id: Uuid,
    client_id: Uuid,
    token: String,
    invite_token: Option<String>,
    remote_address: IpAddr,
    user_agent: String,
    started_at: chrono::DateTime<Utc>,
    queue_wait: Duration,
    pty: OwnedPty,
    credential: CredentialHandle,
    timers: Vec<JoinHandle<()>>,
    reconnect_in_flight: Arc<AtomicBool>,
    errors: Vec<String>,
}

struct Inner {
    state: SupervisorState,
    current: Option<ActiveSession>,
}

/// Reasons `promote` can fail without ever reaching Active.
#[derive(Debug, Clone)]
pub enum PromoteError {
    NotIdle,
    CredentialWrite(String),
    SpawnFailed(String),
}

impl std::fmt::Display for PromoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotIdle => write!(f, "supervisor is not idle"),
            Self::CredentialWrite(e) => write!(f, "credential write failed: {e}"),
            Self::SpawnFailed(e) => write!(f, "terminal spawn failed: {e}"),
        }
    }
}

impl std::error::Error for PromoteError {}

pub struct SessionSupervisor {
    config: Arc<Config>,
    queue: Arc<QueueManager>,
    clients: Arc<ClientRegistry>,
    invites: Arc<InviteStore>,
    kv: Arc<dyn KvStore>,
    tokens: Arc<SessionTokenMap>,
    inner: Mutex<Inner>,
}

impl SessionSupervisor {
    pub fn new(
        config: Arc<Config>,
        queue: Arc<QueueManager>,
        clients: Arc<ClientRegistry>,
        invites: Arc<InviteStore>,
        kv: Arc<dyn KvStore>,
        tokens: Arc<SessionTokenMap>,
    ) -> Self {
        Self { config, queue, clients, invites, kv, tokens, inner: Mutex::new(Inner { state: SupervisorState::Idle, current: None }) }
    }

    pub async fn is_idle(&self) -> bool {
        matches!(self.inner.lock().await.state, SupervisorState::Idle)
    }

    pub async fn state(&self) -> SupervisorState {
        self.inner.lock().await.state
    }

    /// The id of the currently active/starting session, if any. Used by
    /// the operator shutdown path to end it cleanly instead of leaving the
    /// terminal process orphaned.
    pub async fn current_session_id(&self) -> Option<Uuid> {
        self.inner.lock().await.current.as_ref().map(|a| a.session_id)
    }

    /// Promote `client_id` into the active-session slot (spec §4.4
    /// promotion protocol, steps 1-9).
    pub async fn promote(
        self: &Arc<Self>,
        client_id: Uuid,
        invite_token: Option<String>,
        queue_wait: Duration,
    ) -> Result<(), PromoteError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != SupervisorState::Idle {
                return Err(PromoteError::NotIdle);
            }
            inner.state = SupervisorState::Starting;
        }

        // Step 2: the client is already out of the queue on the
        // promote-immediately path; on the re-promotion path the caller
        // already popped the head before calling us.
        self.queue.remove_if_present(client_id).await;

        let session_id = Uuid::new_v4();
        let session_token = token::mint(&self.config.session_secret, session_id);
        let started_at = Utc::now();

        let remote_address = self.clients.remote_address_of(client_id).await.unwrap_or(IpAddr::from([0, 0, 0, 0]));

        // Step 3/4 done; record the pending token before any blocking I/O
        // so the validation endpoint can see the session as soon as the
        // client is told about it (spec §3: pending covers "session
        // starting").
        self.tokens.insert_pending(session_token.clone(), session_id, client_id, remote_address).await;

        let credentials = Credentials {
            issue_tracker_token: self.config.credentials.issue_tracker_token.clone(),
            issue_tracker_email: self.config.credentials.issue_tracker_email.clone(),
            issue_tracker_site_url: self.config.credentials.issue_tracker_site_url.clone(),
            model_provider_token: self.config.credentials.model_provider_token.clone(),
        };

        let credential_handle = match credential::write_credential_file(&self.config.credential_dir, session_id, &credentials) {
            Ok(handle) => handle,
            Err(e) => {
                self.tokens.remove(&session_token).await;
                self.fail_to_idle(client_id, PromoteError::CredentialWrite(e.to_string())).await;
                return Err(PromoteError::CredentialWrite(e.to_string()));
            }
        };

        let spawn_result = pty::spawn_owned_pty(
            &self.config.terminal_binary_path,
            credential_handle.path(),
            self.config.session_timeout.as_secs() / 60,
            80,
            24,
        );

        let pty = match spawn_result {
            Ok(pty) => pty,
            Err(e) => {
                // Step order: cleanup the credential file before anything else.
                credential_handle.cleanup();
                self.tokens.remove(&session_token).await;
                self.fail_to_idle(client_id, PromoteError::SpawnFailed(e.to_string())).await;
                return Err(PromoteError::SpawnFailed(e.to_string()));
            }
        };

        // Failure semantics: a terminal process that exits on its own is
        // `container_exit`, running the normal termination protocol.
        let supervisor_for_exit = Arc::clone(self);
        pty.watch_exit(move || {
            tokio::spawn(async move {
                supervisor_for_exit.end(session_id, SessionEndReason::ContainerExit).await;
            });
        });

        let warning_timer = tokio::spawn({
            let supervisor = Arc::clone(self);
            let lead = self.config.session_timeout.saturating_sub(self.config.warning_lead());
            async move {
                tokio::time::sleep(lead).await;
                supervisor.emit_warning(session_id).await;
            }
        });

        let soft_timeout_timer = tokio::spawn({
            let supervisor = Arc::clone(self);
            let timeout = self.config.session_timeout;
            async move {
                tokio::time::sleep(timeout).await;
                supervisor.end(session_id, SessionEndReason::Timeout).await;
            }
        });

        // The backstop holds its own clone of the pty handle rather than
        // looking the session back up through the supervisor slot: by the
        // time this fires, `end()` has normally already cleared `current`,
        // so a current-session check would make this a no-op in exactly
        // the case it exists to cover (the graceful signal not landing).
        let hard_kill_pty = pty.clone();
        let hard_kill_timer = tokio::spawn({
            let lead = self.config.session_timeout + self.config.hard_kill_lead();
            async move {
                tokio::time::sleep(lead).await;
                warn!(%session_id, "hard-kill backstop fired");
                hard_kill_pty.force_kill().await;
            }
        });

        let user_agent = self.clients.user_agent_of(client_id).await.unwrap_or_default();

        let active = ActiveSession {
            session_id,
            client_id,
            token: session_token.clone(),
            invite_token,
            remote_address,
            user_agent,
            started_at,
            queue_wait,
            pty,
            credential: credential_handle,
            timers: vec![warning_timer, soft_timeout_timer, hard_kill_timer],
            reconnect_in_flight: Arc::new(AtomicBool::new(false)),
            errors: Vec::new(),
        };

        {
            let mut inner = self.inner.lock().await;
            inner.current = Some(active);
            inner.state = SupervisorState::Active;
        }

        self.tokens.mark_active(&session_token).await;
        self.clients.set_state(client_id, ClientState::Active).await;

        let resume_hint = format!(
            "{{\"session_id\":\"{session_id}\",\"client_id\":\"{client_id}\",\"started_at\":\"{started_at}\"}}"
        );
        let _ = self.kv.set_with_ttl(&format!("session:{client_id}"), resume_hint, self.config.session_timeout).await;

        let expires_at_rfc3339 = (started_at + chrono::Duration::from_std(self.config.session_timeout).unwrap_or_default()).to_rfc3339();
        self.clients
            .send(
                client_id,
                ServerMessage::SessionStarting {
                    terminal_url: format!("{}/{}", self.config.terminal_url_base, session_id),
                    expires_at: expires_at_rfc3339,
                    session_token,
                },
            )
            .await;

        info!(%session_id, %client_id, "session promoted to active");
        Ok(())
    }

    async fn fail_to_idle(&self, client_id: Uuid, err: PromoteError) {
        warn!(%client_id, error = %err, "promotion failed, returning to idle");
        {
            let mut inner = self.inner.lock().await;
            inner.state = SupervisorState::Idle;
        }
        self.clients.send(client_id, ServerMessage::error("session failed to start")).await;
        self.try_promote_next().await;
    }

    async fn emit_warning(&self, session_id: Uuid) {
        let inner = self.inner.lock().await;
        if let Some(active) = &inner.current {
            if active.session_id == session_id {
                let client_id = active.client_id;
                drop(inner);
                self.clients.send(client_id, ServerMessage::SessionWarning { minutes_remaining: 5 }).await;
            }
        }
    }

    /// Terminate the active session (spec §4.4 termination protocol,
    /// steps 1-10). A no-op if `session_id` is not the current session
    /// (already superseded by a later promotion or a prior `end`).
    pub async fn end(self: &Arc<Self>, session_id: Uuid, reason: SessionEndReason) {
        let active = {
            let mut inner = self.inner.lock().await;
            match &inner.current {
                Some(active) if active.session_id == session_id => {}
                _ => return,
            }
            inner.state = SupervisorState::Ending;
            inner.current.take().expect("checked above")
        };

        for timer in &active.timers {
            timer.abort();
        }

        // Step 3: send the graceful termination signal without waiting
        // for it synchronously; the terminal's own exit watcher will
        // observe the result (and no-op re-enter `end`, since the state
        // is already Ending/Idle by then).
        let pty_for_term = active.pty;
        tokio::spawn(async move {
            pty_for_term.graceful_terminate().await;
        });

        // Step 4: credential cleanup MUST happen before the next promote.
        active.credential.cleanup();

        // Step 5: clear the session token before notifying the client.
        self.tokens.remove(&active.token).await;

        if let Some(invite_token) = &active.invite_token {
            let summary = SessionUsageRecord {
                session_id: session_id.to_string(),
                client_id: active.client_id.to_string(),
                start_time: active.started_at,
                end_time: Utc::now(),
                end_reason: reason_str(reason).to_string(),
                queue_wait_ms: active.queue_wait.as_millis() as u64,
                remote_address: active.remote_address.to_string(),
                user_agent: active.user_agent.clone(),
                errors: active.errors.clone(),
            };
            if let Err(e) = self.invites.consume(invite_token, summary).await {
                warn!(error = %e, "failed to record invite consumption");
            }
        }

        let _ = self.kv.delete(&format!("session:{}", active.client_id)).await;

        self.clients
            .send(active.client_id, ServerMessage::SessionEnded { reason, clear_session_cookie: true })
            .await;
        self.clients.set_state(active.client_id, ClientState::Connected).await;

        self.spawn_data_reset_hook();

        {
            let mut inner = self.inner.lock().await;
            inner.state = SupervisorState::Idle;
        }

        info!(%session_id, ?reason, "session ended");
        self.try_promote_next().await;
    }

    /// Fire-and-forget the external data-reset hook; failures are logged
    /// and never block promotion of the next client (spec §4.4 step 9).
    fn spawn_data_reset_hook(&self) {
        let Some(script) = self.config.data_reset_script.clone() else { return };
        let site_url = self.config.credentials.issue_tracker_site_url.clone();
        tokio::spawn(async move {
            match tokio::process::Command::new(&script).arg(&site_url).status().await {
                Ok(status) if status.success() => info!("data-reset hook completed"),
                Ok(status) => warn!(?status, "data-reset hook exited non-zero"),
                Err(e) => warn!(error = %e, "data-reset hook failed to launch"),
            }
        });
    }

    async fn try_promote_next(self: &Arc<Self>) {
        if let Some(entry) = self.queue.pop_head().await {
            self.broadcast_queue_positions().await;
            let wait = entry.joined_at.elapsed();
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                let _ = supervisor.promote(entry.client_id, entry.invite_token, wait).await;
            });
        }
    }

    /// Notify every still-queued client of its shifted position after the
    /// head is popped (spec §4.3: "broadcast updated positions").
    async fn broadcast_queue_positions(&self) {
        let queue_size = self.queue.len().await;
        for (client_id, position) in self.queue.snapshot_positions().await {
            let estimated_wait = self.queue.estimate_wait(position).as_secs() / 60;
            self.clients.send(client_id, ServerMessage::QueuePosition { position, estimated_wait, queue_size }).await;
        }
    }

    /// Called by the gateway on client disconnect while that client owns
    /// the active session slot (spec §4.4 "Reconnect grace").
    pub async fn on_client_disconnect(self: &Arc<Self>, client_id: Uuid) {
        let session_id = {
            let mut inner = self.inner.lock().await;
            match &inner.current {
                Some(active) if active.client_id == client_id && inner.state == SupervisorState::Active => {
                    inner.state = SupervisorState::DisconnectedGrace;
                    active.session_id
                }
                _ => return,
            }
        };

        let supervisor = Arc::clone(self);
        let grace = self.config.disconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_disconnected = {
                let inner = supervisor.inner.lock().await;
                matches!(inner.state, SupervisorState::DisconnectedGrace)
                    && inner.current.as_ref().map(|a| a.session_id) == Some(session_id)
            };
            if still_disconnected {
                supervisor.end(session_id, SessionEndReason::Disconnected).await;
            }
        });
    }

    /// Rebind a fresh connection to an in-grace session, given the token
    /// it presents. Single-flight guarded: a second concurrent attempt
    /// during grace is rejected (spec §4.4, §5 invariant e).
    pub async fn reconnect(&self, new_client_id: Uuid, presented_token: &str, new_remote_address: IpAddr) -> Result<(), ReconnectError> {
        let mut inner = self.inner.lock().await;
        let active = match &mut inner.current {
            Some(active) => active,
            None => return Err(ReconnectError::NoSessionInGrace),
        };

        if inner.state != SupervisorState::DisconnectedGrace {
            return Err(ReconnectError::NoSessionInGrace);
        }

        if active.reconnect_in_flight.swap(true, Ordering::SeqCst) {
            return Err(ReconnectError::AlreadyInFlight);
        }

        let verified = token::verify(&self.config.session_secret, active.session_id, presented_token);
        if !verified {
            active.reconnect_in_flight.store(false, Ordering::SeqCst);
            return Err(ReconnectError::TokenMismatch);
        }

        active.client_id = new_client_id;
        active.remote_address = new_remote_address;
        inner.state = SupervisorState::Active;
        active.reconnect_in_flight.store(false, Ordering::SeqCst);

        let token = active.token.clone();
        drop(inner);

        self.tokens.rebind_client(&token, new_client_id, new_remote_address).await;
        self.clients.set_state(new_client_id, ClientState::Active).await;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    NoSessionInGrace,
    AlreadyInFlight,
    TokenMismatch,
}

fn reason_str(reason: SessionEndReason) -> &'static str {
    match reason {
        SessionEndReason::Timeout => "timeout",
        SessionEndReason::Disconnected => "disconnected",
        SessionEndReason::ContainerExit => "container_exit",
        SessionEndReason::UserEnded => "user_ended",
        SessionEndReason::Shutdown => "shutdown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use crate::ratelimit::SlidingWindowLimiter;
    use std::net::Ipv4Addr;

    fn test_config() -> Config {
        let mut config = Config::from_env();
        config.terminal_binary_path = if cfg!(windows) { "cmd.exe" } else { "echo" }.to_string();
        config.session_secret = "k".repeat(40);
        config.session_timeout = Duration::from_secs(3600);
        config.disconnect_grace = Duration::from_millis(50);
        config
    }

    fn harness() -> (Arc<SessionSupervisor>, Arc<ClientRegistry>, Arc<QueueManager>) {
        let config = Arc::new(test_config());
        let queue = Arc::new(QueueManager::new(config.queue_cap, config.average_session_minutes));
        let clients = Arc::new(ClientRegistry::new());
        let kv = Arc::new(InMemoryKv::new());
        let tokens = Arc::new(SessionTokenMap::new());
        let invites = Arc::new(InviteStore::new(
            Arc::clone(&kv) as Arc<dyn KvStore>,
            config.audit_retention,
            SlidingWindowLimiter::new(10, Duration::from_secs(3600)),
        ));
        let supervisor = Arc::new(SessionSupervisor::new(
            Arc::clone(&config),
            Arc::clone(&queue),
            Arc::clone(&clients),
            invites,
            kv as Arc<dyn KvStore>,
            tokens,
        ));
        (supervisor, clients, queue)
    }

    async fn register(clients: &ClientRegistry) -> Uuid {
        let id = Uuid::new_v4();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        clients.register(id, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), "test-agent".into(), tx).await;
        id
    }

    #[tokio::test]
    async fn starts_idle() {
        let (supervisor, _clients, _queue) = harness();
        assert!(supervisor.is_idle().await);
    }

    #[tokio::test]
    async fn promote_rejects_when_not_idle() {
        let (supervisor, clients, _queue) = harness();
        let a = register(&clients).await;
        let b = register(&clients).await;

        if supervisor.promote(a, None, Duration::ZERO).await.is_ok() {
            let err = supervisor.promote(b, None, Duration::ZERO).await.unwrap_err();
            assert!(matches!(err, PromoteError::NotIdle));
        }
    }

    #[tokio::test]
    async fn promote_then_end_returns_to_idle() {
        let (supervisor, clients, _queue) = harness();
        let client_id = register(&clients).await;

        if supervisor.promote(client_id, None, Duration::ZERO).await.is_ok() {
            assert_eq!(supervisor.state().await, SupervisorState::Active);
            let session_id = {
                let inner = supervisor.inner.lock().await;
                inner.current.as_ref().unwrap().session_id
            };
            supervisor.end(session_id, SessionEndReason::UserEnded).await;
            assert!(supervisor.is_idle().await);
        }
    }

    #[tokio::test]
    async fn ending_an_already_superseded_session_is_a_no_op() {
        let (supervisor, clients, _queue) = harness();
        let client_id = register(&clients).await;
        if supervisor.promote(client_id, None, Duration::ZERO).await.is_ok() {
            supervisor.end(Uuid::new_v4(), SessionEndReason::UserEnded).await;
            assert_eq!(supervisor.state().await, SupervisorState::Active);
        }
    }

    #[tokio::test]
    async fn disconnect_then_grace_expiry_ends_session() {
        let (supervisor, clients, _queue) = harness();
        let client_id = register(&clients).await;
        if supervisor.promote(client_id, None, Duration::ZERO).await.is_ok() {
            supervisor.on_client_disconnect(client_id).await;
            assert_eq!(supervisor.state().await, SupervisorState::DisconnectedGrace);
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(supervisor.is_idle().await);
        }
    }

    #[tokio::test]
    async fn reconnect_with_wrong_token_is_rejected() {
        let (supervisor, clients, _queue) = harness();
        let client_id = register(&clients).await;
        if supervisor.promote(client_id, None, Duration::ZERO).await.is_ok() {
            supervisor.on_client_disconnect(client_id).await;
            let new_client = register(&clients).await;
            let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
            let err = supervisor.reconnect(new_client, "not-the-real-token", addr).await.unwrap_err();
            assert_eq!(err, ReconnectError::TokenMismatch);
        }
    }

    #[tokio::test]
    async fn reconnect_not_in_grace_is_rejected() {
        let (supervisor, _clients, _queue) = harness();
        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let err = supervisor.reconnect(Uuid::new_v4(), "whatever", addr).await.unwrap_err();
        assert_eq!(err, ReconnectError::NoSessionInGrace);
    }
}
