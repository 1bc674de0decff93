//! Demo broker - Client Gateway (spec §4.1, §6)
//!
//! Accepts persistent WebSocket connections from browser clients, routes
//! the closed-set inbound/outbound message grammar, and serves the small
//! HTTP surface named in spec §6: session-validation (for the reverse
//! proxy gating downstream dashboards), cookie-set, invite-validation,
//! health/metrics, and the operator admin routes `brokerctl` talks to.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request as HsRequest, Response as HsResponse};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{authenticate_admin, parse_session_token_param, remote_address_from_forwarded_for, AdminAuthResult};
use crate::client::{ClientRegistry, ClientState};
use crate::config::Config;
use crate::invite::{InvalidReason, InviteStore};
use crate::protocol::{ClientMessage, InviteInvalidReason, ServerMessage};
use crate::queue::{AdmitOutcome, QueueManager};
use crate::ratelimit::{LimitOutcome, SlidingWindowLimiter};
use crate::session::SessionSupervisor;
use crate::tokenmap::SessionTokenMap;

/// How long a connection may go without a heartbeat before the gateway
/// treats it as gone (spec §4.1: heartbeat "resets idle disconnect logic").
const HEARTBEAT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

pub struct Gateway {
    config: Arc<Config>,
    clients: Arc<ClientRegistry>,
    queue: Arc<QueueManager>,
    supervisor: Arc<SessionSupervisor>,
    invites: Arc<InviteStore>,
    tokens: Arc<SessionTokenMap>,
    conn_limiter: SlidingWindowLimiter,
    cookie_limiter: SlidingWindowLimiter,
}

impl Gateway {
    pub fn new(
        config: Arc<Config>,
        clients: Arc<ClientRegistry>,
        queue: Arc<QueueManager>,
        supervisor: Arc<SessionSupervisor>,
        invites: Arc<InviteStore>,
        tokens: Arc<SessionTokenMap>,
    ) -> Self {
        let conn_limiter = SlidingWindowLimiter::new(config.rate_limits.conn_opens_per_window, config.rate_limits.conn_window);
        let cookie_limiter = SlidingWindowLimiter::new(config.rate_limits.cookie_requests_per_window, config.rate_limits.cookie_window);
        Self { config, clients, queue, supervisor, invites, tokens, conn_limiter, cookie_limiter }
    }

    /// Drop idle rate-limit buckets. Intended to be driven by a periodic
    /// background sweep alongside the KV store's own TTL reaper.
    pub async fn evict_idle_rate_limits(&self) {
        self.conn_limiter.evict_idle().await;
        self.cookie_limiter.evict_idle().await;
    }

    pub async fn run_ws_listener(self: Arc<Self>) -> std::io::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.ws_port));
        let listener = TcpListener::bind(&addr).await?;
        info!("gateway websocket listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = gateway.handle_connection(stream, peer).await {
                            error!("connection error from {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("accept error: {}", e),
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut forwarded_for: Option<String> = None;
        let mut user_agent: Option<String> = None;
        let mut query_string: Option<String> = None;

        let callback = |req: &HsRequest, response: HsResponse| {
            forwarded_for = req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()).map(str::to_string);
            user_agent = req.headers().get("user-agent").and_then(|v| v.to_str().ok()).map(str::to_string);
            query_string = req.uri().query().map(str::to_string);
            Ok(response)
        };

        let ws_stream = accept_hdr_async(stream, callback).await?;
        let remote_address = remote_address_from_forwarded_for(forwarded_for.as_deref()).unwrap_or(peer.ip());

        if let LimitOutcome::Limited { retry_after } = self.conn_limiter.check_and_record(remote_address).await {
            warn!(%remote_address, ?retry_after, "connection open rate-limited");
            let (mut write, _) = ws_stream.split();
            let _ = write.close().await;
            return Ok(());
        }

        let client_id = Uuid::new_v4();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        self.clients.register(client_id, remote_address, user_agent.unwrap_or_default(), outbound_tx.clone()).await;

        // A fresh connection presenting a session token is attempting to
        // resume during the reconnect-grace window (spec §6).
        if let Some(presented_token) = parse_session_token_param(query_string.as_deref()) {
            match self.supervisor.reconnect(client_id, &presented_token, remote_address).await {
                Ok(()) => info!(%client_id, "reconnected to in-grace session"),
                Err(e) => debug!(%client_id, ?e, "reconnect attempt failed"),
            }
        }

        let queue_size = self.queue.len().await;
        let session_active = !self.supervisor.is_idle().await;
        let _ = outbound_tx.send(ServerMessage::Status { queue_size, session_active });

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let mut idle_deadline = tokio::time::Instant::now() + HEARTBEAT_IDLE_TIMEOUT;

        loop {
            tokio::select! {
                inbound = ws_read.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            idle_deadline = tokio::time::Instant::now() + HEARTBEAT_IDLE_TIMEOUT;
                            self.handle_inbound(client_id, remote_address, &text, &outbound_tx).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(%client_id, error = %e, "websocket read error");
                            break;
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(msg) => {
                            let json = serde_json::to_string(&msg)?;
                            if ws_write.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    debug!(%client_id, "idle timeout, closing connection");
                    break;
                }
            }
        }

        let _ = ws_write.close().await;
        self.on_disconnect(client_id).await;
        Ok(())
    }

    async fn handle_inbound(&self, client_id: Uuid, remote_address: IpAddr, text: &str, outbound: &mpsc::UnboundedSender<ServerMessage>) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(_) => {
                let _ = outbound.send(ServerMessage::error("malformed message"));
                return;
            }
        };

        match message {
            ClientMessage::JoinQueue { invite_token } => self.handle_join_queue(client_id, remote_address, invite_token).await,
            ClientMessage::LeaveQueue => self.handle_leave_queue(client_id).await,
            ClientMessage::Heartbeat => {
                let _ = outbound.send(ServerMessage::HeartbeatAck);
            }
        }
    }

    /// spec §4.3 admission algorithm + §4.2 invite validation, wired
    /// through the Queue Manager and Invite Store.
    async fn handle_join_queue(&self, client_id: Uuid, remote_address: IpAddr, invite_token: Option<String>) {
        // spec §4.1: `join_queue` "requires the client be in Connected
        // state". Rejecting anything else also keeps a client already
        // Queued from re-sending `join_queue` and landing a second
        // `QueueEntry` under the same client id (spec §3, §4.3).
        if self.clients.state_of(client_id).await != Some(ClientState::Connected) {
            self.clients.send(client_id, ServerMessage::error("Already in queue")).await;
            return;
        }

        let token = match invite_token {
            Some(t) => t,
            None => {
                self.clients
                    .send(client_id, ServerMessage::invite_invalid(InviteInvalidReason::Missing, "invite token required"))
                    .await;
                return;
            }
        };

        let invite = match self.invites.validate(&token, remote_address).await {
            Ok(invite) => invite,
            Err(e) => {
                self.clients.send(client_id, ServerMessage::invite_invalid(map_reason(e.reason), e.message)).await;
                return;
            }
        };

        let session_idle = self.supervisor.is_idle().await;
        match self.queue.admit(client_id, session_idle, Some(invite.token.clone())).await {
            AdmitOutcome::PromoteImmediately => {
                self.clients.set_state(client_id, ClientState::Queued).await;
                let supervisor = Arc::clone(&self.supervisor);
                let invite_token = invite.token.clone();
                tokio::spawn(async move {
                    let _ = supervisor.promote(client_id, Some(invite_token), Duration::ZERO).await;
                });
            }
            AdmitOutcome::Queued { position } => {
                self.clients.set_state(client_id, ClientState::Queued).await;
                self.broadcast_positions().await;
                let queue_size = self.queue.len().await;
                let estimated_wait = self.queue.estimate_wait(position).as_secs() / 60;
                self.clients.send(client_id, ServerMessage::QueuePosition { position, estimated_wait, queue_size }).await;
            }
            AdmitOutcome::Full => {
                self.clients.send(client_id, ServerMessage::QueueFull { message: "queue is full, try again later".into() }).await;
            }
        }
    }

    async fn handle_leave_queue(&self, client_id: Uuid) {
        if self.clients.state_of(client_id).await != Some(ClientState::Queued) {
            return;
        }
        if self.queue.remove_if_present(client_id).await {
            self.clients.set_state(client_id, ClientState::Connected).await;
            self.clients.send(client_id, ServerMessage::LeftQueue).await;
            self.broadcast_positions().await;
        }
    }

    /// Emit a fresh `queue_position` to every still-queued client (spec §4.3).
    async fn broadcast_positions(&self) {
        let queue_size = self.queue.len().await;
        for (client_id, position) in self.queue.snapshot_positions().await {
            let estimated_wait = self.queue.estimate_wait(position).as_secs() / 60;
            self.clients.send(client_id, ServerMessage::QueuePosition { position, estimated_wait, queue_size }).await;
        }
    }

    async fn on_disconnect(&self, client_id: Uuid) {
        let state = self.clients.state_of(client_id).await;
        if state == Some(ClientState::Queued) {
            self.queue.remove_if_present(client_id).await;
            self.broadcast_positions().await;
        }
        self.supervisor.on_client_disconnect(client_id).await;
        // DisconnectedGrace keeps the session alive on the Supervisor
        // side; the client record itself is still torn down here, since
        // the Supervisor addresses sessions by client id and tolerates a
        // lookup miss (spec §9 cyclic-reference resolution).
        self.clients.unregister(client_id).await;
    }

    pub async fn run_http_listener(self: Arc<Self>) -> std::io::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.admin_port));
        let listener = TcpListener::bind(&addr).await?;
        info!("gateway admin/http listening on {}", addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let gateway = Arc::clone(&self);

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let gateway = Arc::clone(&gateway);
                    async move { gateway.route_http(req).await }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("http connection error: {}", e);
                }
            });
        }
    }

    async fn route_http(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        let result = match (&method, path.as_str()) {
            (&Method::GET, "/healthz") => Ok(text_response(StatusCode::OK, "ok")),
            (&Method::GET, "/readyz") => Ok(text_response(StatusCode::OK, "ok")),
            (&Method::GET, "/metrics") => Ok(self.render_metrics().await),
            (&Method::GET, "/session/validate") => Ok(self.handle_validate(&req, query.as_deref()).await),
            (&Method::POST, "/session/cookie") => Ok(self.handle_cookie_set(req).await),
            (&Method::GET, "/invite/validate") => Ok(self.handle_invite_validate(&req, query.as_deref()).await),
            (&Method::POST, "/admin/invites") => Ok(self.handle_admin_generate(req).await),
            (&Method::GET, "/admin/invites") => Ok(self.handle_admin_list(&req, query.as_deref()).await),
            _ if path.starts_with("/admin/invites/") => Ok(self.handle_admin_single(&req, &method, &path).await),
            _ => Ok(text_response(StatusCode::NOT_FOUND, "not found")),
        };

        result
    }

    async fn render_metrics(&self) -> Response<Full<Bytes>> {
        let body = format!(
            "# HELP broker_queue_depth Clients currently queued\n\
             # TYPE broker_queue_depth gauge\n\
             broker_queue_depth {}\n\
             # HELP broker_session_active Whether a session is active (0/1)\n\
             # TYPE broker_session_active gauge\n\
             broker_session_active {}\n\
             # HELP broker_connected_clients Currently registered client connections\n\
             # TYPE broker_connected_clients gauge\n\
             broker_connected_clients {}\n",
            self.queue.len().await,
            if self.supervisor.is_idle().await { 0 } else { 1 },
            self.clients.count().await,
        );
        text_response(StatusCode::OK, &body)
    }

    fn bearer_header(req: &Request<Incoming>) -> Option<String> {
        req.headers().get("authorization").and_then(|v| v.to_str().ok()).map(str::to_string)
    }

    fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
        query?.split('&').find_map(|pair| pair.split_once('=').filter(|(k, _)| *k == key).map(|(_, v)| v))
    }

    fn cookie_token(req: &Request<Incoming>) -> Option<String> {
        let header = req.headers().get("cookie")?.to_str().ok()?;
        header.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == "session").then(|| v.to_string())
        })
    }

    fn peer_addr(req: &Request<Incoming>) -> Option<IpAddr> {
        let header = req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok());
        remote_address_from_forwarded_for(header)
    }

    /// Spec §6 session-validation endpoint.
    async fn handle_validate(&self, req: &Request<Incoming>, query: Option<&str>) -> Response<Full<Bytes>> {
        let token = Self::cookie_token(req).or_else(|| Self::query_param(query, "token").map(str::to_string));
        let Some(token) = token else {
            return text_response(StatusCode::UNAUTHORIZED, "missing session token");
        };
        let Some(caller) = Self::peer_addr(req) else {
            return text_response(StatusCode::UNAUTHORIZED, "unable to determine remote address");
        };

        match self.tokens.validate(&token, caller).await {
            Some(session_id) => Response::builder()
                .status(StatusCode::OK)
                .header("x-broker-session-id", session_id.to_string())
                .body(Full::new(Bytes::from("ok")))
                .unwrap(),
            None => text_response(StatusCode::UNAUTHORIZED, "invalid session"),
        }
    }

    /// Spec §6 cookie-set endpoint.
    async fn handle_cookie_set(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let Some(caller) = Self::peer_addr(&req) else {
            return text_response(StatusCode::UNAUTHORIZED, "unable to determine remote address");
        };

        if let LimitOutcome::Limited { retry_after } = self.cookie_limiter.check_and_record(caller).await {
            return retry_after_response(retry_after);
        }

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return text_response(StatusCode::BAD_REQUEST, "invalid body"),
        };
        let parsed: serde_json::Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(_) => return text_response(StatusCode::BAD_REQUEST, "invalid json"),
        };
        let Some(token) = parsed.get("token").and_then(|v| v.as_str()) else {
            return text_response(StatusCode::BAD_REQUEST, "missing token");
        };

        match self.tokens.validate(token, caller).await {
            Some(_) => {
                let secure = if self.config.terminal_url_base.starts_with("https") { "; Secure" } else { "" };
                let cookie = format!("session={token}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}{}", self.config.session_timeout.as_secs(), secure);
                Response::builder().status(StatusCode::OK).header("set-cookie", cookie).body(Full::new(Bytes::from("ok"))).unwrap()
            }
            None => text_response(StatusCode::UNAUTHORIZED, "invalid session"),
        }
    }

    /// Spec §6 invite-validation endpoint.
    async fn handle_invite_validate(&self, req: &Request<Incoming>, query: Option<&str>) -> Response<Full<Bytes>> {
        let token = req
            .headers()
            .get("x-invite-token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| Self::query_param(query, "token").map(str::to_string))
            .unwrap_or_default();
        let Some(caller) = Self::peer_addr(req) else {
            return text_response(StatusCode::BAD_REQUEST, "unable to determine remote address");
        };

        match self.invites.validate(&token, caller).await {
            Ok(invite) => json_response(StatusCode::OK, &serde_json::json!({ "status": "ok", "token": invite.token })),
            Err(e) => json_response(StatusCode::OK, &serde_json::json!({ "status": "invalid", "reason": e.reason.as_str() })),
        }
    }

    fn authorize_admin(&self, req: &Request<Incoming>) -> Result<(), Response<Full<Bytes>>> {
        match authenticate_admin(&self.config.admin_token, Self::bearer_header(req).as_deref()) {
            AdminAuthResult::Authenticated => Ok(()),
            AdminAuthResult::NotConfigured => Err(text_response(StatusCode::SERVICE_UNAVAILABLE, "admin surface disabled")),
            AdminAuthResult::Failed(_) => Err(text_response(StatusCode::UNAUTHORIZED, "unauthorized")),
        }
    }

    async fn handle_admin_generate(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        if let Err(resp) = self.authorize_admin(&req) {
            return resp;
        }
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return text_response(StatusCode::BAD_REQUEST, "invalid body"),
        };
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();

        let expires_in_secs = parsed.get("expires_in_secs").and_then(|v| v.as_u64()).unwrap_or(3600);
        let max_uses = parsed.get("max_uses").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
        let label = parsed.get("label").and_then(|v| v.as_str()).map(str::to_string);
        let custom_token = parsed.get("token").and_then(|v| v.as_str()).map(str::to_string);

        match self.invites.generate(Duration::from_secs(expires_in_secs), max_uses, label, Some("operator".into()), custom_token).await {
            Ok(invite) => json_response(StatusCode::OK, &invite),
            Err(e) => json_response(StatusCode::CONFLICT, &serde_json::json!({ "error": e.message })),
        }
    }

    async fn handle_admin_list(&self, req: &Request<Incoming>, query: Option<&str>) -> Response<Full<Bytes>> {
        if let Err(resp) = self.authorize_admin(req) {
            return resp;
        }
        let status_filter = Self::query_param(query, "status").and_then(parse_status);
        match self.invites.list(status_filter).await {
            Ok(invites) => json_response(StatusCode::OK, &invites),
            Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, &serde_json::json!({ "error": e.message })),
        }
    }

    async fn handle_admin_single(&self, req: &Request<Incoming>, method: &Method, path: &str) -> Response<Full<Bytes>> {
        if let Err(resp) = self.authorize_admin(req) {
            return resp;
        }
        let token = path.trim_start_matches("/admin/invites/");
        match *method {
            Method::GET => match self.invites.info(token).await {
                Ok(Some(invite)) => json_response(StatusCode::OK, &invite),
                Ok(None) => text_response(StatusCode::NOT_FOUND, "invite not found"),
                Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, &serde_json::json!({ "error": e.message })),
            },
            Method::DELETE => match self.invites.revoke(token).await {
                Ok(()) => text_response(StatusCode::OK, "revoked"),
                Err(e) => json_response(StatusCode::NOT_FOUND, &serde_json::json!({ "error": e.message })),
            },
            _ => text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        }
    }
}

fn map_reason(reason: InvalidReason) -> InviteInvalidReason {
    match reason {
        InvalidReason::Missing => InviteInvalidReason::Missing,
        InvalidReason::Invalid => InviteInvalidReason::Invalid,
        InvalidReason::NotFound => InviteInvalidReason::NotFound,
        InvalidReason::Revoked => InviteInvalidReason::Revoked,
        InvalidReason::Used => InviteInvalidReason::Used,
        InvalidReason::Expired => InviteInvalidReason::Expired,
        InvalidReason::RateLimited => InviteInvalidReason::RateLimited,
    }
}

fn parse_status(s: &str) -> Option<crate::invite::InviteStatus> {
    use crate::invite::InviteStatus::*;
    match s {
        "pending" => Some(Pending),
        "used" => Some(Used),
        "expired" => Some(Expired),
        "revoked" => Some(Revoked),
        _ => None,
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder().status(status).body(Full::new(Bytes::from(body.to_string()))).unwrap()
}

fn json_response(status: StatusCode, value: &impl serde::Serialize) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder().status(status).header("content-type", "application/json").body(Full::new(Bytes::from(body))).unwrap()
}

fn retry_after_response(retry_after: Duration) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header("retry-after", retry_after.as_secs().to_string())
        .body(Full::new(Bytes::from("rate limited")))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use std::net::Ipv4Addr;

    fn test_config() -> Config {
        let mut config = Config::from_env();
        config.terminal_binary_path = if cfg!(windows) { "cmd.exe" } else { "echo" }.to_string();
        config.session_secret = "k".repeat(40);
        config
    }

    fn harness() -> Gateway {
        let config = Arc::new(test_config());
        let queue = Arc::new(QueueManager::new(config.queue_cap, config.average_session_minutes));
        let clients = Arc::new(ClientRegistry::new());
        let kv = Arc::new(InMemoryKv::new());
        let tokens = Arc::new(SessionTokenMap::new());
        let invites = Arc::new(InviteStore::new(
            Arc::clone(&kv) as Arc<dyn crate::kv::KvStore>,
            config.audit_retention,
            SlidingWindowLimiter::new(10, Duration::from_secs(3600)),
        ));
        let supervisor = Arc::new(SessionSupervisor::new(
            Arc::clone(&config),
            Arc::clone(&queue),
            Arc::clone(&clients),
            Arc::clone(&invites),
            kv as Arc<dyn crate::kv::KvStore>,
            Arc::clone(&tokens),
        ));
        Gateway::new(config, clients, queue, supervisor, invites, tokens)
    }

    async fn register(gateway: &Gateway) -> Uuid {
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        gateway.clients.register(id, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), "test-agent".into(), tx).await;
        id
    }

    #[tokio::test]
    async fn resending_join_queue_while_already_queued_does_not_duplicate_entry() {
        let gateway = harness();
        let invite = gateway.invites.generate(Duration::from_secs(3600), 1, None, None, None).await.unwrap();

        // Occupy the active slot with a different client so the next
        // `join_queue` actually queues instead of promoting immediately.
        let occupant = register(&gateway).await;
        gateway.handle_join_queue(occupant, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), Some(invite.token.clone())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!gateway.supervisor.is_idle().await);

        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let client = register(&gateway).await;
        gateway.handle_join_queue(client, addr, Some(invite.token.clone())).await;
        assert_eq!(gateway.queue.len().await, 1);
        assert_eq!(gateway.clients.state_of(client).await, Some(ClientState::Queued));

        // A client re-sending `join_queue` while already Queued must not
        // land a second entry under the same client id (spec §3, §4.3).
        gateway.handle_join_queue(client, addr, Some(invite.token.clone())).await;
        assert_eq!(gateway.queue.len().await, 1);
        assert_eq!(gateway.queue.position_of(client).await, Some(1));
    }

    #[tokio::test]
    async fn join_queue_from_active_client_is_rejected() {
        let gateway = harness();
        let invite = gateway.invites.generate(Duration::from_secs(3600), 1, None, None, None).await.unwrap();
        let addr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let client = register(&gateway).await;

        // Idle slot + empty queue promotes immediately, landing the client
        // in Active state.
        gateway.handle_join_queue(client, addr, Some(invite.token.clone())).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gateway.clients.state_of(client).await, Some(ClientState::Active));

        gateway.handle_join_queue(client, addr, Some(invite.token)).await;
        assert_eq!(gateway.queue.len().await, 0);
    }
}
