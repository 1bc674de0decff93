//! Demo broker entry point.
//!
//! Wires the ambient collaborators (KV store, rate limiters) to the
//! queue, invite, client, and session-supervisor modules, then runs the
//! WebSocket gateway and the admin/health HTTP surface side by side.

use std::sync::Arc;

use demo_broker::client::ClientRegistry;
use demo_broker::config::Config;
use demo_broker::gateway::Gateway;
use demo_broker::invite::InviteStore;
use demo_broker::kv::{InMemoryKv, KvStore};
use demo_broker::protocol::SessionEndReason;
use demo_broker::queue::QueueManager;
use demo_broker::ratelimit::SlidingWindowLimiter;
use demo_broker::session::SessionSupervisor;
use demo_broker::tokenmap::SessionTokenMap;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();
    if let Err(reason) = config.check_fatal_invariants() {
        error!("fatal configuration error: {}", reason);
        std::process::exit(1);
    }
    config.log_startup();

    let config = Arc::new(config);
    let kv_backend = Arc::new(InMemoryKv::new());
    let kv: Arc<dyn KvStore> = Arc::clone(&kv_backend) as Arc<dyn KvStore>;
    let queue = Arc::new(QueueManager::new(config.queue_cap, config.average_session_minutes));
    let clients = Arc::new(ClientRegistry::new());
    let tokens = Arc::new(SessionTokenMap::new());

    let invite_failure_limiter =
        SlidingWindowLimiter::new(config.rate_limits.invite_failures_per_window, config.rate_limits.invite_failure_window);
    let invites = Arc::new(InviteStore::new(Arc::clone(&kv), config.audit_retention, invite_failure_limiter));

    let supervisor = Arc::new(SessionSupervisor::new(
        Arc::clone(&config),
        Arc::clone(&queue),
        Arc::clone(&clients),
        Arc::clone(&invites),
        Arc::clone(&kv),
        Arc::clone(&tokens),
    ));

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&config),
        Arc::clone(&clients),
        Arc::clone(&queue),
        Arc::clone(&supervisor),
        Arc::clone(&invites),
        Arc::clone(&tokens),
    ));

    spawn_cleanup_loop(Arc::clone(&kv_backend), Arc::clone(&queue), Arc::clone(&invites), Arc::clone(&gateway));

    let ws_gateway = Arc::clone(&gateway);
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_gateway.run_ws_listener().await {
            error!("websocket listener exited: {}", e);
        }
    });

    let http_gateway = Arc::clone(&gateway);
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_gateway.run_http_listener().await {
            error!("admin/http listener exited: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = ws_handle => {
            error!("websocket listener task ended unexpectedly");
        }
        _ = http_handle => {
            error!("http listener task ended unexpectedly");
        }
    }

    // Operator shutdown: end any active session with reason=shutdown so
    // the owning client is notified and the terminal process is reaped,
    // rather than leaving it orphaned (spec §4.4 failure semantics).
    if let Some(session_id) = supervisor.current_session_id().await {
        supervisor.end(session_id, SessionEndReason::Shutdown).await;
    }

    info!("broker shut down cleanly");
}

/// Periodic background sweeps: evict expired KV entries, drop idle
/// rate-limit buckets, and log queue depth (spec §4.5, §7).
fn spawn_cleanup_loop(kv: Arc<InMemoryKv>, queue: Arc<QueueManager>, invites: Arc<InviteStore>, gateway: Arc<Gateway>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            queue.log_state().await;
            kv.reap_expired().await;
            invites.evict_idle_rate_limits().await;
            gateway.evict_idle_rate_limits().await;
        }
    });
}
