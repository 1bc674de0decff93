//! Demo broker - Configuration module
//!
//! Handles environment-driven configuration with startup logging.

use std::env;
use std::time::Duration;
use tracing::info;

/// Minimum acceptable length, in bytes, of the session secret.
pub const MIN_SESSION_SECRET_BYTES: usize = 32;

/// Literals operators sometimes paste in by accident; never acceptable in production.
const WEAK_SECRET_LITERALS: &[&str] = &["changeme", "secret", "password", "default", "test"];

/// Broker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket gateway port.
    pub ws_port: u16,
    /// Admin/health/metrics HTTP port.
    pub admin_port: u16,
    /// Path to the terminal multiplexer binary spawned per session.
    pub terminal_binary_path: String,
    /// Session hard-expiry timeout.
    pub session_timeout: Duration,
    /// Maximum number of clients the queue will hold.
    pub queue_cap: usize,
    /// Used only for the wait-time estimate shown to queued clients.
    pub average_session_minutes: u64,
    /// How long a DisconnectedGrace session waits for reconnect.
    pub disconnect_grace: Duration,
    /// How long invite audit trails persist past invite expiry.
    pub audit_retention: Duration,
    /// Directory holding one credential file per active session.
    pub credential_dir: String,
    /// Connection string for the external key-value store.
    pub kv_url: String,
    /// HMAC key for session tokens. MUST be >= 32 bytes and not a known weak literal.
    pub session_secret: String,
    /// Bearer token gating the /admin/* surface. Never logged.
    pub admin_token: Option<String>,
    /// Sliding-window thresholds and windows (see §4.5).
    pub rate_limits: RateLimitConfig,
    /// Base URL template the client uses to reach the terminal once a
    /// session starts (session id is appended by the caller).
    pub terminal_url_base: String,
    /// External script invoked after a session ends to restore the sandbox.
    pub data_reset_script: Option<String>,
    /// Secrets handed to the terminal process by credential file, never logged.
    pub credentials: CredentialConfig,
}

/// Ambient secrets written into each session's credential file (spec §4.4
/// step 5). Never logged; only the file path is ever passed to the child.
#[derive(Clone)]
pub struct CredentialConfig {
    pub issue_tracker_token: String,
    pub issue_tracker_email: String,
    pub issue_tracker_site_url: String,
    pub model_provider_token: String,
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig").field("issue_tracker_site_url", &self.issue_tracker_site_url).finish_non_exhaustive()
    }
}

/// Sliding-window rate-limit configuration (spec §4.5).
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub conn_opens_per_window: u32,
    pub conn_window: Duration,
    pub invite_failures_per_window: u32,
    pub invite_failure_window: Duration,
    pub cookie_requests_per_window: u32,
    pub cookie_window: Duration,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

impl Config {
    /// Load configuration from environment variables, applying spec-default values.
    pub fn from_env() -> Self {
        Self {
            ws_port: env_parse("BROKER_WS_PORT", 9000),
            admin_port: env_parse("BROKER_ADMIN_PORT", 9001),
            terminal_binary_path: env::var("BROKER_TERMINAL_BINARY")
                .unwrap_or_else(|_| "odd-dashboard".to_string()),
            session_timeout: Duration::from_secs(env_parse::<u64>("BROKER_SESSION_TIMEOUT_MIN", 60) * 60),
            queue_cap: env_parse("BROKER_QUEUE_CAP", 10),
            average_session_minutes: env_parse("BROKER_AVG_SESSION_MINUTES", 45),
            disconnect_grace: Duration::from_millis(env_parse("BROKER_DISCONNECT_GRACE_MS", 10_000)),
            audit_retention: Duration::from_secs(env_parse::<u64>("BROKER_AUDIT_RETENTION_DAYS", 30) * 86_400),
            credential_dir: env::var("BROKER_CREDENTIAL_DIR")
                .unwrap_or_else(|_| "/tmp/demo-broker/credentials".to_string()),
            kv_url: env::var("BROKER_KV_URL").unwrap_or_else(|_| "memory://local".to_string()),
            session_secret: env::var("BROKER_SESSION_SECRET").unwrap_or_default(),
            admin_token: env::var("BROKER_ADMIN_TOKEN").ok(),
            rate_limits: RateLimitConfig {
                conn_opens_per_window: env_parse("BROKER_RL_CONN_OPENS", 20),
                conn_window: env_secs("BROKER_RL_CONN_WINDOW_SECS", 60),
                invite_failures_per_window: env_parse("BROKER_RL_INVITE_FAILURES", 10),
                invite_failure_window: env_secs("BROKER_RL_INVITE_WINDOW_SECS", 3600),
                cookie_requests_per_window: env_parse("BROKER_RL_COOKIE_REQUESTS", 30),
                cookie_window: env_secs("BROKER_RL_COOKIE_WINDOW_SECS", 60),
            },
            terminal_url_base: env::var("BROKER_TERMINAL_URL_BASE")
                .unwrap_or_else(|_| "https://demo-broker.local/terminal".to_string()),
            data_reset_script: env::var("BROKER_DATA_RESET_SCRIPT").ok(),
            credentials: CredentialConfig {
                issue_tracker_token: env::var("BROKER_ISSUE_TRACKER_TOKEN").unwrap_or_default(),
                issue_tracker_email: env::var("BROKER_ISSUE_TRACKER_EMAIL").unwrap_or_default(),
                issue_tracker_site_url: env::var("BROKER_ISSUE_TRACKER_SITE_URL").unwrap_or_default(),
                model_provider_token: env::var("BROKER_MODEL_PROVIDER_TOKEN").unwrap_or_default(),
            },
        }
    }

    /// Hard expiry, as computed from the configured session timeout.
    pub fn hard_expiry(&self, start: std::time::Instant) -> std::time::Instant {
        start + self.session_timeout
    }

    /// Warning fires this long before hard expiry.
    pub fn warning_lead(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    /// The hard-kill backstop fires this long after hard expiry.
    pub fn hard_kill_lead(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    /// Check the fatal startup invariants from spec §7. Returns the first violation found.
    pub fn check_fatal_invariants(&self) -> Result<(), String> {
        if self.session_secret.as_bytes().len() < MIN_SESSION_SECRET_BYTES {
            return Err(format!(
                "session secret must be at least {MIN_SESSION_SECRET_BYTES} bytes (got {})",
                self.session_secret.as_bytes().len()
            ));
        }
        let lowered = self.session_secret.to_lowercase();
        if WEAK_SECRET_LITERALS.iter().any(|weak| lowered.contains(weak)) {
            return Err("session secret matches a known weak literal".to_string());
        }
        self.check_credential_dir_writable()?;
        Ok(())
    }

    /// The credential directory must exist (or be creatable) and accept a
    /// write before the broker ever promotes a client; spec §7 treats an
    /// unwritable directory as a fatal invariant rather than a per-session
    /// failure, so it is checked once at startup.
    fn check_credential_dir_writable(&self) -> Result<(), String> {
        std::fs::create_dir_all(&self.credential_dir)
            .map_err(|e| format!("credential directory '{}' is not writable: {e}", self.credential_dir))?;
        let probe = std::path::Path::new(&self.credential_dir).join(".write-probe");
        std::fs::write(&probe, b"")
            .map_err(|e| format!("credential directory '{}' is not writable: {e}", self.credential_dir))?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    }

    /// Log configuration at startup. The session secret and admin token are NEVER logged.
    pub fn log_startup(&self) {
        info!(
            "broker config: ws_port={}, admin_port={}, session_timeout={}s, queue_cap={}, \
             avg_session_min={}, disconnect_grace={}ms, audit_retention={}d",
            self.ws_port,
            self.admin_port,
            self.session_timeout.as_secs(),
            self.queue_cap,
            self.average_session_minutes,
            self.disconnect_grace.as_millis(),
            self.audit_retention.as_secs() / 86_400,
        );
        info!("broker credential_dir={}, kv_url={}", self.credential_dir, self.kv_url);
        if self.admin_token.is_some() {
            info!("broker admin surface: enabled (token configured)");
        } else {
            info!("broker admin surface: disabled (no BROKER_ADMIN_TOKEN configured)");
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
