//! Demo broker - Invite Store (spec §4.2)
//!
//! CRUD over invite records, closed-set validation reason codes, and the
//! per-use audit trail. Records live in the KV store collaborator so they
//! survive broker restarts within their TTL; the store itself is the sole
//! writer, matching the ownership rule in spec §3.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::kv::{KvError, KvStore};
use crate::ratelimit::{LimitOutcome, SlidingWindowLimiter};

const TOKEN_PREFIX: &str = "invite:";
const MIN_TOKEN_ENTROPY_BYTES: usize = 16;
const MIN_TOKEN_LEN: usize = 10;

/// Invite lifecycle status (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteStatus {
    Pending,
    Used,
    Expired,
    Revoked,
}

/// One completed session's usage of an invite (spec §3 audit trail entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUsageRecord {
    pub session_id: String,
    pub client_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub end_reason: String,
    pub queue_wait_ms: u64,
    pub remote_address: String,
    pub user_agent: String,
    pub errors: Vec<String>,
}

/// Persisted invite record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteRecord {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: InviteStatus,
    pub max_uses: u32,
    pub use_count: u32,
    pub label: Option<String>,
    pub creator: Option<String>,
    pub audit_trail: Vec<SessionUsageRecord>,
}

impl InviteRecord {
    fn ttl_from_now(&self, audit_retention: Duration) -> Duration {
        let expiry_delta = (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        expiry_delta + audit_retention
    }
}

/// Closed-set reasons a `validate` call can fail with (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Missing,
    Invalid,
    NotFound,
    Revoked,
    Used,
    Expired,
    RateLimited,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Invalid => "invalid",
            Self::NotFound => "not_found",
            Self::Revoked => "revoked",
            Self::Used => "used",
            Self::Expired => "expired",
            Self::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InviteError {
    pub reason: InvalidReason,
    pub message: String,
}

impl std::fmt::Display for InviteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.reason.as_str(), self.message)
    }
}

impl std::error::Error for InviteError {}

fn key_for(token: &str) -> String {
    format!("{TOKEN_PREFIX}{token}")
}

fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; MIN_TOKEN_ENTROPY_BYTES] = rng.gen();
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

/// Operations over invite records (spec §4.2).
pub struct InviteStore {
    kv: Arc<dyn KvStore>,
    audit_retention: Duration,
    failure_limiter: SlidingWindowLimiter,
}

impl InviteStore {
    pub fn new(kv: Arc<dyn KvStore>, audit_retention: Duration, failure_limiter: SlidingWindowLimiter) -> Self {
        Self { kv, audit_retention, failure_limiter }
    }

    /// `generate(expires_in, max_uses=1, label?) -> invite`
    ///
    /// Atomic: create high-entropy token, write record with computed TTL.
    /// A caller-supplied vanity token is rejected if it already exists
    /// (spec §9 open question; this crate takes the stricter reading).
    pub async fn generate(
        &self,
        expires_in: Duration,
        max_uses: u32,
        label: Option<String>,
        creator: Option<String>,
        custom_token: Option<String>,
    ) -> Result<InviteRecord, InviteError> {
        let token = match custom_token {
            Some(t) => {
                if self.kv.get(&key_for(&t)).await.map_err(kv_unavailable)?.is_some() {
                    return Err(InviteError {
                        reason: InvalidReason::Invalid,
                        message: format!("token '{t}' already exists"),
                    });
                }
                t
            }
            None => generate_token(),
        };

        let now = Utc::now();
        let record = InviteRecord {
            token: token.clone(),
            created_at: now,
            expires_at: now + chrono::Duration::from_std(expires_in).unwrap_or(chrono::Duration::zero()),
            status: InviteStatus::Pending,
            max_uses: max_uses.max(1),
            use_count: 0,
            label,
            creator,
            audit_trail: Vec::new(),
        };

        self.persist(&record).await?;
        info!(token = %mask(&token), "invite generated");
        Ok(record)
    }

    async fn persist(&self, record: &InviteRecord) -> Result<(), InviteError> {
        let ttl = record.ttl_from_now(self.audit_retention);
        let body = serde_json::to_string(record).expect("InviteRecord always serializes");
        self.kv.set_with_ttl(&key_for(&record.token), body, ttl).await.map_err(kv_unavailable)
    }

    async fn load(&self, token: &str) -> Result<Option<InviteRecord>, KvError> {
        match self.kv.get(&key_for(token)).await? {
            Some(body) => Ok(serde_json::from_str(&body).ok()),
            None => Ok(None),
        }
    }

    /// `validate(token, remote_address) -> Ok(invite) | Err(reason, message)`
    ///
    /// Exact check ordering per spec §4.2: malformed -> not found -> revoked
    /// -> used/cap-reached -> expired (with state-fix) -> OK. Any failure is
    /// recorded against the caller's remote address for brute-force defense;
    /// successful validations do NOT reset the counter.
    pub async fn validate(&self, token: &str, remote_address: IpAddr) -> Result<InviteRecord, InviteError> {
        if let LimitOutcome::Limited { .. } = self.failure_limiter.peek(remote_address).await {
            return Err(InviteError { reason: InvalidReason::RateLimited, message: "too many failed attempts".into() });
        }

        let result = self.validate_inner(token).await;
        if let Err(ref e) = result {
            self.failure_limiter.check_and_record(remote_address).await;
            warn!(reason = e.reason.as_str(), "invite validation failed");
        }
        result
    }

    async fn validate_inner(&self, token: &str) -> Result<InviteRecord, InviteError> {
        if token.is_empty() {
            return Err(InviteError { reason: InvalidReason::Missing, message: "invite token missing".into() });
        }
        if token.len() < MIN_TOKEN_LEN {
            return Err(InviteError { reason: InvalidReason::Invalid, message: "invite token malformed".into() });
        }

        let mut record = match self.load(token).await.map_err(kv_unavailable)? {
            Some(r) => r,
            None => return Err(InviteError { reason: InvalidReason::NotFound, message: "invite not found".into() }),
        };

        if record.status == InviteStatus::Revoked {
            return Err(InviteError { reason: InvalidReason::Revoked, message: "invite revoked".into() });
        }

        if record.status == InviteStatus::Used || record.use_count >= record.max_uses {
            return Err(InviteError { reason: InvalidReason::Used, message: "invite already used".into() });
        }

        if record.status == InviteStatus::Expired || Utc::now() > record.expires_at {
            if record.status != InviteStatus::Expired {
                record.status = InviteStatus::Expired;
                let _ = self.persist(&record).await;
            }
            return Err(InviteError { reason: InvalidReason::Expired, message: "invite expired".into() });
        }

        Ok(record)
    }

    /// `consume(token, session_summary)`
    ///
    /// Appends the audit record, increments use count, flips to Used at
    /// cap, and extends the TTL so usage history survives invite expiry.
    pub async fn consume(&self, token: &str, summary: SessionUsageRecord) -> Result<(), InviteError> {
        let mut record = match self.load(token).await.map_err(kv_unavailable)? {
            Some(r) => r,
            None => return Err(InviteError { reason: InvalidReason::NotFound, message: "invite not found".into() }),
        };

        record.audit_trail.push(summary);
        record.use_count += 1;
        if record.use_count >= record.max_uses {
            record.status = InviteStatus::Used;
        }

        self.persist(&record).await
    }

    /// `revoke(token)` - flip to Revoked, preserving remaining TTL.
    pub async fn revoke(&self, token: &str) -> Result<(), InviteError> {
        let mut record = match self.load(token).await.map_err(kv_unavailable)? {
            Some(r) => r,
            None => return Err(InviteError { reason: InvalidReason::NotFound, message: "invite not found".into() }),
        };
        record.status = InviteStatus::Revoked;
        self.persist(&record).await
    }

    /// Operator query: fetch one invite by token, regardless of status.
    pub async fn info(&self, token: &str) -> Result<Option<InviteRecord>, InviteError> {
        self.load(token).await.map_err(kv_unavailable)
    }

    /// Drop idle brute-force counters, paired with the KV store's own TTL
    /// reaper in the broker's periodic cleanup sweep.
    pub async fn evict_idle_rate_limits(&self) {
        self.failure_limiter.evict_idle().await;
    }

    /// Operator query: list invites, optionally filtered by status.
    pub async fn list(&self, filter: Option<InviteStatus>) -> Result<Vec<InviteRecord>, InviteError> {
        let entries = self.kv.scan_prefix(TOKEN_PREFIX).await.map_err(kv_unavailable)?;
        let mut records: Vec<InviteRecord> =
            entries.into_iter().filter_map(|(_, body)| serde_json::from_str(&body).ok()).collect();
        if let Some(status) = filter {
            records.retain(|r| r.status == status);
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

fn kv_unavailable(e: KvError) -> InviteError {
    InviteError { reason: InvalidReason::NotFound, message: format!("store unavailable, failing closed: {e}") }
}

/// Never log a full invite token; this mirrors the secrecy of credential
/// file contents elsewhere in the broker.
fn mask(token: &str) -> String {
    if token.len() <= 8 {
        "***".to_string()
    } else {
        format!("{}***", &token[..4])
    }
}
