//! Demo broker - WebSocket protocol types (spec §4.1)
//!
//! Defines the message contract between browser client and broker.

use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the queue, or be promoted immediately if the slot is idle.
    JoinQueue {
        #[serde(rename = "inviteToken", skip_serializing_if = "Option::is_none")]
        invite_token: Option<String>,
    },
    /// Only valid from Queued; silently a no-op otherwise.
    LeaveQueue,
    /// Acknowledged with `heartbeat_ack`; resets idle disconnect logic.
    Heartbeat,
}

/// Reasons an invite failed validation (closed set, spec §4.1, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteInvalidReason {
    NotFound,
    Expired,
    Used,
    Revoked,
    Invalid,
    RateLimited,
    Missing,
}

/// Why a session ended (closed set, spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    Timeout,
    Disconnected,
    ContainerExit,
    UserEnded,
    Shutdown,
}

/// Messages sent from server to client (closed set, spec §4.1).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once immediately after connect.
    Status {
        queue_size: usize,
        session_active: bool,
    },
    /// Sent on enqueue and on every queue-order change.
    QueuePosition {
        /// 1-indexed.
        position: usize,
        /// Minutes.
        estimated_wait: u64,
        queue_size: usize,
    },
    QueueFull {
        message: String,
    },
    LeftQueue,
    SessionStarting {
        terminal_url: String,
        expires_at: String,
        session_token: String,
    },
    /// Fires once, ~5 min before hard expiry.
    SessionWarning {
        minutes_remaining: u64,
    },
    SessionEnded {
        reason: SessionEndReason,
        clear_session_cookie: bool,
    },
    InviteInvalid {
        reason: InviteInvalidReason,
        message: String,
    },
    /// Malformed input or internal failure.
    Error {
        message: String,
    },
    HeartbeatAck,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    pub fn invite_invalid(reason: InviteInvalidReason, message: impl Into<String>) -> Self {
        Self::InviteInvalid { reason, message: message.into() }
    }
}
