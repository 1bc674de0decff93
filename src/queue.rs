//! Demo broker - Queue Manager (spec §4.3)
//!
//! FIFO waiting line for clients who arrive while a session is active.
//! Admission is decided here; promotion itself is the supervisor's job.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// One client waiting for the active-session slot.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub client_id: Uuid,
    pub joined_at: Instant,
    /// Carried through so a client promoted later (not immediately) still
    /// has its invite consumed on session end.
    pub invite_token: Option<String>,
}

/// Outcome of attempting to join the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// The active-session slot was free and empty-queue; caller should be
    /// promoted immediately rather than enqueued.
    PromoteImmediately,
    /// Enqueued at this 1-based position.
    Queued { position: usize },
    /// Queue was already at `queue_cap`.
    Full,
}

/// FIFO queue plus admission/removal operations (spec §4.3).
pub struct QueueManager {
    cap: usize,
    average_session_minutes: u64,
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl QueueManager {
    pub fn new(cap: usize, average_session_minutes: u64) -> Self {
        Self { cap, average_session_minutes, entries: Mutex::new(VecDeque::new()) }
    }

    /// Decide whether `client_id` should be promoted immediately or
    /// enqueued, per the admission algorithm: the session slot being idle
    /// AND the queue being empty is what allows a skip straight to active.
    pub async fn admit(&self, client_id: Uuid, session_slot_idle: bool, invite_token: Option<String>) -> AdmitOutcome {
        let mut entries = self.entries.lock().await;
        if session_slot_idle && entries.is_empty() {
            return AdmitOutcome::PromoteImmediately;
        }
        if entries.len() >= self.cap {
            return AdmitOutcome::Full;
        }
        entries.push_back(QueueEntry { client_id, joined_at: Instant::now(), invite_token });
        AdmitOutcome::Queued { position: entries.len() }
    }

    /// Remove a client who explicitly left or disconnected while queued.
    /// Idempotent: removing an absent client is a no-op.
    pub async fn remove_if_present(&self, client_id: Uuid) -> bool {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.client_id != client_id);
        entries.len() != before
    }

    /// Pop the head of the queue for promotion. Returns `None` if empty.
    pub async fn pop_head(&self) -> Option<QueueEntry> {
        self.entries.lock().await.pop_front()
    }

    /// Look at the head without removing it.
    pub async fn peek_head(&self) -> Option<QueueEntry> {
        self.entries.lock().await.front().cloned()
    }

    /// 1-based position of `client_id`, if still queued.
    pub async fn position_of(&self, client_id: Uuid) -> Option<usize> {
        let entries = self.entries.lock().await;
        entries.iter().position(|e| e.client_id == client_id).map(|idx| idx + 1)
    }

    /// Estimated wait in whole minutes: position ahead of the client times
    /// the configured average session length.
    pub fn estimate_wait(&self, position: usize) -> Duration {
        Duration::from_secs(position as u64 * self.average_session_minutes * 60)
    }

    /// Snapshot of `(client_id, position)` pairs, 1-based, in FIFO order.
    /// Used to broadcast updated positions after the head is popped.
    pub async fn snapshot_positions(&self) -> Vec<(Uuid, usize)> {
        let entries = self.entries.lock().await;
        entries.iter().enumerate().map(|(idx, e)| (e.client_id, idx + 1)).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn log_state(&self) {
        let entries = self.entries.lock().await;
        debug!(depth = entries.len(), cap = self.cap, "queue state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_queue_and_idle_slot_promotes_immediately() {
        let q = QueueManager::new(10, 45);
        let outcome = q.admit(Uuid::new_v4(), true, None).await;
        assert_eq!(outcome, AdmitOutcome::PromoteImmediately);
        assert_eq!(q.len().await, 0);
    }

    #[tokio::test]
    async fn busy_slot_enqueues_in_fifo_order() {
        let q = QueueManager::new(10, 45);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(q.admit(a, false, None).await, AdmitOutcome::Queued { position: 1 });
        assert_eq!(q.admit(b, false, None).await, AdmitOutcome::Queued { position: 2 });

        let head = q.pop_head().await.unwrap();
        assert_eq!(head.client_id, a);
    }

    #[tokio::test]
    async fn queue_full_at_cap() {
        let q = QueueManager::new(2, 45);
        q.admit(Uuid::new_v4(), false, None).await;
        q.admit(Uuid::new_v4(), false, None).await;
        let outcome = q.admit(Uuid::new_v4(), false, None).await;
        assert_eq!(outcome, AdmitOutcome::Full);
    }

    #[tokio::test]
    async fn remove_if_present_is_idempotent() {
        let q = QueueManager::new(10, 45);
        let a = Uuid::new_v4();
        q.admit(a, false, None).await;
        assert!(q.remove_if_present(a).await);
        assert!(!q.remove_if_present(a).await);
    }

    #[tokio::test]
    async fn estimate_wait_scales_with_position_and_average() {
        let q = QueueManager::new(10, 45);
        assert_eq!(q.estimate_wait(2), Duration::from_secs(2 * 45 * 60));
    }

    #[tokio::test]
    async fn snapshot_positions_reflects_fifo_order() {
        let q = QueueManager::new(10, 45);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.admit(a, false, None).await;
        q.admit(b, false, None).await;
        let snapshot = q.snapshot_positions().await;
        assert_eq!(snapshot, vec![(a, 1), (b, 2)]);
    }

    #[tokio::test]
    async fn busy_slot_but_queue_empty_still_enqueues_not_promotes() {
        let q = QueueManager::new(10, 45);
        let outcome = q.admit(Uuid::new_v4(), false, None).await;
        assert_eq!(outcome, AdmitOutcome::Queued { position: 1 });
    }

    #[tokio::test]
    async fn invite_token_is_retained_through_the_queue() {
        let q = QueueManager::new(10, 45);
        let a = Uuid::new_v4();
        q.admit(a, false, Some("tok-123".to_string())).await;
        let head = q.pop_head().await.unwrap();
        assert_eq!(head.invite_token.as_deref(), Some("tok-123"));
    }
}
