//! Queue entry model, wire payloads, and sync status DTOs.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Maximum notices retained for the UI before the oldest are dropped.
const NOTICE_BUFFER_CAP: usize = 100;

/// Remote operations the client can queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    #[serde(rename = "cart.add")]
    CartAdd,
    #[serde(rename = "cart.remove")]
    CartRemove,
    #[serde(rename = "cart.set_quantity")]
    CartSetQuantity,
    #[serde(rename = "favorite.add")]
    FavoriteAdd,
    #[serde(rename = "favorite.remove")]
    FavoriteRemove,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CartAdd => "cart.add",
            OperationKind::CartRemove => "cart.remove",
            OperationKind::CartSetQuantity => "cart.set_quantity",
            OperationKind::FavoriteAdd => "favorite.add",
            OperationKind::FavoriteRemove => "favorite.remove",
        }
    }
}

/// One durable queued intent.
///
/// `id` is strictly increasing across the queue's lifetime, including process
/// restarts, and seeds the idempotency token presented to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueEntry {
    pub id: i64,
    #[serde(rename = "operationType")]
    pub operation: OperationKind,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapse_key: Option<String>,
    #[serde(rename = "enqueuedAtTimestamp")]
    pub enqueued_at: String,
}

/// Payload for cart line operations that carry a quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItemPayload {
    pub product_id: String,
    pub quantity: u32,
}

/// Payload for operations that reference a product without extra data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRefPayload {
    pub product_id: String,
}

/// Payload for adding a favorite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoritePayload {
    pub product_id: String,
    #[serde(rename = "addedAtTimestamp")]
    pub added_at: String,
}

/// Remote acknowledgment for one submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmitAck {
    /// The backend applied the operation now.
    Applied,
    /// The backend had already applied this idempotency token.
    AlreadyApplied,
}

/// What the UI needs to render a sync indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: usize,
    pub consecutive_failures: i32,
    pub next_retry_at: Option<String>,
}

/// Kind of degraded-sync event behind a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncNoticeKind {
    OperationDiscarded,
    QueueEntryCorrupted,
    StorageDegraded,
}

/// One-time report surfaced to the UI after a degraded sync event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncNotice {
    pub id: String,
    pub kind: SyncNoticeKind,
    pub entry_id: Option<i64>,
    pub operation: Option<OperationKind>,
    pub detail: String,
    pub occurred_at: String,
}

impl SyncNotice {
    fn new(kind: SyncNoticeKind, detail: String) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            entry_id: None,
            operation: None,
            detail,
            occurred_at: Utc::now().to_rfc3339(),
        }
    }

    /// A queued operation was rejected by the backend and dropped.
    pub fn discarded(entry: &SyncQueueEntry, reason: impl Into<String>) -> Self {
        let mut notice = Self::new(SyncNoticeKind::OperationDiscarded, reason.into());
        notice.entry_id = Some(entry.id);
        notice.operation = Some(entry.operation);
        notice
    }

    /// A persisted queue element could not be decoded and was pruned.
    pub fn corrupted(detail: impl Into<String>) -> Self {
        Self::new(SyncNoticeKind::QueueEntryCorrupted, detail.into())
    }

    /// A drain attempt failed on local storage.
    pub fn degraded(detail: impl Into<String>) -> Self {
        Self::new(SyncNoticeKind::StorageDegraded, detail.into())
    }
}

/// Bounded buffer of notices awaiting pickup by the UI.
#[derive(Default)]
pub struct NoticeBuffer {
    notices: Mutex<VecDeque<SyncNotice>>,
}

impl NoticeBuffer {
    pub fn push(&self, notice: SyncNotice) {
        if let Ok(mut notices) = self.notices.lock() {
            if notices.len() == NOTICE_BUFFER_CAP {
                notices.pop_front();
            }
            notices.push_back(notice);
        }
    }

    /// Hand every pending notice to the caller, clearing the buffer.
    pub fn drain(&self) -> Vec<SyncNotice> {
        self.notices
            .lock()
            .map(|mut notices| notices.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.notices.lock().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
