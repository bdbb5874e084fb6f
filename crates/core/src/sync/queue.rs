//! Durable FIFO queue of mutation intents, stored as the `syncQueue` document.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;

use super::model::{NoticeBuffer, OperationKind, SyncNotice, SyncQueueEntry};
use crate::errors::StoreError;
use crate::store::{DocumentKey, LocalReplica};

/// FIFO queue of not-yet-synced intents.
///
/// Entries are raw JSON elements so one undecodable element never poisons the
/// rest of the queue; decoding happens per element and failures are pruned
/// and reported instead of halting the drain.
pub struct MutationQueue {
    replica: Arc<LocalReplica>,
    notices: Arc<NoticeBuffer>,
    last_id: AtomicI64,
}

impl MutationQueue {
    /// Open the queue over its persisted document. Undecodable elements are
    /// pruned and reported; the id counter resumes above every id ever seen.
    pub fn open(
        replica: Arc<LocalReplica>,
        notices: Arc<NoticeBuffer>,
    ) -> Result<Self, StoreError> {
        let raw: Vec<Value> = replica.read_as(DocumentKey::SyncQueue)?;
        let mut max_id = 0i64;
        let mut valid = Vec::with_capacity(raw.len());
        let mut dropped = 0usize;

        for element in raw {
            // Track ids even on undecodable elements; their tokens may have
            // reached the backend before the corruption happened.
            if let Some(id) = element.get("id").and_then(Value::as_i64) {
                max_id = max_id.max(id);
            }
            match serde_json::from_value::<SyncQueueEntry>(element.clone()) {
                Ok(_) => valid.push(element),
                Err(err) => {
                    dropped += 1;
                    warn!("pruning undecodable queue element: {err}");
                    notices.push(SyncNotice::corrupted(err.to_string()));
                }
            }
        }

        if dropped > 0 {
            replica.write(DocumentKey::SyncQueue, Value::Array(valid))?;
        }

        Ok(Self {
            replica,
            notices,
            last_id: AtomicI64::new(max_id),
        })
    }

    /// Append an intent, or collapse it into a matching queued one.
    ///
    /// A not-yet-drained entry with the same operation and collapse key is
    /// superseded in place: same queue position, fresh id and payload. The
    /// fresh id keeps a late acknowledgment of the superseded send from
    /// counting as success for the new payload.
    pub fn enqueue(
        &self,
        operation: OperationKind,
        payload: Value,
        collapse_key: Option<String>,
    ) -> Result<i64, StoreError> {
        let id = self.allocate_id();
        let entry = SyncQueueEntry {
            id,
            operation,
            payload,
            collapse_key,
            enqueued_at: Utc::now().to_rfc3339(),
        };
        let raw = serde_json::to_value(&entry)?;
        let op_value = serde_json::to_value(operation)?;
        let collapse = entry.collapse_key.clone();

        self.replica
            .update(DocumentKey::SyncQueue, move |elements: &mut Vec<Value>| {
                if let Some(key) = collapse.as_deref() {
                    let slot = elements.iter().position(|element| {
                        element.get("operationType") == Some(&op_value)
                            && element.get("collapseKey").and_then(Value::as_str) == Some(key)
                    });
                    if let Some(index) = slot {
                        debug!(
                            "collapsing queued {} intent for '{}'",
                            operation.as_str(),
                            key
                        );
                        elements[index] = raw;
                        return;
                    }
                }
                elements.push(raw);
            })?;

        Ok(id)
    }

    /// First decodable entry, pruning and reporting any garbage ahead of it.
    pub fn peek_front(&self) -> Result<Option<SyncQueueEntry>, StoreError> {
        let raw: Vec<Value> = self.replica.read_as(DocumentKey::SyncQueue)?;
        match raw.first() {
            None => return Ok(None),
            Some(first) => {
                if let Ok(entry) = serde_json::from_value::<SyncQueueEntry>(first.clone()) {
                    return Ok(Some(entry));
                }
            }
        }

        // The front element failed to decode. Prune leading garbage under the
        // write lock and surface the first entry that parses.
        let mut front = None;
        self.replica
            .update(DocumentKey::SyncQueue, |elements: &mut Vec<Value>| {
                while let Some(first) = elements.first() {
                    match serde_json::from_value::<SyncQueueEntry>(first.clone()) {
                        Ok(entry) => {
                            front = Some(entry);
                            break;
                        }
                        Err(err) => {
                            warn!("pruning undecodable queue element: {err}");
                            self.notices.push(SyncNotice::corrupted(err.to_string()));
                            elements.remove(0);
                        }
                    }
                }
            })?;
        Ok(front)
    }

    /// Remove one entry after the backend confirmed it.
    pub fn remove_by_id(&self, id: i64) -> Result<(), StoreError> {
        self.replica
            .update(DocumentKey::SyncQueue, |elements: &mut Vec<Value>| {
                elements.retain(|element| {
                    element.get("id").and_then(Value::as_i64) != Some(id)
                });
            })?;
        Ok(())
    }

    /// Every decodable entry, front first.
    pub fn entries(&self) -> Result<Vec<SyncQueueEntry>, StoreError> {
        let raw: Vec<Value> = self.replica.read_as(DocumentKey::SyncQueue)?;
        Ok(raw
            .into_iter()
            .filter_map(|element| serde_json::from_value(element).ok())
            .collect())
    }

    /// Pending element count, shown to the user as the pending-actions badge.
    pub fn len(&self) -> usize {
        self.replica
            .read(DocumentKey::SyncQueue)
            .and_then(|document| document.as_array().map(|elements| elements.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued intent. Destructive; only for an explicit user reset.
    pub fn clear(&self) -> Result<(), StoreError> {
        let pending = self.len();
        self.replica.write(DocumentKey::SyncQueue, Value::Array(Vec::new()))?;
        if pending > 0 {
            info!("cleared {pending} queued intents");
        }
        Ok(())
    }

    /// Strictly increasing, wall-clock-seeded id.
    fn allocate_id(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        // Jump to the wall clock when it is ahead, then claim the next slot.
        self.last_id.fetch_max(now - 1, Ordering::SeqCst);
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}
