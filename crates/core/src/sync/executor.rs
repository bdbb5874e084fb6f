//! Queue drain state machine: walk, halt, back off, resume.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::Mutex;

use super::model::{NoticeBuffer, SubmitAck, SyncNotice, SyncQueueEntry};
use super::queue::MutationQueue;
use super::remote::RemoteService;
use crate::connectivity::ConnectivityMonitor;
use crate::errors::{RemoteError, RetryClass, StoreError};

/// Default timeout for one remote submission.
pub const DEFAULT_SUBMIT_TIMEOUT_SECS: u64 = 30;

/// Exponential backoff in seconds with cap.
pub fn backoff_seconds(consecutive_failures: i32) -> i64 {
    const MAX_EXPONENT: i32 = 8;
    const BASE_DELAY_SECONDS: i64 = 5;

    let capped = i64::from(consecutive_failures.clamp(0, MAX_EXPONENT));
    2_i64.pow(capped as u32) * BASE_DELAY_SECONDS
}

/// Where the executor currently is in its drain lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorPhase {
    Idle,
    Draining,
    Backoff { until: DateTime<Utc> },
}

/// Result of one drain attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue was walked to empty. `discarded` counts permanent rejects.
    Drained { applied: usize, discarded: usize },
    /// A retryable failure stopped the walk; the front entry stays put.
    HaltedRetryable { entry_id: i64, retry_in_seconds: i64 },
    /// Connectivity was missing or dropped; the walk stops where it is.
    Offline,
    /// Another drain holds the gate; this call did nothing.
    AlreadyRunning,
}

/// Drains the mutation queue against the remote service.
///
/// One attempt at a time: concurrent calls short-circuit to
/// [`DrainOutcome::AlreadyRunning`]. Entries leave the queue only on a
/// confirmed acknowledgment or a permanent rejection; everything else leaves
/// the queue untouched for the next attempt.
pub struct SyncExecutor {
    queue: Arc<MutationQueue>,
    remote: Arc<dyn RemoteService>,
    connectivity: Arc<ConnectivityMonitor>,
    notices: Arc<NoticeBuffer>,
    client_id: String,
    submit_timeout: Duration,
    attempt_gate: Mutex<()>,
    phase: std::sync::Mutex<ExecutorPhase>,
    consecutive_failures: AtomicI32,
}

impl SyncExecutor {
    pub fn new(
        queue: Arc<MutationQueue>,
        remote: Arc<dyn RemoteService>,
        connectivity: Arc<ConnectivityMonitor>,
        notices: Arc<NoticeBuffer>,
        client_id: String,
        submit_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            remote,
            connectivity,
            notices,
            client_id,
            submit_timeout,
            attempt_gate: Mutex::new(()),
            phase: std::sync::Mutex::new(ExecutorPhase::Idle),
            consecutive_failures: AtomicI32::new(0),
        }
    }

    /// One drain attempt over the whole queue.
    pub async fn drain(&self) -> Result<DrainOutcome, StoreError> {
        let Ok(_gate) = self.attempt_gate.try_lock() else {
            return Ok(DrainOutcome::AlreadyRunning);
        };

        let outcome = self.walk_queue().await;
        if outcome.is_err() {
            self.set_phase(ExecutorPhase::Idle);
        }
        outcome
    }

    async fn walk_queue(&self) -> Result<DrainOutcome, StoreError> {
        if !self.connectivity.is_online() {
            self.set_phase(ExecutorPhase::Idle);
            return Ok(DrainOutcome::Offline);
        }

        self.set_phase(ExecutorPhase::Draining);
        let mut applied = 0usize;
        let mut discarded = 0usize;

        loop {
            // Re-check connectivity per entry; a drop aborts in place and the
            // next attempt resumes at the same front entry.
            if !self.connectivity.is_online() {
                debug!("connectivity lost mid-drain; aborting walk");
                self.set_phase(ExecutorPhase::Idle);
                return Ok(DrainOutcome::Offline);
            }

            let entry = match self.queue.peek_front()? {
                Some(entry) => entry,
                None => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    self.set_phase(ExecutorPhase::Idle);
                    if applied > 0 || discarded > 0 {
                        debug!("drain complete: applied={applied} discarded={discarded}");
                    }
                    return Ok(DrainOutcome::Drained { applied, discarded });
                }
            };

            match self.submit_entry(&entry).await {
                Ok(ack) => {
                    if ack == SubmitAck::AlreadyApplied {
                        debug!("entry {} was already applied remotely", entry.id);
                    }
                    self.queue.remove_by_id(entry.id)?;
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    applied += 1;
                }
                Err(err) => match err.retry_class() {
                    RetryClass::Permanent => {
                        warn!(
                            "dropping rejected entry {} ({}): {}",
                            entry.id,
                            entry.operation.as_str(),
                            err
                        );
                        self.queue.remove_by_id(entry.id)?;
                        self.notices.push(SyncNotice::discarded(&entry, err.to_string()));
                        discarded += 1;
                    }
                    RetryClass::Retryable => {
                        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                        let delay = backoff_seconds(failures);
                        let until = Utc::now() + chrono::Duration::seconds(delay);
                        warn!(
                            "drain halted at entry {}: {} (retry in {delay}s)",
                            entry.id, err
                        );
                        self.set_phase(ExecutorPhase::Backoff { until });
                        return Ok(DrainOutcome::HaltedRetryable {
                            entry_id: entry.id,
                            retry_in_seconds: delay,
                        });
                    }
                },
            }
        }
    }

    async fn submit_entry(&self, entry: &SyncQueueEntry) -> Result<SubmitAck, RemoteError> {
        let token = self.idempotency_token(entry.id);
        let payload: &Value = &entry.payload;
        match tokio::time::timeout(
            self.submit_timeout,
            self.remote.submit(entry.operation, payload, &token),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(RemoteError::Timeout(self.submit_timeout.as_secs())),
        }
    }

    /// Stable token for one queue entry; the backend dedupes on it.
    fn idempotency_token(&self, entry_id: i64) -> String {
        format!("{}-{}", self.client_id, entry_id)
    }

    pub fn phase(&self) -> ExecutorPhase {
        self.phase
            .lock()
            .map(|phase| *phase)
            .unwrap_or(ExecutorPhase::Idle)
    }

    pub fn is_draining(&self) -> bool {
        self.phase() == ExecutorPhase::Draining
    }

    pub fn consecutive_failures(&self) -> i32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Backoff deadline, when the executor is backing off.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        match self.phase() {
            ExecutorPhase::Backoff { until } => Some(until),
            _ => None,
        }
    }

    fn set_phase(&self, phase: ExecutorPhase) {
        if let Ok(mut current) = self.phase.lock() {
            *current = phase;
        }
    }
}
