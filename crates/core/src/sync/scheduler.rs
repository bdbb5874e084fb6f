//! Background drain loop: trigger coalescing, cadence, single-flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::executor::{DrainOutcome, ExecutorPhase, SyncExecutor};
use super::model::{NoticeBuffer, SyncNotice};
use super::queue::MutationQueue;
use crate::connectivity::{ConnectivityMonitor, SubscriptionHandle};

/// Baseline drain cadence in seconds while idle.
pub const SYNC_PERIODIC_INTERVAL_SECS: u64 = 45;

/// Maximum jitter (seconds) added to periodic drain intervals.
pub const SYNC_INTERVAL_JITTER_SECS: u64 = 5;

/// Tightened wake cadence in seconds while intents are pending.
pub const SYNC_PENDING_POLL_SECS: u64 = 2;

/// Cadence settings for the scheduler's background loop.
#[derive(Debug, Clone)]
pub struct DrainCadence {
    /// Baseline wake interval while the queue is empty.
    pub interval: Duration,
    /// Upper bound of random jitter added to every sleep.
    pub interval_jitter: Duration,
    /// Wake interval while entries are pending and the executor is not
    /// backing off.
    pub pending_poll: Duration,
}

impl Default for DrainCadence {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(SYNC_PERIODIC_INTERVAL_SECS),
            interval_jitter: Duration::from_secs(SYNC_INTERVAL_JITTER_SECS),
            pending_poll: Duration::from_secs(SYNC_PENDING_POLL_SECS),
        }
    }
}

/// Decides when the executor runs, and owns the only task that runs it.
///
/// Three triggers exist: an offline→online edge, the periodic timer (while
/// online with pending entries), and explicit user requests. Every trigger
/// lands on one background task, so a trigger arriving mid-drain coalesces
/// into the running attempt instead of starting a second one. While the
/// executor is backing off, the timer waits out the backoff deadline; an
/// online edge or an explicit request overrides the wait.
pub struct SyncScheduler {
    shared: Arc<SchedulerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
    _edge_subscription: SubscriptionHandle,
}

struct SchedulerShared {
    executor: Arc<SyncExecutor>,
    queue: Arc<MutationQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    notices: Arc<NoticeBuffer>,
    cadence: DrainCadence,
    wake: Notify,
    explicit_requested: AtomicBool,
    online_edge: AtomicBool,
    shut_down: AtomicBool,
    /// Completed drain attempts; `force_sync` waits on the next bump.
    attempts: watch::Sender<u64>,
}

impl SyncScheduler {
    /// Spawn the background loop and subscribe to connectivity edges.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        executor: Arc<SyncExecutor>,
        queue: Arc<MutationQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        notices: Arc<NoticeBuffer>,
        cadence: DrainCadence,
    ) -> Self {
        let (attempts, _) = watch::channel(0u64);
        let shared = Arc::new(SchedulerShared {
            executor,
            queue,
            connectivity: Arc::clone(&connectivity),
            notices,
            cadence,
            wake: Notify::new(),
            explicit_requested: AtomicBool::new(false),
            online_edge: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            attempts,
        });

        let edges = Arc::clone(&shared);
        let subscription = connectivity.subscribe(move |state| {
            if state.is_online {
                edges.online_edge.store(true, Ordering::SeqCst);
                edges.wake.notify_one();
            }
        });

        let looper = Arc::clone(&shared);
        let task = tokio::spawn(run_loop(looper));
        debug!("sync scheduler started");

        Self {
            shared,
            task: Mutex::new(Some(task)),
            _edge_subscription: subscription,
        }
    }

    /// Ask for a drain now and wait for the attempt to finish.
    ///
    /// If an attempt is already in flight this waits for that one instead of
    /// starting another. The wait ends when the attempt completes for any
    /// reason: the queue drained, the walk halted into backoff, connectivity
    /// was missing, or the scheduler shut down.
    pub async fn force_sync(&self) {
        // Subscribe before the shut-down check: a shutdown observed here as
        // not-yet-started bumps the counter after this subscription exists.
        let mut attempts = self.shared.attempts.subscribe();
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return;
        }
        self.shared.explicit_requested.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        let _ = attempts.changed().await;
    }

    /// Stop the background loop.
    ///
    /// An in-flight drain is dropped at its next await point; the queue keeps
    /// whatever was not confirmed, so the next scheduler resumes at the same
    /// front entry.
    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
                debug!("sync scheduler stopped");
            }
        }
        // Release force_sync callers still waiting on an attempt.
        self.shared.attempts.send_modify(|n| *n = n.wrapping_add(1));
    }
}

async fn run_loop(shared: Arc<SchedulerShared>) {
    loop {
        let woke_by_timer = tokio::select! {
            _ = shared.wake.notified() => false,
            _ = tokio::time::sleep(shared.next_delay()) => true,
        };

        let explicit = shared.explicit_requested.swap(false, Ordering::SeqCst);
        let edge = shared.online_edge.swap(false, Ordering::SeqCst);
        let periodic_due =
            woke_by_timer && shared.connectivity.is_online() && !shared.queue.is_empty();

        if !(explicit || edge || periodic_due) {
            continue;
        }

        match shared.executor.drain().await {
            Ok(DrainOutcome::Drained { applied, discarded }) => {
                if applied > 0 || discarded > 0 {
                    debug!("drain attempt finished: applied={applied} discarded={discarded}");
                }
            }
            Ok(DrainOutcome::HaltedRetryable {
                retry_in_seconds, ..
            }) => {
                debug!("drain attempt backing off for {retry_in_seconds}s");
            }
            Ok(DrainOutcome::Offline) => debug!("drain attempt skipped: offline"),
            Ok(DrainOutcome::AlreadyRunning) => {
                debug!("drain attempt overlapped a direct executor call")
            }
            Err(err) => {
                warn!("drain attempt failed on local storage: {err}");
                shared.notices.push(SyncNotice::degraded(err.to_string()));
            }
        }

        // The finished attempt satisfies any explicit request that arrived
        // while it ran; an online edge keeps its wake so an aborted walk
        // resumes promptly.
        shared.explicit_requested.store(false, Ordering::SeqCst);
        shared.attempts.send_modify(|n| *n = n.wrapping_add(1));
    }
}

impl SchedulerShared {
    /// How long to sleep before the next timer wake.
    fn next_delay(&self) -> Duration {
        let jitter = self.jitter_ms();
        let millis = match self.executor.phase() {
            ExecutorPhase::Backoff { until } => {
                (until - Utc::now()).num_milliseconds().max(1_000) as u64 + jitter
            }
            _ if self.connectivity.is_online() && !self.queue.is_empty() => {
                self.cadence.pending_poll.as_millis() as u64 + jitter % 500
            }
            _ => self.cadence.interval.as_millis() as u64 + jitter,
        };
        Duration::from_millis(millis)
    }

    fn jitter_ms(&self) -> u64 {
        let bound = self.cadence.interval_jitter.as_millis() as u64;
        if bound == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..=bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::NetworkState;
    use crate::errors::{RemoteError, StoreError};
    use crate::store::{DocumentKey, DocumentStore, LocalReplica, MemoryDocumentStore};
    use crate::sync::model::{OperationKind, SubmitAck, SyncNoticeKind};
    use crate::sync::remote::RemoteService;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// Remote double replaying scripted outcomes; unscripted calls succeed.
    struct ScriptedRemote {
        outcomes: std::sync::Mutex<VecDeque<Result<SubmitAck, RemoteError>>>,
        calls: AtomicUsize,
        /// While set, submissions block until the task is dropped.
        hold: AtomicBool,
    }

    impl ScriptedRemote {
        fn new() -> Self {
            Self {
                outcomes: std::sync::Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
                hold: AtomicBool::new(false),
            }
        }

        fn script(&self, outcome: Result<SubmitAck, RemoteError>) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RemoteService for ScriptedRemote {
        async fn submit(
            &self,
            _operation: OperationKind,
            _payload: &Value,
            _idempotency_token: &str,
        ) -> Result<SubmitAck, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hold.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(SubmitAck::Applied))
        }
    }

    struct Rig {
        replica: Arc<LocalReplica>,
        queue: Arc<MutationQueue>,
        remote: Arc<ScriptedRemote>,
        connectivity: Arc<ConnectivityMonitor>,
        notices: Arc<NoticeBuffer>,
        executor: Arc<SyncExecutor>,
    }

    fn rig_over(backend: Arc<dyn DocumentStore>) -> Rig {
        let replica = Arc::new(LocalReplica::open(backend).expect("replica"));
        let notices = Arc::new(NoticeBuffer::default());
        let queue = Arc::new(
            MutationQueue::open(Arc::clone(&replica), Arc::clone(&notices)).expect("queue"),
        );
        let remote = Arc::new(ScriptedRemote::new());
        let connectivity = Arc::new(ConnectivityMonitor::new());
        let executor = Arc::new(SyncExecutor::new(
            Arc::clone(&queue),
            Arc::clone(&remote) as Arc<dyn RemoteService>,
            Arc::clone(&connectivity),
            Arc::clone(&notices),
            "client-1".to_string(),
            Duration::from_secs(5),
        ));
        Rig {
            replica,
            queue,
            remote,
            connectivity,
            notices,
            executor,
        }
    }

    fn rig() -> Rig {
        rig_over(Arc::new(MemoryDocumentStore::new()))
    }

    fn start_scheduler(rig: &Rig) -> SyncScheduler {
        SyncScheduler::start(
            Arc::clone(&rig.executor),
            Arc::clone(&rig.queue),
            Arc::clone(&rig.connectivity),
            Arc::clone(&rig.notices),
            DrainCadence::default(),
        )
    }

    fn enqueue_add(rig: &Rig, product_id: &str) -> i64 {
        rig.queue
            .enqueue(
                OperationKind::CartAdd,
                json!({"productId": product_id, "quantity": 1}),
                None,
            )
            .expect("enqueue")
    }

    fn attempt_count(scheduler: &SyncScheduler) -> u64 {
        *scheduler.shared.attempts.borrow()
    }

    async fn wait_until(label: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..600 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("timed out waiting for {label}");
    }

    #[tokio::test(start_paused = true)]
    async fn force_sync_runs_one_attempt_and_waits_for_it() {
        let rig = rig();
        enqueue_add(&rig, "p1");
        enqueue_add(&rig, "p2");
        let scheduler = start_scheduler(&rig);

        scheduler.force_sync().await;

        assert!(rig.queue.is_empty());
        assert_eq!(rig.remote.calls(), 2);
        assert_eq!(attempt_count(&scheduler), 1);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn simultaneous_requests_share_one_attempt() {
        let rig = rig();
        enqueue_add(&rig, "p1");
        let scheduler = start_scheduler(&rig);

        futures::future::join_all([scheduler.force_sync(), scheduler.force_sync()]).await;

        assert_eq!(attempt_count(&scheduler), 1);
        assert_eq!(rig.remote.calls(), 1);
        assert!(rig.queue.is_empty());
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn online_edge_triggers_a_drain() {
        let rig = rig();
        rig.connectivity.set_reachability(NetworkState::offline());
        let scheduler = start_scheduler(&rig);
        enqueue_add(&rig, "p1");

        rig.connectivity
            .set_reachability(NetworkState::default());
        wait_until("edge-triggered drain", || rig.queue.is_empty()).await;

        assert_eq!(rig.remote.calls(), 1);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_wake_drains_pending_entries() {
        let rig = rig();
        let scheduler = start_scheduler(&rig);

        // No trigger fires here; only the timer can pick this entry up.
        enqueue_add(&rig, "p1");
        wait_until("periodic drain", || rig.queue.is_empty()).await;

        assert_eq!(rig.remote.calls(), 1);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_deadline_is_waited_out_before_the_retry() {
        let rig = rig();
        enqueue_add(&rig, "p1");
        rig.remote.script(Err(RemoteError::network("reset")));
        let scheduler = start_scheduler(&rig);

        let started = tokio::time::Instant::now();
        scheduler.force_sync().await;
        assert_eq!(rig.queue.len(), 1);
        assert_eq!(rig.remote.calls(), 1);

        wait_until("retry after backoff", || rig.queue.is_empty()).await;
        assert_eq!(rig.remote.calls(), 2);
        // First failure backs off five seconds; the timer must not retry
        // before that deadline.
        assert!(started.elapsed() >= Duration::from_secs(5));
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn online_edge_overrides_the_backoff_wait() {
        let rig = rig();
        enqueue_add(&rig, "p1");
        rig.remote.script(Err(RemoteError::network("reset")));
        let scheduler = start_scheduler(&rig);
        scheduler.force_sync().await;
        assert_eq!(rig.queue.len(), 1);

        let regained = tokio::time::Instant::now();
        rig.connectivity.set_reachability(NetworkState::offline());
        rig.connectivity.set_reachability(NetworkState::default());
        wait_until("drain on reconnect", || rig.queue.is_empty()).await;

        assert!(regained.elapsed() < Duration::from_secs(5));
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failure_surfaces_a_degraded_notice() {
        /// Backend whose writes can be switched to fail.
        struct FlakyBackend {
            inner: MemoryDocumentStore,
            fail_writes: AtomicBool,
        }

        impl DocumentStore for FlakyBackend {
            fn read(&self, key: DocumentKey) -> Result<Option<Value>, StoreError> {
                self.inner.read(key)
            }

            fn write(&self, key: DocumentKey, document: &Value) -> Result<(), StoreError> {
                if self.fail_writes.load(Ordering::SeqCst) {
                    return Err(StoreError::backend("disk full"));
                }
                self.inner.write(key, document)
            }

            fn delete(&self, key: DocumentKey) -> Result<(), StoreError> {
                self.inner.delete(key)
            }
        }

        let backend = Arc::new(FlakyBackend {
            inner: MemoryDocumentStore::new(),
            fail_writes: AtomicBool::new(false),
        });
        let rig = rig_over(Arc::clone(&backend) as Arc<dyn DocumentStore>);
        enqueue_add(&rig, "p1");
        let scheduler = start_scheduler(&rig);

        // The submission succeeds but removing the confirmed entry fails.
        backend.fail_writes.store(true, Ordering::SeqCst);
        scheduler.force_sync().await;

        let notices = rig.notices.drain();
        assert!(notices
            .iter()
            .any(|notice| notice.kind == SyncNoticeKind::StorageDegraded));
        assert_eq!(rig.queue.len(), 1);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_in_flight_work_and_releases_waiters() {
        let rig = rig();
        rig.remote.hold.store(true, Ordering::SeqCst);
        enqueue_add(&rig, "p1");
        let scheduler = Arc::new(start_scheduler(&rig));

        let waiter = Arc::clone(&scheduler);
        let pending = tokio::spawn(async move { waiter.force_sync().await });
        wait_until("submission in flight", || rig.remote.calls() == 1).await;

        scheduler.shutdown();
        pending.await.expect("force_sync released");

        // The aborted walk removed nothing; a fresh scheduler resumes at the
        // same front entry.
        assert_eq!(rig.queue.len(), 1);
        rig.remote.hold.store(false, Ordering::SeqCst);
        let resumed = start_scheduler(&rig);
        resumed.force_sync().await;
        assert!(rig.queue.is_empty());
        resumed.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn force_sync_after_shutdown_returns_immediately() {
        let rig = rig();
        let scheduler = start_scheduler(&rig);
        scheduler.shutdown();

        tokio::time::timeout(Duration::from_secs(1), scheduler.force_sync())
            .await
            .expect("force_sync returned");
    }

    #[test]
    fn default_cadence_matches_the_published_constants() {
        let cadence = DrainCadence::default();
        assert_eq!(cadence.interval.as_secs(), SYNC_PERIODIC_INTERVAL_SECS);
        assert_eq!(cadence.interval_jitter.as_secs(), SYNC_INTERVAL_JITTER_SECS);
        assert_eq!(cadence.pending_poll.as_secs(), SYNC_PENDING_POLL_SECS);
    }
}
