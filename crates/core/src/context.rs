//! Facade wiring the replica, queue, executor, and scheduler behind one
//! handle. Hosts construct it once at startup from explicit parts; nothing
//! in the pipeline lives in a process-wide static.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::info;
use serde_json::Value;
use uuid::Uuid;

use crate::commerce::{
    BrowsingHistory, CartState, FavoritesState, ProductVisit, DEFAULT_HISTORY_CAP,
};
use crate::connectivity::ConnectivityMonitor;
use crate::errors::{Error, Result, StoreError};
use crate::store::{DocumentKey, DocumentStore, LocalReplica};
use crate::sync::{
    CartItemPayload, DrainCadence, FavoritePayload, MutationQueue, NoticeBuffer, OperationKind,
    ProductRefPayload, Reconciler, RemoteService, SyncExecutor, SyncNotice, SyncScheduler,
    SyncStatus, DEFAULT_SUBMIT_TIMEOUT_SECS, SYNC_INTERVAL_JITTER_SECS, SYNC_PENDING_POLL_SECS,
    SYNC_PERIODIC_INTERVAL_SECS,
};

/// Tunables for one context instance. `Default` suits production use; tests
/// shorten the timers.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Per-install identifier; prefixes every idempotency token.
    pub client_id: String,
    /// Baseline wake interval of the background drain loop.
    pub periodic_interval: Duration,
    /// Upper bound of random jitter added to scheduler sleeps.
    pub interval_jitter: Duration,
    /// Wake interval while intents are pending.
    pub pending_poll: Duration,
    /// Timeout for one remote submission.
    pub submit_timeout: Duration,
    /// Browsing-history entries retained before eviction.
    pub history_cap: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
            periodic_interval: Duration::from_secs(SYNC_PERIODIC_INTERVAL_SECS),
            interval_jitter: Duration::from_secs(SYNC_INTERVAL_JITTER_SECS),
            pending_poll: Duration::from_secs(SYNC_PENDING_POLL_SECS),
            submit_timeout: Duration::from_secs(DEFAULT_SUBMIT_TIMEOUT_SECS),
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }
}

impl SyncConfig {
    fn cadence(&self) -> DrainCadence {
        DrainCadence {
            interval: self.periodic_interval,
            interval_jitter: self.interval_jitter,
            pending_poll: self.pending_poll,
        }
    }
}

/// A staged mutation from [`CommerceContext::request_mutation`].
///
/// `apply_locally_now` runs the optimistic reducer, `enqueue` appends the
/// remote intent. Call them in that order so the queue never describes
/// state the replica has not committed.
pub struct MutationRequest<'a> {
    context: &'a CommerceContext,
    operation: OperationKind,
    payload: Value,
    collapse_key: Option<String>,
}

impl MutationRequest<'_> {
    /// Run the optimistic reducer against one replica document.
    pub fn apply_locally_now<T, F>(&self, key: DocumentKey, reduce: F) -> Result<T>
    where
        T: serde::de::DeserializeOwned + serde::Serialize + Default,
        F: FnOnce(&mut T),
    {
        Ok(self.context.replica.update(key, reduce)?)
    }

    /// Append the remote intent to the durable queue; returns the entry id.
    pub fn enqueue(self) -> Result<i64> {
        Ok(self
            .context
            .queue
            .enqueue(self.operation, self.payload, self.collapse_key)?)
    }
}

/// One handle over the whole offline-first pipeline.
pub struct CommerceContext {
    replica: Arc<LocalReplica>,
    queue: Arc<MutationQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    executor: Arc<SyncExecutor>,
    scheduler: SyncScheduler,
    notices: Arc<NoticeBuffer>,
    reconciler: Reconciler,
    history_cap: usize,
}

impl CommerceContext {
    /// Wire the pipeline over the given backend, remote, and monitor.
    ///
    /// Must be called from within a Tokio runtime; the scheduler spawns its
    /// background task immediately.
    pub fn open(
        backend: Arc<dyn DocumentStore>,
        remote: Arc<dyn RemoteService>,
        connectivity: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Result<Self> {
        let replica = Arc::new(LocalReplica::open(backend)?);
        let notices = Arc::new(NoticeBuffer::default());
        let queue = Arc::new(MutationQueue::open(
            Arc::clone(&replica),
            Arc::clone(&notices),
        )?);
        let executor = Arc::new(SyncExecutor::new(
            Arc::clone(&queue),
            remote,
            Arc::clone(&connectivity),
            Arc::clone(&notices),
            config.client_id.clone(),
            config.submit_timeout,
        ));
        let scheduler = SyncScheduler::start(
            Arc::clone(&executor),
            Arc::clone(&queue),
            Arc::clone(&connectivity),
            Arc::clone(&notices),
            config.cadence(),
        );
        let reconciler = Reconciler::new(Arc::clone(&replica), Arc::clone(&queue));
        info!(
            "commerce context ready: client {} with {} pending",
            config.client_id,
            queue.len()
        );

        Ok(Self {
            replica,
            queue,
            connectivity,
            executor,
            scheduler,
            notices,
            reconciler,
            history_cap: config.history_cap,
        })
    }

    /// Current cart as seen by the UI.
    pub fn cart(&self) -> Result<CartState> {
        Ok(self.replica.read_as(DocumentKey::Cart)?)
    }

    /// Current favorites as seen by the UI.
    pub fn favorites(&self) -> Result<FavoritesState> {
        Ok(self.replica.read_as(DocumentKey::Favorites)?)
    }

    /// Recently viewed products, most recent first.
    pub fn history(&self) -> Result<BrowsingHistory> {
        Ok(self.replica.read_as(DocumentKey::History)?)
    }

    /// Stage a mutation for the optimistic-write-then-enqueue sequence.
    ///
    /// The typed operations below cover the commerce surface; this is the
    /// escape hatch for callers with their own operation payloads.
    pub fn request_mutation(
        &self,
        operation: OperationKind,
        payload: Value,
        collapse_key: Option<String>,
    ) -> MutationRequest<'_> {
        MutationRequest {
            context: self,
            operation,
            payload,
            collapse_key,
        }
    }

    /// Add units of a product to the cart and queue the remote add.
    pub fn add_to_cart(&self, product_id: &str, quantity: u32) -> Result<i64> {
        if quantity == 0 {
            return Err(Error::validation("quantity must be at least 1"));
        }
        let payload = to_payload(&CartItemPayload {
            product_id: product_id.to_string(),
            quantity,
        })?;
        let request = self.request_mutation(OperationKind::CartAdd, payload, None);
        request.apply_locally_now(DocumentKey::Cart, |cart: &mut CartState| {
            cart.add_item(product_id, quantity)
        })?;
        request.enqueue()
    }

    /// Drop a cart line and queue the remote removal.
    ///
    /// Returns `None` when the product was not in the cart; nothing changes
    /// locally and nothing is queued.
    pub fn remove_from_cart(&self, product_id: &str) -> Result<Option<i64>> {
        let cart: CartState = self.replica.read_as(DocumentKey::Cart)?;
        if cart.quantity_of(product_id) == 0 {
            return Ok(None);
        }
        let payload = to_payload(&ProductRefPayload {
            product_id: product_id.to_string(),
        })?;
        let request = self.request_mutation(
            OperationKind::CartRemove,
            payload,
            Some(product_id.to_string()),
        );
        request.apply_locally_now(DocumentKey::Cart, |cart: &mut CartState| {
            cart.remove_item(product_id)
        })?;
        request.enqueue().map(Some)
    }

    /// Replace a line's quantity and queue the remote update.
    ///
    /// Repeated calls for the same product collapse to the latest value at
    /// the original queue position. Zero is rejected; removal is its own
    /// operation.
    pub fn set_cart_quantity(&self, product_id: &str, quantity: u32) -> Result<i64> {
        if quantity == 0 {
            return Err(Error::validation(
                "quantity must be at least 1; remove the line instead",
            ));
        }
        let payload = to_payload(&CartItemPayload {
            product_id: product_id.to_string(),
            quantity,
        })?;
        let request = self.request_mutation(
            OperationKind::CartSetQuantity,
            payload,
            Some(product_id.to_string()),
        );
        request.apply_locally_now(DocumentKey::Cart, |cart: &mut CartState| {
            cart.set_quantity(product_id, quantity)
        })?;
        request.enqueue()
    }

    /// Empty the cart locally without queuing anything.
    ///
    /// Used after order placement, where the backend already reflects the
    /// empty cart, or an explicit user reset.
    pub fn clear_cart_local(&self) -> Result<()> {
        self.replica
            .update(DocumentKey::Cart, |cart: &mut CartState| cart.clear())?;
        Ok(())
    }

    /// Favorite a product.
    ///
    /// Returns `None` when it already was one; membership is a set and the
    /// original timestamp stands, so nothing is queued.
    pub fn add_favorite(&self, product_id: &str) -> Result<Option<i64>> {
        let favorites: FavoritesState = self.replica.read_as(DocumentKey::Favorites)?;
        if favorites.contains(product_id) {
            return Ok(None);
        }
        let added_at = Utc::now().to_rfc3339();
        let payload = to_payload(&FavoritePayload {
            product_id: product_id.to_string(),
            added_at: added_at.clone(),
        })?;
        let request = self.request_mutation(
            OperationKind::FavoriteAdd,
            payload,
            Some(product_id.to_string()),
        );
        request.apply_locally_now(DocumentKey::Favorites, |favorites: &mut FavoritesState| {
            favorites.add(product_id, &added_at);
        })?;
        request.enqueue().map(Some)
    }

    /// Unfavorite a product. Returns `None` when it was not a favorite.
    pub fn remove_favorite(&self, product_id: &str) -> Result<Option<i64>> {
        let favorites: FavoritesState = self.replica.read_as(DocumentKey::Favorites)?;
        if !favorites.contains(product_id) {
            return Ok(None);
        }
        let payload = to_payload(&ProductRefPayload {
            product_id: product_id.to_string(),
        })?;
        let request = self.request_mutation(
            OperationKind::FavoriteRemove,
            payload,
            Some(product_id.to_string()),
        );
        request.apply_locally_now(DocumentKey::Favorites, |favorites: &mut FavoritesState| {
            favorites.remove(product_id);
        })?;
        request.enqueue().map(Some)
    }

    /// Record a product page visit. Local only; never queued.
    pub fn record_visit(&self, visit: ProductVisit) -> Result<()> {
        let cap = self.history_cap;
        self.replica
            .update(DocumentKey::History, |history: &mut BrowsingHistory| {
                history.record(visit, cap)
            })?;
        Ok(())
    }

    /// Entries awaiting remote confirmation; backs the pending badge.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Snapshot for the sync indicator.
    pub fn sync_state(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.connectivity.is_online(),
            is_syncing: self.executor.is_draining(),
            pending_count: self.queue.len(),
            consecutive_failures: self.executor.consecutive_failures(),
            next_retry_at: self.executor.next_retry_at().map(|at| at.to_rfc3339()),
        }
    }

    /// Run a drain attempt now and wait for it to finish.
    pub async fn force_sync(&self) {
        self.scheduler.force_sync().await;
    }

    /// Discard every queued intent. Destructive; reserved for an explicit
    /// user-initiated "discard offline changes".
    pub fn clear_queue(&self) -> Result<()> {
        Ok(self.queue.clear()?)
    }

    /// One-time reports accumulated since the last call.
    pub fn drain_notices(&self) -> Vec<SyncNotice> {
        self.notices.drain()
    }

    /// Server-wins reconciliation for the cart after a fresh fetch.
    pub fn apply_server_cart(&self, server: CartState) -> Result<CartState> {
        Ok(self.reconciler.apply_server_cart(server)?)
    }

    /// Server-wins reconciliation for favorites after a fresh fetch.
    pub fn apply_server_favorites(&self, server: FavoritesState) -> Result<FavoritesState> {
        Ok(self.reconciler.apply_server_favorites(server)?)
    }

    /// The connectivity monitor, for host reachability glue.
    pub fn connectivity(&self) -> Arc<ConnectivityMonitor> {
        Arc::clone(&self.connectivity)
    }

    /// Stop the background scheduler task. The queue and replica stay
    /// usable; only automatic draining ends.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

fn to_payload<T: serde::Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value).map_err(StoreError::Json)?)
}
