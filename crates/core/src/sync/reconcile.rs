//! Server-wins reconciliation after a fresh backend fetch.

use std::sync::Arc;

use log::warn;
use serde::de::DeserializeOwned;

use super::model::{
    CartItemPayload, FavoritePayload, OperationKind, ProductRefPayload, SyncQueueEntry,
};
use super::queue::MutationQueue;
use crate::commerce::{CartState, FavoritesState};
use crate::errors::StoreError;
use crate::store::{DocumentKey, LocalReplica};

/// Applies a freshly fetched server view over the local replica.
///
/// The server view replaces the local document wholesale; intents still in
/// the queue are then replayed on top in queue order, so optimistic state
/// the backend has not seen yet stays visible until its drain confirms it.
pub struct Reconciler {
    replica: Arc<LocalReplica>,
    queue: Arc<MutationQueue>,
}

impl Reconciler {
    pub fn new(replica: Arc<LocalReplica>, queue: Arc<MutationQueue>) -> Self {
        Self { replica, queue }
    }

    /// Replace the cart with the server view plus still-queued cart intents.
    pub fn apply_server_cart(&self, server: CartState) -> Result<CartState, StoreError> {
        let mut cart = server;
        for entry in self.queue.entries()? {
            apply_cart_entry(&mut cart, &entry);
        }
        self.replica.write_as(DocumentKey::Cart, &cart)?;
        Ok(cart)
    }

    /// Replace the favorites set with the server view plus queued intents.
    pub fn apply_server_favorites(
        &self,
        server: FavoritesState,
    ) -> Result<FavoritesState, StoreError> {
        let mut favorites = server;
        for entry in self.queue.entries()? {
            apply_favorites_entry(&mut favorites, &entry);
        }
        self.replica.write_as(DocumentKey::Favorites, &favorites)?;
        Ok(favorites)
    }
}

fn apply_cart_entry(cart: &mut CartState, entry: &SyncQueueEntry) {
    match entry.operation {
        OperationKind::CartAdd => {
            if let Some(item) = decode::<CartItemPayload>(entry) {
                cart.add_item(&item.product_id, item.quantity);
            }
        }
        OperationKind::CartRemove => {
            if let Some(product) = decode::<ProductRefPayload>(entry) {
                cart.remove_item(&product.product_id);
            }
        }
        OperationKind::CartSetQuantity => {
            if let Some(item) = decode::<CartItemPayload>(entry) {
                cart.set_quantity(&item.product_id, item.quantity);
            }
        }
        OperationKind::FavoriteAdd | OperationKind::FavoriteRemove => {}
    }
}

fn apply_favorites_entry(favorites: &mut FavoritesState, entry: &SyncQueueEntry) {
    match entry.operation {
        OperationKind::FavoriteAdd => {
            if let Some(favorite) = decode::<FavoritePayload>(entry) {
                favorites.add(&favorite.product_id, &favorite.added_at);
            }
        }
        OperationKind::FavoriteRemove => {
            if let Some(product) = decode::<ProductRefPayload>(entry) {
                favorites.remove(&product.product_id);
            }
        }
        OperationKind::CartAdd | OperationKind::CartRemove | OperationKind::CartSetQuantity => {}
    }
}

fn decode<T: DeserializeOwned>(entry: &SyncQueueEntry) -> Option<T> {
    match serde_json::from_value(entry.payload.clone()) {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!("skipping queued entry {} during replay: {err}", entry.id);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use crate::sync::model::NoticeBuffer;
    use serde_json::json;

    fn rig() -> (Arc<LocalReplica>, Arc<MutationQueue>, Reconciler) {
        let replica =
            Arc::new(LocalReplica::open(Arc::new(MemoryDocumentStore::new())).expect("replica"));
        let queue = Arc::new(
            MutationQueue::open(Arc::clone(&replica), Arc::new(NoticeBuffer::default()))
                .expect("queue"),
        );
        let reconciler = Reconciler::new(Arc::clone(&replica), Arc::clone(&queue));
        (replica, queue, reconciler)
    }

    fn server_cart() -> CartState {
        let mut cart = CartState::default();
        cart.add_item("p1", 2);
        cart.add_item("p9", 1);
        cart
    }

    #[test]
    fn server_view_replaces_local_state_verbatim_without_pending_intents() {
        let (replica, _queue, reconciler) = rig();
        replica
            .update(DocumentKey::Cart, |cart: &mut CartState| {
                cart.add_item("stale", 7)
            })
            .expect("seed");

        let merged = reconciler.apply_server_cart(server_cart()).expect("apply");

        assert_eq!(merged.quantity_of("stale"), 0);
        assert_eq!(merged.quantity_of("p1"), 2);
        let stored: CartState = replica.read_as(DocumentKey::Cart).expect("read");
        assert_eq!(stored, merged);
    }

    #[test]
    fn pending_cart_intents_replay_on_top_of_the_server_view() {
        let (_replica, queue, reconciler) = rig();
        queue
            .enqueue(
                OperationKind::CartSetQuantity,
                json!({"productId": "p1", "quantity": 5}),
                Some("p1".to_string()),
            )
            .expect("enqueue");
        queue
            .enqueue(
                OperationKind::CartAdd,
                json!({"productId": "p2", "quantity": 1}),
                None,
            )
            .expect("enqueue");

        let merged = reconciler.apply_server_cart(server_cart()).expect("apply");

        assert_eq!(merged.quantity_of("p1"), 5);
        assert_eq!(merged.quantity_of("p2"), 1);
        assert_eq!(merged.quantity_of("p9"), 1);
        // Replay reads the queue; it must not consume it.
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn favorites_replay_applies_adds_and_removes_in_queue_order() {
        let (_replica, queue, reconciler) = rig();
        queue
            .enqueue(
                OperationKind::FavoriteAdd,
                json!({"productId": "p1", "addedAtTimestamp": "2026-02-01T00:00:00Z"}),
                Some("p1".to_string()),
            )
            .expect("enqueue");
        queue
            .enqueue(
                OperationKind::FavoriteRemove,
                json!({"productId": "p3"}),
                Some("p3".to_string()),
            )
            .expect("enqueue");

        let mut server = FavoritesState::default();
        server.add("p3", "2026-01-01T00:00:00Z");
        let merged = reconciler.apply_server_favorites(server).expect("apply");

        assert!(merged.contains("p1"));
        assert!(!merged.contains("p3"));
    }

    #[test]
    fn cart_replay_ignores_favorite_intents_and_vice_versa() {
        let (_replica, queue, reconciler) = rig();
        queue
            .enqueue(
                OperationKind::FavoriteAdd,
                json!({"productId": "p7", "addedAtTimestamp": "2026-02-01T00:00:00Z"}),
                Some("p7".to_string()),
            )
            .expect("enqueue");

        let merged = reconciler.apply_server_cart(server_cart()).expect("apply");
        assert_eq!(merged.quantity_of("p7"), 0);

        let favorites = reconciler
            .apply_server_favorites(FavoritesState::default())
            .expect("apply");
        assert!(favorites.contains("p7"));
    }

    #[test]
    fn undecodable_pending_payload_is_skipped() {
        let (_replica, queue, reconciler) = rig();
        queue
            .enqueue(OperationKind::CartAdd, json!("garbage"), None)
            .expect("enqueue");

        let merged = reconciler.apply_server_cart(server_cart()).expect("apply");
        assert_eq!(merged.line_count(), 2);
    }
}
