//! Favorites document: a set of products keyed by id.

use serde::{Deserialize, Serialize};

/// One favorited product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteEntry {
    pub product_id: String,
    #[serde(rename = "addedAtTimestamp")]
    pub added_at: String,
}

/// The favorites document. Membership is a set; entry order is insertion
/// order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoritesState {
    pub entries: Vec<FavoriteEntry>,
}

impl FavoritesState {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, product_id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.product_id == product_id)
    }

    /// Insert if absent. Returns false when the product was already a
    /// favorite; the original timestamp is kept in that case.
    pub fn add(&mut self, product_id: &str, added_at: &str) -> bool {
        if self.contains(product_id) {
            return false;
        }
        self.entries.push(FavoriteEntry {
            product_id: product_id.to_string(),
            added_at: added_at.to_string(),
        });
        true
    }

    /// Remove a favorite. Returns false when the product was not present.
    pub fn remove(&mut self, product_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.product_id != product_id);
        self.entries.len() != before
    }
}
