//! Browsing history document. Local-only; never queued for remote sync.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Default cap on retained history entries.
pub const DEFAULT_HISTORY_CAP: usize = 100;

/// One product page visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductVisit {
    pub product_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(rename = "visitedAtTimestamp")]
    pub visited_at: String,
}

/// Recently viewed products, newest first, bounded by a caller-supplied cap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowsingHistory {
    pub entries: Vec<ProductVisit>,
}

impl BrowsingHistory {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a visit. A repeat visit moves the product to the front instead
    /// of duplicating it; entries beyond `cap` fall off the old end.
    pub fn record(&mut self, visit: ProductVisit, cap: usize) {
        self.entries
            .retain(|entry| entry.product_id != visit.product_id);
        self.entries.insert(0, visit);
        self.entries.truncate(cap);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn visit(product_id: &str) -> ProductVisit {
        ProductVisit {
            product_id: product_id.to_string(),
            name: format!("Product {product_id}"),
            image_ref: None,
            price: None,
            category: None,
            visited_at: "2026-08-01T10:00:00Z".to_string(),
        }
    }

    #[test]
    fn revisit_moves_entry_to_front_without_duplicating() {
        let mut history = BrowsingHistory::default();
        history.record(visit("p1"), 10);
        history.record(visit("p2"), 10);
        history.record(visit("p1"), 10);

        assert_eq!(history.len(), 2);
        assert_eq!(history.entries[0].product_id, "p1");
        assert_eq!(history.entries[1].product_id, "p2");
    }

    #[test]
    fn cap_evicts_the_oldest_entries() {
        let mut history = BrowsingHistory::default();
        for n in 0..5 {
            history.record(visit(&format!("p{n}")), 3);
        }

        assert_eq!(history.len(), 3);
        let ids: Vec<&str> = history
            .entries
            .iter()
            .map(|e| e.product_id.as_str())
            .collect();
        assert_eq!(ids, vec!["p4", "p3", "p2"]);
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let json = serde_json::to_string(&visit("p1")).expect("serialize visit");
        assert!(!json.contains("imageRef"));
        assert!(!json.contains("price"));
        assert!(!json.contains("category"));
        assert!(json.contains("visitedAtTimestamp"));
    }

    #[test]
    fn price_survives_a_roundtrip() {
        let mut entry = visit("p1");
        entry.price = Some(dec!(19.99));
        let json = serde_json::to_string(&entry).expect("serialize visit");
        let back: ProductVisit = serde_json::from_str(&json).expect("deserialize visit");
        assert_eq!(back.price, Some(dec!(19.99)));
    }
}
