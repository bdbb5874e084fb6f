//! Cart document and its reducers.

use serde::{Deserialize, Serialize};

/// One product line in the cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: String,
    pub quantity: u32,
}

/// The cart document: ordered lines, at most one per product.
///
/// Mutations go through the reducers below so the one-line-per-product
/// invariant holds no matter which path queued the change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartState {
    pub lines: Vec<CartLine>,
}

impl CartState {
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Total units across all lines.
    pub fn total_quantity(&self) -> u64 {
        self.lines
            .iter()
            .map(|line| u64::from(line.quantity))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn quantity_of(&self, product_id: &str) -> u32 {
        self.lines
            .iter()
            .find(|line| line.product_id == product_id)
            .map(|line| line.quantity)
            .unwrap_or(0)
    }

    /// Add units to a line, appending the line when the product is new.
    pub fn add_item(&mut self, product_id: &str, quantity: u32) {
        if let Some(line) = self
            .lines
            .iter_mut()
            .find(|line| line.product_id == product_id)
        {
            line.quantity = line.quantity.saturating_add(quantity);
        } else {
            self.lines.push(CartLine {
                product_id: product_id.to_string(),
                quantity,
            });
        }
    }

    /// Drop a line entirely. Unknown products are a no-op.
    pub fn remove_item(&mut self, product_id: &str) {
        self.lines.retain(|line| line.product_id != product_id);
    }

    /// Replace a line's quantity, appending the line when the product is new.
    pub fn set_quantity(&mut self, product_id: &str, quantity: u32) {
        if let Some(line) = self
            .lines
            .iter_mut()
            .find(|line| line.product_id == product_id)
        {
            line.quantity = quantity;
        } else {
            self.lines.push(CartLine {
                product_id: product_id.to_string(),
                quantity,
            });
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}
