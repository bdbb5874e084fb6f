//! Commerce documents: cart, favorites, browsing history.

mod cart;
mod favorites;
mod history;

pub use cart::*;
pub use favorites::*;
pub use history::*;
