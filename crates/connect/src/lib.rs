//! HTTP realization of the remote submission contract.

mod client;

pub use client::{AccessTokenProvider, ConnectClient};
