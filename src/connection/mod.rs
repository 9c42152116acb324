//! Connection management for a single BLE peripheral
//!
//! This module handles:
//! - The connection session pipeline with automatic reconnection
//! - The replaying feed through which every caller sees the live connection
//! - Reconnection backoff and retry classification

mod feed;
mod manager;
mod retry;

pub use feed::ConnectionFeed;
pub use manager::{ConnectionSession, SessionConfig};
pub use retry::RetryPolicy;
