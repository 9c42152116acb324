//! Connection state monitoring
//!
//! Republishes the radio-level state of the peripheral, independently of the
//! session's reconnect cycling.

mod state;

pub use state::{ConnectionStateMonitor, StateSubscription};
