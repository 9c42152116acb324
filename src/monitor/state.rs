//! Connection State Monitor
//!
//! Subscribes directly to the device's raw state feed. Nothing is filtered,
//! retried or suppressed, so the display keeps reflecting the radio while the
//! session silently reconnects.

use crate::device::DeviceHandle;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use trailer_shared::ConnectionState;

/// Watches the radio-level connection state of one device
pub struct ConnectionStateMonitor<D: DeviceHandle> {
    device: Arc<D>,
}

impl<D: DeviceHandle> ConnectionStateMonitor<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self { device }
    }

    /// Fresh stream of state changes; each call subscribes anew
    pub fn state_changes(&self) -> BoxStream<'static, ConnectionState> {
        self.device.observe_state()
    }

    /// Forward state changes from a background task to the returned
    /// subscription, typically consumed by a UI loop
    pub fn start(&self) -> StateSubscription {
        let (state_tx, state_rx) = mpsc::unbounded_channel();
        let mut states = self.state_changes();
        let address = self.device.address();

        let task = tokio::spawn(async move {
            while let Some(state) = states.next().await {
                debug!("[MONITOR] {} is {}", address, state);
                if state_tx.send(state).is_err() {
                    break;
                }
            }
            info!("[MONITOR] Monitoring of {} stopped", address);
        });

        StateSubscription { state_rx, task }
    }
}

/// Running state forwarder; stops when dropped
pub struct StateSubscription {
    state_rx: mpsc::UnboundedReceiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl StateSubscription {
    /// Receive the next state change
    pub async fn recv(&mut self) -> Option<ConnectionState> {
        self.state_rx.recv().await
    }
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
