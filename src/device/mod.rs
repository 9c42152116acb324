//! Device handles: the boundary to the radio stack
//!
//! A backend exposes raw connect, read/write and state observation for one
//! peripheral. The session, monitor and dispatcher only ever see the traits.

#[cfg(feature = "bluez")]
pub mod bluez;
pub mod simulated;
pub mod traits;

#[cfg(feature = "bluez")]
pub use bluez::{BluezConnection, BluezPeripheral};
pub use simulated::{AttemptOutcome, SimulatedConfig, SimulatedConnection, SimulatedPeripheral};
pub use traits::{DeviceHandle, GattConnection};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use trailer_shared::ConnectionState;

/// Turn a broadcast receiver into a state stream, skipping over lag
pub(crate) fn state_stream(
    rx: broadcast::Receiver<ConnectionState>,
) -> BoxStream<'static, ConnectionState> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(state) => return Some((state, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
