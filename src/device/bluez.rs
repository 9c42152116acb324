//! BlueZ backend for real Bluetooth Low Energy peripherals

use crate::device::state_stream;
use crate::device::traits::{DeviceHandle, GattConnection};
use anyhow::Result;
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty, ErrorKind};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use trailer_shared::{
    CharacteristicId, ConnectionState, DeviceError, DeviceErrorKind, PeripheralAddress,
};

/// How long to wait for GATT services after the link comes up
pub const SERVICE_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// A peripheral reached through the local BlueZ adapter
pub struct BluezPeripheral {
    adapter: Adapter,
    device: Device,
    address: PeripheralAddress,
    state_tx: broadcast::Sender<ConnectionState>,
}

impl BluezPeripheral {
    /// Power up the default adapter and obtain a handle for `address`
    pub async fn open(address: PeripheralAddress) -> Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!("[BLUEZ] Using adapter {}", adapter.name());

        let device = adapter.device(Address::new(address.octets()))?;
        let (state_tx, _) = broadcast::channel(32);

        Ok(Self {
            adapter,
            device,
            address,
            state_tx,
        })
    }

    /// Name of the adapter in use
    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }
}

/// Disconnects the device when an attempt is abandoned
struct LinkGuard {
    device: Device,
    state_tx: broadcast::Sender<ConnectionState>,
    release_on_drop: bool,
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        if !self.release_on_drop {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let device = self.device.clone();
        let state_tx = self.state_tx.clone();
        let _ = state_tx.send(ConnectionState::Disconnecting);
        runtime.spawn(async move {
            if let Err(e) = device.disconnect().await {
                debug!("[BLUEZ] Disconnect of {} failed: {}", device.address(), e);
            }
        });
    }
}

enum LinkPhase {
    Connecting(LinkGuard),
    Linked(LinkGuard),
    Done(LinkGuard),
}

impl DeviceHandle for BluezPeripheral {
    type Connection = BluezConnection;

    fn address(&self) -> PeripheralAddress {
        self.address
    }

    fn connect(&self, auto_retry: bool) -> BoxStream<'static, Result<Self::Connection, DeviceError>> {
        if auto_retry {
            debug!("[BLUEZ] auto_retry is handled by bluetoothd's own reconnect policy");
        }

        let guard = LinkGuard {
            device: self.device.clone(),
            state_tx: self.state_tx.clone(),
            release_on_drop: true,
        };

        stream::unfold(LinkPhase::Connecting(guard), |phase| async move {
            match phase {
                LinkPhase::Connecting(mut guard) => {
                    let device = guard.device.clone();
                    let _ = guard.state_tx.send(ConnectionState::Connecting);

                    match establish(&device).await {
                        Ok(()) => {
                            info!("[BLUEZ] Connected to {}", device.address());
                            let conn = BluezConnection::new(device);
                            Some((Ok(conn), LinkPhase::Linked(guard)))
                        }
                        Err(EstablishError { error, linked }) => {
                            // A link without usable services is torn down with the guard
                            guard.release_on_drop = linked;
                            Some((Err(error), LinkPhase::Done(guard)))
                        }
                    }
                }
                LinkPhase::Linked(mut guard) => {
                    let err = wait_for_link_loss(&guard.device).await;
                    guard.release_on_drop = false;
                    Some((Err(err), LinkPhase::Done(guard)))
                }
                LinkPhase::Done(_) => None,
            }
        })
        .boxed()
    }

    fn observe_state(&self) -> BoxStream<'static, ConnectionState> {
        let local = state_stream(self.state_tx.subscribe());
        let device = self.device.clone();

        let radio = stream::once(async move {
            let initial = match device.is_connected().await {
                Ok(true) => ConnectionState::Connected,
                _ => ConnectionState::Disconnected,
            };

            let changes = match device.events().await {
                Ok(events) => events
                    .filter_map(|event| async move {
                        match event {
                            DeviceEvent::PropertyChanged(DeviceProperty::Connected(true)) => {
                                Some(ConnectionState::Connected)
                            }
                            DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) => {
                                Some(ConnectionState::Disconnected)
                            }
                            _ => None,
                        }
                    })
                    .boxed(),
                Err(e) => {
                    warn!("[BLUEZ] Cannot watch {}: {}", device.address(), e);
                    stream::empty().boxed()
                }
            };

            stream::once(async move { initial }).chain(changes)
        })
        .flatten();

        stream::select(local, radio).boxed()
    }
}

/// Failure to bring a link up
struct EstablishError {
    error: DeviceError,
    /// The radio link is up and must be released
    linked: bool,
}

impl EstablishError {
    fn connect(err: bluer::Error) -> Self {
        Self {
            error: connect_error(err),
            linked: false,
        }
    }

    fn resolve(error: DeviceError) -> Self {
        Self {
            error,
            linked: true,
        }
    }
}

/// Bring the link up and wait until GATT services are usable
async fn establish(device: &Device) -> Result<(), EstablishError> {
    let connected = device.is_connected().await.map_err(EstablishError::connect)?;
    if !connected {
        debug!("[BLUEZ] Connecting to {}", device.address());
        device.connect().await.map_err(EstablishError::connect)?;
    }

    let resolved = async {
        let events = device.events().await?;
        tokio::pin!(events);
        if device.is_services_resolved().await? {
            return Ok(());
        }
        while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true)) = event {
                break;
            }
        }
        Ok::<_, bluer::Error>(())
    };

    match timeout(SERVICE_RESOLVE_TIMEOUT, resolved).await {
        Ok(result) => result.map_err(|e| EstablishError::resolve(connect_error(e))),
        Err(_) => Err(EstablishError::resolve(DeviceError::new(
            DeviceErrorKind::Timeout,
            format!("services of {} not resolved", device.address()),
        ))),
    }
}

/// Resolves once the peripheral drops off
async fn wait_for_link_loss(device: &Device) -> DeviceError {
    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => return map_error(e),
    };
    tokio::pin!(events);

    if !device.is_connected().await.unwrap_or(false) {
        return DeviceError::disconnected(format!("{} dropped the link", device.address()));
    }

    while let Some(event) = events.next().await {
        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
            return DeviceError::disconnected(format!("{} dropped the link", device.address()));
        }
    }
    DeviceError::disconnected("device event stream ended")
}

/// Errors while bringing the link up; a failed attempt counts as a drop
fn connect_error(err: bluer::Error) -> DeviceError {
    match err.kind {
        ErrorKind::Failed | ErrorKind::InProgress => {
            DeviceError::disconnected(err.to_string())
        }
        _ => map_error(err),
    }
}

/// Errors from GATT operations; a link that is already gone is stale, not lost
fn op_error(err: bluer::Error) -> DeviceError {
    match err.kind {
        ErrorKind::NotConnected => DeviceError::not_connected(err.to_string()),
        _ => map_error(err),
    }
}

fn map_error(err: bluer::Error) -> DeviceError {
    let kind = match err.kind {
        ErrorKind::NotConnected | ErrorKind::ConnectionAttemptFailed => {
            DeviceErrorKind::Disconnected
        }
        ErrorKind::NotAuthorized
        | ErrorKind::NotPermitted
        | ErrorKind::AuthenticationCanceled
        | ErrorKind::AuthenticationFailed
        | ErrorKind::AuthenticationRejected
        | ErrorKind::AuthenticationTimeout => DeviceErrorKind::PermissionDenied,
        ErrorKind::NotReady | ErrorKind::NotAvailable | ErrorKind::NotSupported => {
            DeviceErrorKind::AdapterUnavailable
        }
        ErrorKind::InvalidArguments | ErrorKind::InvalidLength | ErrorKind::InvalidOffset => {
            DeviceErrorKind::Rejected
        }
        _ => DeviceErrorKind::Transport,
    };
    DeviceError::new(kind, err.to_string())
}

/// GATT connection through BlueZ
#[derive(Clone)]
pub struct BluezConnection {
    device: Device,
    characteristics: Arc<Mutex<HashMap<CharacteristicId, Characteristic>>>,
}

impl BluezConnection {
    fn new(device: Device) -> Self {
        Self {
            device,
            characteristics: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn characteristic(&self, id: CharacteristicId) -> Result<Characteristic, DeviceError> {
        let mut cache = self.characteristics.lock().await;
        if let Some(characteristic) = cache.get(&id) {
            return Ok(characteristic.clone());
        }

        for service in self.device.services().await.map_err(op_error)? {
            for characteristic in service.characteristics().await.map_err(op_error)? {
                if characteristic.uuid().await.map_err(op_error)? == id.uuid() {
                    cache.insert(id, characteristic.clone());
                    return Ok(characteristic);
                }
            }
        }

        Err(DeviceError::new(
            DeviceErrorKind::CharacteristicNotFound,
            id.to_string(),
        ))
    }
}

#[async_trait]
impl GattConnection for BluezConnection {
    async fn write_characteristic(
        &self,
        id: CharacteristicId,
        payload: Bytes,
    ) -> Result<Bytes, DeviceError> {
        let characteristic = self.characteristic(id).await?;
        characteristic.write(&payload).await.map_err(op_error)?;
        Ok(payload)
    }

    async fn read_characteristic(&self, id: CharacteristicId) -> Result<Bytes, DeviceError> {
        let characteristic = self.characteristic(id).await?;
        let value = characteristic.read().await.map_err(op_error)?;
        Ok(Bytes::from(value))
    }
}
