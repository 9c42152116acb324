//! Device handle abstraction for pluggable radio backends

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use trailer_shared::{CharacteristicId, ConnectionState, DeviceError, PeripheralAddress};

/// A live GATT connection to a peripheral
///
/// Clones share the same underlying link.
#[async_trait]
pub trait GattConnection: Clone + Send + Sync + 'static {
    /// Write a characteristic, resolving with the acknowledgment payload
    async fn write_characteristic(
        &self,
        id: CharacteristicId,
        payload: Bytes,
    ) -> Result<Bytes, DeviceError>;

    /// Read the current value of a characteristic
    async fn read_characteristic(&self, id: CharacteristicId) -> Result<Bytes, DeviceError>;
}

/// One physical peripheral
pub trait DeviceHandle: Send + Sync + 'static {
    /// The connection type this device produces
    type Connection: GattConnection;

    /// Stable address of the peripheral
    fn address(&self) -> PeripheralAddress;

    /// Open a physical connection.
    ///
    /// The stream yields the connection once established and ends with an
    /// error when the link is lost. Dropping the stream releases the link.
    fn connect(&self, auto_retry: bool) -> BoxStream<'static, Result<Self::Connection, DeviceError>>;

    /// Raw radio-level state of the peripheral: the current state, then every change
    fn observe_state(&self) -> BoxStream<'static, ConnectionState>;
}
