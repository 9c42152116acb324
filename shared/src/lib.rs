//! Trailer Lights Shared Types
//!
//! This crate provides the types shared between the link session, the
//! characteristic dispatcher and the device backends: peripheral and
//! characteristic identifiers, connection states, the error taxonomy and the
//! trailer-lights command codec.

pub mod address;
pub mod codec;
pub mod error;
pub mod state;

pub use address::{AddressError, CharacteristicId, PeripheralAddress};
pub use codec::{CodecError, Light, LightCommand};
pub use error::{
    classify, DeviceError, DeviceErrorKind, ErrorClass, OperationError, SessionError,
};
pub use state::ConnectionState;

/// Link parameters for the trailer controller
pub mod link {
    use crate::{CharacteristicId, PeripheralAddress};

    /// Address of the trailer controller used during development
    pub const DEFAULT_ADDRESS: PeripheralAddress =
        PeripheralAddress::new([0xCC, 0x78, 0xAB, 0x1A, 0x75, 0x03]);

    /// Characteristic carrying the trailer light mode
    pub const TRAILER_MODE: CharacteristicId =
        CharacteristicId::from_u128(0x2f49_0001_b8ed_495c_882f_1b15_3728_a885);

    /// First delay before reconnecting after a dropped link
    pub const RECONNECT_DELAY_MS: u64 = 500;

    /// Upper bound for the reconnect backoff
    pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;
}
