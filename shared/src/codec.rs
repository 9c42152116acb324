//! Trailer-lights command codec
//!
//! The trailer mode characteristic accepts a fixed 3-byte command:
//! ```text
//! [ opcode = 0x04 ][ light: 0 = all off, 1 = tail, 2 = left, 3 = right ][ reserved = 0x00 ]
//! ```

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Opcode selecting the light mode
pub const OPCODE_LIGHTS: u8 = 4;

/// Length of every light command
pub const COMMAND_LEN: usize = 3;

/// Errors that can occur while decoding a command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid command length: {0} bytes (expected {COMMAND_LEN})")]
    InvalidLength(usize),

    #[error("Unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("Unknown light id: {0}")]
    UnknownLight(u8),
}

/// Lights on the trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Light {
    Tail,
    Left,
    Right,
}

impl Light {
    pub fn id(&self) -> u8 {
        match self {
            Light::Tail => 1,
            Light::Left => 2,
            Light::Right => 3,
        }
    }

    pub fn from_id(id: u8) -> Result<Self, CodecError> {
        match id {
            1 => Ok(Light::Tail),
            2 => Ok(Light::Left),
            3 => Ok(Light::Right),
            other => Err(CodecError::UnknownLight(other)),
        }
    }
}

impl fmt::Display for Light {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Light::Tail => write!(f, "TAIL"),
            Light::Left => write!(f, "LEFT"),
            Light::Right => write!(f, "RIGHT"),
        }
    }
}

/// Command written to the trailer mode characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightCommand {
    On(Light),
    AllOff,
}

impl LightCommand {
    /// Encode into the on-wire byte layout
    pub fn encode(&self) -> Bytes {
        let light = match self {
            LightCommand::On(light) => light.id(),
            LightCommand::AllOff => 0,
        };
        Bytes::copy_from_slice(&[OPCODE_LIGHTS, light, 0])
    }

    /// Decode a command or the mode value read back from the peripheral
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() != COMMAND_LEN {
            return Err(CodecError::InvalidLength(buf.len()));
        }
        if buf[0] != OPCODE_LIGHTS {
            return Err(CodecError::UnknownOpcode(buf[0]));
        }

        match buf[1] {
            0 => Ok(LightCommand::AllOff),
            id => Light::from_id(id).map(LightCommand::On),
        }
    }
}

impl fmt::Display for LightCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LightCommand::On(light) => write!(f, "{} on", light),
            LightCommand::AllOff => write!(f, "all off"),
        }
    }
}
