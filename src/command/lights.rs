//! Trailer light commands on top of the characteristic dispatcher

use super::dispatcher::CharacteristicDispatcher;
use crate::device::GattConnection;
use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::info;
use trailer_shared::{link, CharacteristicId, Light, LightCommand};

/// Switches the trailer lights through the mode characteristic
#[derive(Clone)]
pub struct LightsController<C> {
    dispatcher: CharacteristicDispatcher<C>,
    characteristic: CharacteristicId,
}

impl<C: GattConnection> LightsController<C> {
    pub fn new(dispatcher: CharacteristicDispatcher<C>) -> Self {
        Self {
            dispatcher,
            characteristic: link::TRAILER_MODE,
        }
    }

    /// Turn on a single light. Returns the acknowledged bytes.
    pub async fn turn_on(&self, light: Light) -> Result<Bytes> {
        self.send(LightCommand::On(light)).await
    }

    /// Turn all lights off
    pub async fn turn_off(&self) -> Result<Bytes> {
        self.send(LightCommand::AllOff).await
    }

    /// Read back and decode the current light mode
    pub async fn read_mode(&self) -> Result<LightCommand> {
        let raw = self
            .dispatcher
            .read(self.characteristic)
            .await
            .context("Failed to read trailer mode")?;
        LightCommand::decode(&raw).context("Trailer reported an invalid mode")
    }

    async fn send(&self, command: LightCommand) -> Result<Bytes> {
        let ack = self
            .dispatcher
            .write(self.characteristic, command.encode())
            .await
            .with_context(|| format!("Failed to send {}", command))?;
        info!("[LIGHTS] {} acknowledged: {:?}", command, ack.as_ref());
        Ok(ack)
    }
}
