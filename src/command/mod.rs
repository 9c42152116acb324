//! Characteristic operations for the trailer controller
//!
//! This module handles:
//! - Dispatching one-shot reads and writes over the session's live connection
//! - Encoding trailer light commands onto the mode characteristic

mod dispatcher;
mod lights;

pub use dispatcher::{CharacteristicDispatcher, ReadRequest, WriteRequest};
pub use lights::LightsController;
