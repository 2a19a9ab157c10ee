//! Device lifecycle orchestration
//!
//! One [`DeviceLifecycle`] drives one device for one session. It owns every
//! transport to that device and is the only place the device state changes.

mod orchestrator;
pub mod sequencer;
mod state;

pub use orchestrator::{DeviceLifecycle, Transports};
pub use sequencer::{PowerOnMode, PowerSequencer};
pub use state::{DeviceState, Transition};
