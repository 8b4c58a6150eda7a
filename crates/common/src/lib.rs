//! Common utilities for hw-devmgr
//!
//! This crate provides the pieces shared between the device manager and its
//! transport backends: error handling, logging setup, the event bridge that
//! carries OS callbacks into the manager, the backend traits, and test mocks.

pub mod backend;
pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use backend::{BleBackend, Connector, DeviceChannel, UsbBackend};
pub use channel::{EventReceiver, EventSender, ManagerEvent, create_event_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
