//! USB subsystem
//!
//! Handles device enumeration diffing, hot-plug detection and bulk transfers.
//!
//! - `scanner` diffs OS enumerations into attach/detach sets
//! - `backend` implements `UsbBackend` on top of libusb
//! - `worker` runs libusb hot-plug event handling on a dedicated thread
//! - `channel` is the bulk-transfer `DeviceChannel` for connected devices
//!
//! Enumeration, hot-plug handling and transfers block, so they run on the
//! worker thread or inside `spawn_blocking`. The access check behind
//! `has_permission` only opens the device briefly and runs inline, never
//! while the permission gateway lock is held.

pub mod backend;
pub mod channel;
pub mod scanner;
pub mod worker;

pub use backend::RusbBackend;
pub use channel::{RusbChannel, RusbConnector};
pub use scanner::{UsbScanDiff, UsbScanner, matches_filter};
pub use worker::HotplugWorker;
