//! Transport backend abstractions
//!
//! The device manager never talks to the OS directly. Each transport is
//! reached through one of these traits: a USB backend for enumeration and
//! permission prompts, a BLE backend for advertisement scanning, and a
//! [`Connector`] that opens a [`DeviceChannel`] to a device once it is
//! connectable. OS callbacks are delivered through the [`EventSender`] a
//! backend receives when the manager subscribes to it.

use crate::channel::EventSender;
use async_trait::async_trait;
use protocol::{CorrelationToken, LogicalDevice, UsbEndpoint};
use uuid::Uuid;

/// OS USB enumeration and permission API
pub trait UsbBackend: Send + Sync {
    /// Enumerate currently attached endpoints
    fn enumerate(&self) -> crate::Result<Vec<UsbEndpoint>>;

    /// Whether the OS already allows access to `endpoint`
    ///
    /// May open the device briefly. Callers never hold a lock while calling it.
    fn has_permission(&self, endpoint: &UsbEndpoint) -> bool;

    /// Issue the OS permission prompt for `endpoint`
    ///
    /// Must return without waiting for the user. The outcome is posted later as
    /// a `ManagerEvent::PermissionResult`, echoing `token` when the OS allows.
    fn request_permission(&self, endpoint: &UsbEndpoint, token: CorrelationToken)
    -> crate::Result<()>;

    /// Register attach/detach notifications
    ///
    /// Called once by the manager at startup.
    fn subscribe(&self, events: EventSender) -> crate::Result<()>;

    /// Deregister notifications; called once at shutdown
    fn unsubscribe(&self);
}

/// OS BLE advertisement and bonding API
pub trait BleBackend: Send + Sync {
    /// Start delivering advertisements for `services` and bond-state changes
    fn start_scan(&self, services: &[Uuid], events: EventSender) -> crate::Result<()>;

    /// Stop scanning and drop the event sender
    fn stop_scan(&self);
}

/// Live byte channel to a connected device
///
/// Dropping a channel must release the underlying OS resource; `close` is the
/// graceful variant.
#[async_trait]
pub trait DeviceChannel: Send {
    /// Write one complete frame
    async fn write(&mut self, frame: &[u8]) -> crate::Result<()>;

    /// Read the next chunk of bytes; may carry a partial frame
    ///
    /// Must be cancel-safe: a read abandoned by a timeout loses no data.
    async fn read(&mut self) -> crate::Result<Vec<u8>>;

    /// Close the channel gracefully
    async fn close(&mut self);
}

/// Opens channels to devices of one transport
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, device: &LogicalDevice) -> crate::Result<Box<dyn DeviceChannel>>;
}
