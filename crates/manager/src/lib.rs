//! Hardware signing device manager
//!
//! Discovers signing devices over USB and BLE, keeps a deduplicated registry
//! of logical devices, gates USB access behind OS permission grants and hands
//! out request/response sessions with per-request timeout classes.
//!
//! # Example
//!
//! ```no_run
//! use manager::{DeviceManager, ManagerConfig, RusbBackend};
//! use protocol::TimeoutClass;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ManagerConfig::default();
//! let usb = Arc::new(RusbBackend::new(true, config.usb.filters.clone())?);
//! let connector = Arc::new(usb.connector());
//! let manager = DeviceManager::builder(config)
//!     .with_usb(usb, connector)
//!     .start()
//!     .await;
//!
//! if let Some(device) = manager.devices().iter().next().cloned() {
//!     manager.authorize(&device.key).await?;
//!     let session = manager.connect(&device.key).await?;
//!     let reply = session.send(b"ping", TimeoutClass::Autonomous).await?;
//!     println!("{} bytes", reply.len());
//! }
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod ble;
pub mod config;
pub mod manager;
pub mod permission;
pub mod registry;
pub mod session;
pub mod timeout;
pub mod usb;

pub use config::ManagerConfig;
pub use manager::{DeviceManager, DeviceManagerBuilder};
pub use permission::{PendingPermissionRequest, PermissionGateway};
pub use registry::{DeviceRegistry, RegistryEvent, RegistrySnapshot};
pub use session::{ConnectionSession, SessionCancelHandle, SessionHealth};
pub use timeout::TimeoutPolicy;
pub use usb::{RusbBackend, RusbConnector};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
