//! Bulk-transfer device channel
//!
//! Signing devices on USB expose one interface with a bulk IN and a bulk OUT
//! endpoint. Writes run as blocking bulk transfers on the blocking pool. A
//! reader thread polls the IN endpoint and forwards every chunk into an
//! async channel, which makes `read` cancel-safe: a read abandoned by a
//! session timeout leaves the chunk queued for the next one.

use async_trait::async_trait;
use common::{Connector, DeviceChannel, Error, Result};
use protocol::{LogicalDevice, UsbEndpoint};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_POLL: Duration = Duration::from_millis(250);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BUFFER: usize = 512;

/// Map a libusb error onto the shared error type
pub fn map_rusb_error(err: rusb::Error) -> Error {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => {
            Error::Transport(format!("device disconnected: {}", err))
        }
        rusb::Error::Access => Error::Usb("access denied".to_string()),
        _ => Error::Usb(err.to_string()),
    }
}

/// One endpoint of an interface alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub interface: u8,
    pub address: u8,
    pub direction_in: bool,
    pub bulk: bool,
}

/// Interface and endpoint pair a channel talks through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkInterface {
    pub interface: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
}

/// First interface offering both a bulk IN and a bulk OUT endpoint
pub fn select_bulk_interface(endpoints: &[EndpointInfo]) -> Option<BulkInterface> {
    let mut interfaces: Vec<u8> = endpoints.iter().map(|ep| ep.interface).collect();
    interfaces.dedup();

    interfaces.into_iter().find_map(|interface| {
        let bulk = |direction_in: bool| {
            endpoints
                .iter()
                .find(|ep| ep.interface == interface && ep.bulk && ep.direction_in == direction_in)
                .map(|ep| ep.address)
        };
        Some(BulkInterface {
            interface,
            endpoint_in: bulk(true)?,
            endpoint_out: bulk(false)?,
        })
    })
}

fn list_endpoints(device: &Device<Context>) -> Result<Vec<EndpointInfo>> {
    let config = device.active_config_descriptor().map_err(map_rusb_error)?;
    let mut endpoints = Vec::new();
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                endpoints.push(EndpointInfo {
                    interface: descriptor.interface_number(),
                    address: endpoint.address(),
                    direction_in: endpoint.direction() == Direction::In,
                    bulk: endpoint.transfer_type() == TransferType::Bulk,
                });
            }
        }
    }
    Ok(endpoints)
}

/// Claimed interface; released when the last holder drops it
struct ClaimedInterface {
    handle: DeviceHandle<Context>,
    interface: u8,
    reattach_driver: bool,
}

impl Drop for ClaimedInterface {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            debug!("Failed to release interface {}: {}", self.interface, e);
        }
        if self.reattach_driver
            && let Err(e) = self.handle.attach_kernel_driver(self.interface)
        {
            debug!(
                "Failed to reattach kernel driver to interface {}: {}",
                self.interface, e
            );
        }
        debug!("Released interface {}", self.interface);
    }
}

/// Live bulk channel to one USB device
pub struct RusbChannel {
    claimed: Arc<ClaimedInterface>,
    endpoint_out: u8,
    incoming: async_channel::Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl RusbChannel {
    /// Open the device at the endpoint's location and claim its bulk interface
    ///
    /// Blocking; run it off the async runtime.
    pub fn open(context: &Context, endpoint: &UsbEndpoint) -> Result<Self> {
        let device = context
            .devices()
            .map_err(map_rusb_error)?
            .iter()
            .find(|device| {
                device.bus_number() == endpoint.bus_number
                    && device.address() == endpoint.device_address
                    && device.device_descriptor().is_ok_and(|desc| {
                        desc.vendor_id() == endpoint.vendor_id
                            && desc.product_id() == endpoint.product_id
                    })
            })
            .ok_or_else(|| {
                Error::Transport(format!(
                    "device not found at bus={}, addr={}",
                    endpoint.bus_number, endpoint.device_address
                ))
            })?;

        let bulk = select_bulk_interface(&list_endpoints(&device)?).ok_or_else(|| {
            Error::Usb(format!(
                "{:04x}:{:04x} has no bulk interface",
                endpoint.vendor_id, endpoint.product_id
            ))
        })?;

        let handle = device.open().map_err(map_rusb_error)?;

        let mut reattach_driver = false;
        match handle.kernel_driver_active(bulk.interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {}",
                    bulk.interface
                );
                match handle.detach_kernel_driver(bulk.interface) {
                    Ok(()) => reattach_driver = true,
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        bulk.interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    bulk.interface, e
                );
            }
        }

        handle
            .claim_interface(bulk.interface)
            .map_err(map_rusb_error)?;

        let claimed = Arc::new(ClaimedInterface {
            handle,
            interface: bulk.interface,
            reattach_driver,
        });
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = async_channel::unbounded();

        let reader_claimed = claimed.clone();
        let reader_closed = closed.clone();
        let endpoint_in = bulk.endpoint_in;
        std::thread::Builder::new()
            .name("usb-reader".to_string())
            .spawn(move || read_loop(reader_claimed, endpoint_in, reader_closed, tx))?;

        info!(
            "Opened USB channel to {:04x}:{:04x} (interface {}, in {:#04x}, out {:#04x})",
            endpoint.vendor_id,
            endpoint.product_id,
            bulk.interface,
            bulk.endpoint_in,
            bulk.endpoint_out
        );

        Ok(Self {
            claimed,
            endpoint_out: bulk.endpoint_out,
            incoming: rx,
            closed,
        })
    }
}

fn read_loop(
    claimed: Arc<ClaimedInterface>,
    endpoint: u8,
    closed: Arc<AtomicBool>,
    chunks: async_channel::Sender<Vec<u8>>,
) {
    let mut buffer = vec![0u8; READ_BUFFER];
    while !closed.load(Ordering::Acquire) {
        match claimed.handle.read_bulk(endpoint, &mut buffer, READ_POLL) {
            Ok(0) | Err(rusb::Error::Timeout) => {}
            Ok(len) => {
                if chunks.send_blocking(buffer[..len].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                if !closed.load(Ordering::Acquire) {
                    warn!("Bulk read on endpoint {:#04x} failed: {}", endpoint, e);
                }
                break;
            }
        }
    }
    debug!("USB reader for endpoint {:#04x} stopped", endpoint);
}

#[async_trait]
impl DeviceChannel for RusbChannel {
    async fn write(&mut self, frame: &[u8]) -> Result<()> {
        let claimed = self.claimed.clone();
        let endpoint = self.endpoint_out;
        let data = frame.to_vec();

        tokio::task::spawn_blocking(move || -> rusb::Result<()> {
            let mut written = 0;
            while written < data.len() {
                written += claimed
                    .handle
                    .write_bulk(endpoint, &data[written..], WRITE_TIMEOUT)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Other(format!("USB write task failed: {}", e)))?
        .map_err(map_rusb_error)
    }

    async fn read(&mut self) -> Result<Vec<u8>> {
        self.incoming
            .recv()
            .await
            .map_err(|_| Error::Transport("USB reader stopped".to_string()))
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.incoming.close();
    }
}

impl Drop for RusbChannel {
    fn drop(&mut self) {
        // The reader drops its claim within one poll interval
        self.closed.store(true, Ordering::Release);
    }
}

/// Opens [`RusbChannel`]s for USB devices
#[derive(Clone)]
pub struct RusbConnector {
    context: Context,
}

impl RusbConnector {
    pub fn new(context: Context) -> Self {
        Self { context }
    }
}

#[async_trait]
impl Connector for RusbConnector {
    async fn open(&self, device: &LogicalDevice) -> Result<Box<dyn DeviceChannel>> {
        let endpoint = device
            .usb_endpoint()
            .ok_or_else(|| Error::Usb(format!("{} is not a USB device", device.key)))?;
        let context = self.context.clone();

        let channel = tokio::task::spawn_blocking(move || RusbChannel::open(&context, &endpoint))
            .await
            .map_err(|e| Error::Other(format!("USB open task failed: {}", e)))??;
        Ok(Box::new(channel))
    }
}
