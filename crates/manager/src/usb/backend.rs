//! libusb implementation of `UsbBackend`
//!
//! Desktop systems have no interactive USB permission prompt: access is
//! decided by device-node permissions (udev rules on Linux). A "prompt" here
//! re-checks access and answers immediately through the event bridge, so the
//! permission gateway sees the same asynchronous flow as on platforms with a
//! real prompt.

use crate::lock;
use crate::usb::channel::{RusbConnector, map_rusb_error};
use crate::usb::scanner::matches_filter;
use crate::usb::worker::HotplugWorker;
use common::{EventSender, ManagerEvent, Result, UsbBackend};
use protocol::{CorrelationToken, UsbEndpoint};
use rusb::{Context, Device, DeviceDescriptor, UsbContext};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub struct RusbBackend {
    context: Context,
    /// Register libusb hot-plug callbacks on subscribe
    hotplug: bool,
    /// Only these devices have their string descriptors read
    filters: Vec<String>,
    worker: Mutex<Option<HotplugWorker>>,
    events: Mutex<Option<EventSender>>,
}

impl RusbBackend {
    pub fn new(hotplug: bool, filters: Vec<String>) -> Result<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self {
            context,
            hotplug,
            filters,
            worker: Mutex::new(None),
            events: Mutex::new(None),
        })
    }

    /// Connector sharing this backend's libusb context
    pub fn connector(&self) -> RusbConnector {
        RusbConnector::new(self.context.clone())
    }

    fn find_device(&self, endpoint: &UsbEndpoint) -> Option<Device<Context>> {
        let devices = self.context.devices().ok()?;
        devices.iter().find(|device| {
            device.bus_number() == endpoint.bus_number
                && device.address() == endpoint.device_address
        })
    }

    /// Read (manufacturer, product, serial) strings; needs the device opened
    fn read_string_descriptors(
        device: &Device<Context>,
        descriptor: &DeviceDescriptor,
    ) -> (Option<String>, Option<String>, Option<String>) {
        let handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                debug!(
                    "Cannot open bus={}, addr={} to read strings: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                return (None, None, None);
            }
        };

        let manufacturer = descriptor
            .manufacturer_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        let product = descriptor
            .product_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        let serial = descriptor
            .serial_number_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

        (manufacturer, product, serial)
    }
}

impl UsbBackend for RusbBackend {
    fn enumerate(&self) -> Result<Vec<UsbEndpoint>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let mut endpoints = Vec::with_capacity(devices.len());

        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    debug!(
                        "Skipping bus={}, addr={}: no device descriptor: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            let (manufacturer, product, serial_number) = if matches_filter(
                descriptor.vendor_id(),
                descriptor.product_id(),
                &self.filters,
            ) {
                Self::read_string_descriptors(&device, &descriptor)
            } else {
                (None, None, None)
            };

            endpoints.push(UsbEndpoint {
                bus_number: device.bus_number(),
                device_address: device.address(),
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
                class: descriptor.class_code(),
                serial_number,
                manufacturer,
                product,
            });
        }

        debug!("Enumerated {} USB devices", endpoints.len());
        Ok(endpoints)
    }

    fn has_permission(&self, endpoint: &UsbEndpoint) -> bool {
        self.find_device(endpoint)
            .is_some_and(|device| device.open().is_ok())
    }

    fn request_permission(&self, endpoint: &UsbEndpoint, token: CorrelationToken) -> Result<()> {
        let events = lock(&self.events)
            .clone()
            .ok_or_else(|| common::Error::Usb("USB backend not subscribed".to_string()))?;

        let granted = self.has_permission(endpoint);
        if !granted {
            info!(
                "No access to {:04x}:{:04x} at bus={}, addr={}; check udev rules",
                endpoint.vendor_id,
                endpoint.product_id,
                endpoint.bus_number,
                endpoint.device_address
            );
        }

        events.post(ManagerEvent::PermissionResult {
            endpoint: Some(endpoint.identity_key()),
            token: Some(token),
            granted,
        })
    }

    fn subscribe(&self, events: EventSender) -> Result<()> {
        *lock(&self.events) = Some(events.clone());

        if !self.hotplug {
            debug!("USB hot-plug disabled by configuration");
            return Ok(());
        }
        if !rusb::has_hotplug() {
            warn!("libusb hot-plug unsupported on this platform; use refresh to rescan");
            return Ok(());
        }

        let worker = HotplugWorker::spawn(self.context.clone(), events)?;
        *lock(&self.worker) = Some(worker);
        Ok(())
    }

    fn unsubscribe(&self) {
        if let Some(mut worker) = lock(&self.worker).take() {
            worker.stop();
        }
        lock(&self.events).take();
    }
}

impl std::fmt::Debug for RusbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusbBackend")
            .field("hotplug", &self.hotplug)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}
