//! USB hot-plug worker thread
//!
//! libusb delivers hot-plug callbacks only from inside `handle_events`, which
//! blocks. A dedicated thread runs that loop and forwards attach/detach
//! notifications into the manager's event bridge. The notifications carry
//! only the OS location; the manager rescans to learn what changed.

use common::{EventSender, ManagerEvent};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const EVENT_POLL: Duration = Duration::from_millis(100);

/// Forwards libusb hot-plug callbacks to the event bridge
struct HotplugCallback {
    events: EventSender,
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.events.post(ManagerEvent::UsbAttached {
            bus_number: Some(device.bus_number()),
            device_address: Some(device.address()),
        });
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        let _ = self.events.post(ManagerEvent::UsbDetached {
            bus_number: Some(device.bus_number()),
            device_address: Some(device.address()),
        });
    }
}

/// Handle to the running hot-plug thread; stops it on drop
#[derive(Debug)]
pub struct HotplugWorker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugWorker {
    /// Register hot-plug callbacks and start the event thread
    ///
    /// Returns once registration succeeded or failed.
    pub fn spawn(context: Context, events: EventSender) -> common::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("usb-hotplug".to_string())
            .spawn(move || run(context, events, thread_stop, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(common::Error::Usb(format!(
                    "Failed to register hot-plug callbacks: {}",
                    e
                )))
            }
            Err(_) => Err(common::Error::Usb(
                "Hot-plug worker exited during startup".to_string(),
            )),
        }
    }

    /// Stop the thread and deregister the callbacks
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("USB hot-plug worker panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }
}

impl Drop for HotplugWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    context: Context,
    events: EventSender,
    stop: Arc<AtomicBool>,
    ready: mpsc::Sender<rusb::Result<()>>,
) {
    let callback = HotplugCallback { events };
    // Dropping the registration deregisters the callbacks
    let _registration: Registration<Context> = match HotplugBuilder::new()
        .enumerate(false)
        .register(&context, Box::new(callback))
    {
        Ok(registration) => {
            let _ = ready.send(Ok(()));
            registration
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    info!("USB hot-plug worker started");

    while !stop.load(Ordering::Acquire) {
        match context.handle_events(Some(EVENT_POLL)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_POLL);
            }
        }
    }

    info!("USB hot-plug worker stopped");
}
