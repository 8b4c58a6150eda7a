//! Event bridge between OS callbacks and the device manager
//!
//! OS notifications (USB attach/detach, permission results, BLE advertisements,
//! bond changes) arrive on arbitrary threads. Each source holds an
//! [`EventSender`] and posts [`ManagerEvent`]s; the device manager drains the
//! matching [`EventReceiver`] from a single task, so every registry
//! reconciliation passes through one queue in arrival order.

use async_channel::{Receiver, Sender, TryRecvError, unbounded};
use protocol::{BleAdvertisement, CorrelationToken, IdentityKey};

/// Events and commands consumed by the device manager event loop
#[derive(Debug)]
pub enum ManagerEvent {
    /// OS reported a USB attach; triggers a rescan
    UsbAttached {
        /// Bus number, when the source knows it
        bus_number: Option<u8>,
        /// Device address, when the source knows it
        device_address: Option<u8>,
    },

    /// OS reported a USB detach; triggers a rescan
    UsbDetached {
        bus_number: Option<u8>,
        device_address: Option<u8>,
    },

    /// Out-of-band resolution of a USB permission prompt
    PermissionResult {
        /// Endpoint the OS answered for, `None` when the OS omitted it
        endpoint: Option<IdentityKey>,
        /// Token of the request, when the backend can echo it
        token: Option<CorrelationToken>,
        /// Grant flag reported by the OS
        granted: bool,
    },

    /// BLE advertisement observed
    Advertisement(BleAdvertisement),

    /// BLE bond state changed for a peripheral
    BondStateChanged {
        /// Peripheral address
        address: String,
        /// New bond state
        bonded: bool,
    },

    /// A session handle was released by its owner
    SessionReleased {
        key: IdentityKey,
        session_id: u64,
    },

    /// Rescan USB and reseed BLE
    Refresh {
        /// Completed once the refresh batch is applied
        done: Option<tokio::sync::oneshot::Sender<()>>,
    },

    /// Stop the event loop
    Shutdown,
}

/// Sending half, handed to every OS event source
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<ManagerEvent>,
}

impl EventSender {
    /// Post an event from async code
    pub async fn send(&self, event: ManagerEvent) -> crate::Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Post an event from an OS callback thread
    ///
    /// The queue is unbounded, so this never blocks the caller.
    pub fn post(&self, event: ManagerEvent) -> crate::Result<()> {
        self.tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Whether the manager side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, drained by the device manager event loop
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<ManagerEvent>,
}

impl EventReceiver {
    /// Wait for the next event
    pub async fn recv(&self) -> crate::Result<ManagerEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take an already queued event without waiting
    pub fn try_recv(&self) -> Option<ManagerEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the event bridge
///
/// Returns (EventSender for OS sources, EventReceiver for the manager)
pub fn create_event_bridge() -> (EventSender, EventReceiver) {
    let (tx, rx) = unbounded();
    (EventSender { tx }, EventReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_from_os_thread_keep_order() {
        let (tx, rx) = create_event_bridge();

        let handle = std::thread::spawn(move || {
            for address in ["AA", "BB", "CC"] {
                tx.post(ManagerEvent::BondStateChanged {
                    address: address.to_string(),
                    bonded: true,
                })
                .unwrap();
            }
        });
        handle.join().unwrap();

        let mut seen = Vec::new();
        while let Some(event) = rx.try_recv() {
            if let ManagerEvent::BondStateChanged { address, .. } = event {
                seen.push(address);
            }
        }
        assert_eq!(seen, vec!["AA", "BB", "CC"]);
    }

    #[tokio::test]
    async fn test_recv_fails_once_all_senders_dropped() {
        let (tx, rx) = create_event_bridge();
        tx.send(ManagerEvent::Shutdown).await.unwrap();
        drop(tx);

        assert!(matches!(rx.recv().await, Ok(ManagerEvent::Shutdown)));
        assert!(rx.recv().await.is_err());
    }

    #[test]
    fn test_post_after_receiver_dropped() {
        let (tx, rx) = create_event_bridge();
        drop(rx);

        assert!(tx.is_closed());
        assert!(tx.post(ManagerEvent::Shutdown).is_err());
    }
}
