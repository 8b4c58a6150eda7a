//! Device manager
//!
//! Wires the transport scanners and the permission gateway to the registry
//! and exposes the public discovery, permission and connect API.
//!
//! # Architecture
//!
//! ```text
//! OS callbacks ──┐
//! (any thread)   │  EventSender            ┌──────────────┐
//! sessions ──────┼───────────────────────► │  event loop  │──► registry ──► watch
//! refresh() ─────┘     (unbounded)         │ (one task)   │    (batched)    snapshots
//!                                          └──────────────┘
//! ```
//!
//! Every OS notification passes through one queue drained by a single task.
//! The task folds up to `event_batch_limit` queued events into one batch,
//! applies it to the registry in one step and publishes one snapshot. API
//! calls that change a single device (connect, disconnect, remove) take the
//! same registry lock, so all writes are serialized.

use crate::ble::BleScanner;
use crate::config::ManagerConfig;
use crate::lock;
use crate::permission::{PermissionGateway, Resolution};
use crate::registry::{DeviceRegistry, RegistryEvent, RegistrySnapshot};
use crate::session::{ConnectionSession, SessionCore};
use crate::timeout::TimeoutPolicy;
use crate::usb::UsbScanner;
use common::{
    BleBackend, Connector, EventReceiver, EventSender, ManagerEvent, UsbBackend,
    create_event_bridge,
};
use protocol::{
    ConnectionState, DenialReason, DeviceError, IdentityKey, LogicalDevice, TransportKind,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct UsbTransport {
    backend: Arc<dyn UsbBackend>,
    connector: Arc<dyn Connector>,
    gateway: PermissionGateway,
}

struct BleTransport {
    backend: Arc<dyn BleBackend>,
    connector: Arc<dyn Connector>,
    services: Vec<Uuid>,
}

/// State shared by the public handle and the event loop
struct Shared {
    registry: Mutex<DeviceRegistry>,
    /// Live sessions; lock after `registry` when both are needed
    sessions: Mutex<HashMap<IdentityKey, Arc<SessionCore>>>,
    usb: Option<UsbTransport>,
    ble: Option<BleTransport>,
    events: EventSender,
    policy: TimeoutPolicy,
    next_session: AtomicU64,
}

impl Shared {
    fn apply(&self, events: Vec<RegistryEvent>) -> usize {
        if events.is_empty() {
            return 0;
        }
        lock(&self.registry).apply(events)
    }

    fn connector(&self, transport: TransportKind) -> Option<&Arc<dyn Connector>> {
        match transport {
            TransportKind::Usb => self.usb.as_ref().map(|usb| &usb.connector),
            TransportKind::Ble => self.ble.as_ref().map(|ble| &ble.connector),
        }
    }

    /// Tear down the session of `key`, if any
    fn end_session(&self, key: &IdentityKey) -> bool {
        let session = lock(&self.sessions).remove(key);
        match session {
            Some(core) => {
                core.teardown();
                true
            }
            None => false,
        }
    }

    /// Forget a session its owner released; stale ids are ignored
    fn release_session(&self, key: &IdentityKey, session_id: u64) -> bool {
        let mut sessions = lock(&self.sessions);
        if sessions.get(key).is_some_and(|core| core.id() == session_id) {
            sessions.remove(key);
            true
        } else {
            false
        }
    }

    /// A USB device left: its grant and session belong to the old attachment
    fn usb_detached(&self, key: &IdentityKey) {
        self.end_session(key);
        if let Some(usb) = &self.usb {
            usb.gateway.forget(key);
        }
    }

    fn start_ble_scan(&self) {
        if let Some(ble) = &self.ble
            && let Err(e) = ble.backend.start_scan(&ble.services, self.events.clone())
        {
            warn!("Failed to start BLE scan: {}", e);
        }
    }

    /// Release every OS subscription and resource; idempotent
    fn stop(&self) {
        if let Some(usb) = &self.usb {
            usb.backend.unsubscribe();
            usb.gateway.cancel_all();
        }
        if let Some(ble) = &self.ble {
            ble.backend.stop_scan();
        }

        let sessions: Vec<_> = lock(&self.sessions).drain().map(|(_, core)| core).collect();
        for core in sessions {
            core.teardown();
        }
    }
}

/// Builder for [`DeviceManager`]
pub struct DeviceManagerBuilder {
    config: ManagerConfig,
    usb: Option<(Arc<dyn UsbBackend>, Arc<dyn Connector>)>,
    ble: Option<(Arc<dyn BleBackend>, Arc<dyn Connector>)>,
}

impl DeviceManagerBuilder {
    /// Use `backend` for USB discovery and `connector` for USB sessions
    pub fn with_usb(mut self, backend: Arc<dyn UsbBackend>, connector: Arc<dyn Connector>) -> Self {
        self.usb = Some((backend, connector));
        self
    }

    /// Use `backend` for BLE discovery and `connector` for BLE sessions
    pub fn with_ble(mut self, backend: Arc<dyn BleBackend>, connector: Arc<dyn Connector>) -> Self {
        self.ble = Some((backend, connector));
        self
    }

    /// Subscribe to the OS, run the initial scan and start the event loop
    ///
    /// Subscription and scan failures are logged; the manager still starts
    /// and recovers on the next refresh.
    pub async fn start(self) -> DeviceManager {
        let config = self.config;
        let (events, receiver) = create_event_bridge();

        let usb = self
            .usb
            .filter(|_| config.usb.enabled)
            .map(|(backend, connector)| UsbTransport {
                gateway: PermissionGateway::new(backend.clone()),
                backend,
                connector,
            });
        let ble = self
            .ble
            .filter(|_| config.ble.enabled)
            .map(|(backend, connector)| BleTransport {
                backend,
                connector,
                services: config.ble.service_uuids(),
            });

        let shared = Arc::new(Shared {
            registry: Mutex::new(DeviceRegistry::new()),
            sessions: Mutex::new(HashMap::new()),
            usb,
            ble,
            events: events.clone(),
            policy: TimeoutPolicy::from_settings(&config.timeouts),
            next_session: AtomicU64::new(1),
        });

        let mut event_loop = EventLoop {
            shared: shared.clone(),
            receiver,
            usb_scanner: UsbScanner::new(config.usb.filters.clone()),
            ble_scanner: BleScanner::new(config.ble.service_uuids()),
            batch_limit: config.manager.event_batch_limit.max(1),
        };

        if let Some(usb) = &shared.usb {
            if let Err(e) = usb.backend.subscribe(events.clone()) {
                warn!("Failed to subscribe to USB notifications: {}", e);
            }
            let mut initial = Vec::new();
            event_loop.rescan(&mut initial).await;
            shared.apply(initial);
        }
        shared.start_ble_scan();

        info!(
            "Device manager started (usb: {}, ble: {}, {} devices)",
            shared.usb.is_some(),
            shared.ble.is_some(),
            lock(&shared.registry).len()
        );

        let handle = tokio::spawn(event_loop.run());
        DeviceManager {
            shared,
            event_loop: Some(handle),
        }
    }
}

/// Owns the device registry and every transport subscription
pub struct DeviceManager {
    shared: Arc<Shared>,
    event_loop: Option<JoinHandle<()>>,
}

impl DeviceManager {
    pub fn builder(config: ManagerConfig) -> DeviceManagerBuilder {
        DeviceManagerBuilder {
            config,
            usb: None,
            ble: None,
        }
    }

    /// Rescan USB and reseed the BLE advertisement set
    ///
    /// Returns once the resulting batch has been applied; effects are
    /// observed through the registry.
    pub async fn refresh_devices(&self) {
        let (done, applied) = oneshot::channel();
        if self
            .shared
            .events
            .send(ManagerEvent::Refresh { done: Some(done) })
            .await
            .is_err()
        {
            warn!("Refresh requested after shutdown");
            return;
        }
        let _ = applied.await;
    }

    /// Request access to a device
    ///
    /// Exactly one of the continuations runs, possibly before this returns.
    /// USB devices go through the OS permission prompt; BLE devices need no
    /// explicit grant.
    pub fn request_permission<G, D>(
        &self,
        key: &IdentityKey,
        on_granted: G,
        on_denied: D,
    ) -> Result<(), DeviceError>
    where
        G: FnOnce() + Send + 'static,
        D: FnOnce(DenialReason) + Send + 'static,
    {
        let device = self
            .device(key)
            .ok_or_else(|| DeviceError::UnknownDevice(key.clone()))?;

        if device.state == ConnectionState::Offline {
            return Err(DeviceError::NotConnectable {
                key: key.clone(),
                state: device.state,
            });
        }

        match (device.transport(), device.usb_endpoint(), &self.shared.usb) {
            (TransportKind::Ble, _, _) => {
                on_granted();
                Ok(())
            }
            (TransportKind::Usb, Some(endpoint), Some(usb)) => {
                let immediate =
                    usb.gateway
                        .request_permission(&endpoint, Box::new(on_granted), Box::new(on_denied));
                if let Some(resolution) = immediate {
                    self.shared
                        .apply(vec![RegistryEvent::PermissionGranted(key.clone())]);
                    resolution.complete();
                }
                Ok(())
            }
            _ => Err(DeviceError::UnknownDevice(key.clone())),
        }
    }

    /// Request access and wait for the outcome
    pub async fn authorize(&self, key: &IdentityKey) -> Result<(), DeviceError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let denied_tx = tx.clone();

        self.request_permission(
            key,
            move || {
                if let Some(tx) = lock(&tx).take() {
                    let _ = tx.send(Ok(()));
                }
            },
            move |reason| {
                if let Some(tx) = lock(&denied_tx).take() {
                    let _ = tx.send(Err(DeviceError::PermissionDenied { reason }));
                }
            },
        )?;

        rx.await.unwrap_or(Err(DeviceError::PermissionDenied {
            reason: DenialReason::Cancelled,
        }))
    }

    /// Open a session to an `Authorized` or `Disconnected` device
    pub async fn connect(&self, key: &IdentityKey) -> Result<ConnectionSession, DeviceError> {
        let (device, previous) = {
            let mut registry = lock(&self.shared.registry);
            let device = registry
                .get(key)
                .cloned()
                .ok_or_else(|| DeviceError::UnknownDevice(key.clone()))?;

            if device.state.is_live() || lock(&self.shared.sessions).contains_key(key) {
                return Err(DeviceError::SessionActive(key.clone()));
            }
            if !device.state.is_connectable() {
                return Err(DeviceError::NotConnectable {
                    key: key.clone(),
                    state: device.state,
                });
            }
            (
                registry.transition(key, ConnectionState::Connecting)?,
                device.state,
            )
        };

        let Some(connector) = self.shared.connector(device.transport()) else {
            self.revert_connecting(key, previous);
            return Err(DeviceError::UnknownDevice(key.clone()));
        };

        info!("Connecting to {} ({})", device.label, key);
        let channel = match connector.open(&device).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to open {}: {}", key, e);
                self.revert_connecting(key, previous);
                return Err(DeviceError::TransportLost(e.to_string()));
            }
        };

        let mut registry = lock(&self.shared.registry);
        if registry.get(key).map(|device| device.state) != Some(ConnectionState::Connecting) {
            // Lost or removed while the channel was opening
            drop(channel);
            return Err(DeviceError::TransportLost(format!(
                "{} went away while connecting",
                key
            )));
        }
        registry.transition(key, ConnectionState::Connected)?;

        let session = ConnectionSession::new(
            self.shared.next_session.fetch_add(1, Ordering::Relaxed),
            key.clone(),
            channel,
            self.shared.policy,
            Some(self.shared.events.clone()),
        );
        lock(&self.shared.sessions).insert(key.clone(), session.core());
        info!("Connected to {} (session {})", key, session.id());
        Ok(session)
    }

    fn revert_connecting(&self, key: &IdentityKey, previous: ConnectionState) {
        let mut registry = lock(&self.shared.registry);
        if registry.get(key).map(|device| device.state) == Some(ConnectionState::Connecting) {
            let _ = registry.transition(key, previous);
        }
    }

    /// Tear down the live session of a device
    ///
    /// The device moves to `Disconnected`. A device without a session is left
    /// unchanged.
    pub fn disconnect(&self, key: &IdentityKey) -> Result<(), DeviceError> {
        if self.device(key).is_none() {
            return Err(DeviceError::UnknownDevice(key.clone()));
        }
        if self.shared.end_session(key) {
            self.shared
                .apply(vec![RegistryEvent::SessionEnded(key.clone())]);
        }
        Ok(())
    }

    /// Unregister a device, ending its session and any pending permission request
    pub fn remove(&self, key: &IdentityKey) -> Result<LogicalDevice, DeviceError> {
        self.shared.end_session(key);
        if let Some(usb) = &self.shared.usb {
            usb.gateway.forget(key);
        }
        lock(&self.shared.registry).remove(key)
    }

    /// Subscribe to registry snapshots, one per completed batch
    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        lock(&self.shared.registry).subscribe()
    }

    /// Latest registry snapshot
    pub fn devices(&self) -> RegistrySnapshot {
        lock(&self.shared.registry).snapshot()
    }

    pub fn device(&self, key: &IdentityKey) -> Option<LogicalDevice> {
        lock(&self.shared.registry).get(key).cloned()
    }

    /// Deregister from the OS, stop the event loop and close every session
    ///
    /// Pending permission requests resolve as `Cancelled`.
    pub async fn shutdown(mut self) {
        self.shared.stop();
        let _ = self.shared.events.send(ManagerEvent::Shutdown).await;
        if let Some(handle) = self.event_loop.take()
            && let Err(e) = handle.await
        {
            warn!("Device manager event loop failed: {}", e);
        }
        info!("Device manager stopped");
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        if self.event_loop.take().is_some() {
            self.shared.stop();
            let _ = self.shared.events.post(ManagerEvent::Shutdown);
        }
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("usb", &self.shared.usb.is_some())
            .field("ble", &self.shared.ble.is_some())
            .field("devices", &self.devices().len())
            .finish()
    }
}

/// Single writer for OS-driven reconciliation
struct EventLoop {
    shared: Arc<Shared>,
    receiver: EventReceiver,
    usb_scanner: UsbScanner,
    ble_scanner: BleScanner,
    batch_limit: usize,
}

impl EventLoop {
    async fn run(mut self) {
        debug!("Device manager event loop started");

        while let Ok(first) = self.receiver.recv().await {
            let mut batch = vec![first];
            while batch.len() < self.batch_limit {
                match self.receiver.try_recv() {
                    Some(event) => batch.push(event),
                    None => break,
                }
            }

            if !self.process(batch).await {
                break;
            }
        }

        debug!("Device manager event loop exited");
    }

    /// Reconcile one batch; returns false on shutdown
    async fn process(&mut self, batch: Vec<ManagerEvent>) -> bool {
        let mut events = Vec::new();
        let mut resolutions: Vec<Resolution> = Vec::new();
        let mut acks = Vec::new();
        let mut scanned = false;
        let mut running = true;

        for event in batch {
            match event {
                // One scan observes every change queued so far
                ManagerEvent::UsbAttached { .. } | ManagerEvent::UsbDetached { .. } => {
                    if !scanned {
                        self.rescan(&mut events).await;
                        scanned = true;
                    }
                }
                ManagerEvent::PermissionResult {
                    endpoint,
                    token,
                    granted,
                } => {
                    let Some(usb) = &self.shared.usb else {
                        continue;
                    };
                    for resolution in usb.gateway.resolve(endpoint.as_ref(), token, granted) {
                        if resolution.is_granted() {
                            events.push(RegistryEvent::PermissionGranted(resolution.key().clone()));
                        }
                        resolutions.push(resolution);
                    }
                }
                ManagerEvent::Advertisement(advertisement) => {
                    if let Some(key) = self.ble_scanner.observe(&advertisement) {
                        events.push(RegistryEvent::Advertised { key, advertisement });
                    }
                }
                ManagerEvent::BondStateChanged { address, bonded } => {
                    events.push(RegistryEvent::BondStateChanged { address, bonded });
                }
                ManagerEvent::SessionReleased { key, session_id } => {
                    if self.shared.release_session(&key, session_id) {
                        events.push(RegistryEvent::SessionEnded(key));
                    }
                }
                ManagerEvent::Refresh { done } => {
                    if self.shared.ble.is_some() {
                        events.push(RegistryEvent::BleCleared);
                        self.ble_scanner.clear();
                        if let Some(ble) = &self.shared.ble {
                            ble.backend.stop_scan();
                        }
                        self.shared.start_ble_scan();
                    }
                    if !scanned {
                        self.rescan(&mut events).await;
                        scanned = true;
                    }
                    acks.extend(done);
                }
                ManagerEvent::Shutdown => {
                    running = false;
                    break;
                }
            }
        }

        let changed = self.shared.apply(events);
        if changed > 0 {
            debug!("Applied batch with {} registry changes", changed);
        }

        for resolution in resolutions {
            resolution.complete();
        }
        for ack in acks {
            let _ = ack.send(());
        }
        running
    }

    /// Enumerate USB and append the diff as registry events
    ///
    /// Detaches come before attaches. A failed enumeration adds nothing.
    async fn rescan(&mut self, events: &mut Vec<RegistryEvent>) {
        let Some(usb) = &self.shared.usb else {
            return;
        };

        let backend = usb.backend.clone();
        let endpoints = match tokio::task::spawn_blocking(move || backend.enumerate()).await {
            Ok(Ok(endpoints)) => endpoints,
            Ok(Err(e)) => {
                warn!("USB enumeration failed, keeping previous device set: {}", e);
                return;
            }
            Err(e) => {
                warn!("USB enumeration task failed: {}", e);
                return;
            }
        };

        let diff = self.usb_scanner.diff(endpoints);
        for key in &diff.detached {
            self.shared.usb_detached(key);
        }
        events.extend(diff.detached.into_iter().map(RegistryEvent::UsbDetached));
        events.extend(diff.attached.into_iter().map(RegistryEvent::UsbAttached));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        JADE_BLE_SERVICE, MockBleBackend, MockConnector, MockResponder, MockUsbBackend,
        create_mock_advertisement, create_mock_usb_endpoint,
    };

    #[tokio::test]
    async fn test_initial_scan_populates_registry() {
        let usb = Arc::new(MockUsbBackend::new());
        usb.plug(create_mock_usb_endpoint(4, 0x10c4, 0xea60, Some("JADE01")));

        let manager = DeviceManager::builder(ManagerConfig::default())
            .with_usb(usb.clone(), Arc::new(MockConnector::new(MockResponder::Echo)))
            .start()
            .await;

        assert!(usb.is_subscribed());
        assert_eq!(manager.devices().len(), 1);
        assert_eq!(
            manager.devices().devices()[0].state,
            ConnectionState::Discovered
        );

        manager.shutdown().await;
        assert!(!usb.is_subscribed());
    }

    #[tokio::test]
    async fn test_disabled_transport_is_not_started() {
        let mut config = ManagerConfig::default();
        config.ble.enabled = false;
        let ble = Arc::new(MockBleBackend::new());

        let manager = DeviceManager::builder(config)
            .with_ble(ble.clone(), Arc::new(MockConnector::new(MockResponder::Echo)))
            .start()
            .await;

        assert_eq!(ble.scan_count(), 0);
        assert!(!ble.advertise(create_mock_advertisement(
            "aa:bb:cc:dd:ee:ff",
            JADE_BLE_SERVICE
        )));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let manager = DeviceManager::builder(ManagerConfig::default())
            .start()
            .await;
        let key = create_mock_usb_endpoint(4, 0x10c4, 0xea60, None).identity_key();

        assert!(matches!(
            manager.connect(&key).await,
            Err(DeviceError::UnknownDevice(_))
        ));
        assert!(matches!(
            manager.request_permission(&key, || {}, |_| {}),
            Err(DeviceError::UnknownDevice(_))
        ));
        assert!(matches!(
            manager.disconnect(&key),
            Err(DeviceError::UnknownDevice(_))
        ));
        manager.shutdown().await;
    }
}
