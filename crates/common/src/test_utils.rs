//! Test utilities for hw-devmgr
//!
//! Provides endpoint builders and mock backends that let tests script OS
//! behaviour: plugging and unplugging USB devices, answering permission
//! prompts, emitting BLE advertisements, and driving device channels.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockUsbBackend, create_mock_usb_endpoint};
//! use common::backend::UsbBackend;
//!
//! let backend = MockUsbBackend::new();
//! backend.plug(create_mock_usb_endpoint(4, 0x10c4, 0xea60, Some("JADE01")));
//! assert_eq!(backend.enumerate().unwrap().len(), 1);
//! ```

use crate::backend::{BleBackend, Connector, DeviceChannel, UsbBackend};
use crate::channel::{EventSender, ManagerEvent};
use async_trait::async_trait;
use protocol::{
    BleAdvertisement, CorrelationToken, Envelope, IdentityKey, LogicalDevice, RequestId,
    UsbEndpoint, decode_framed, encode_framed,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Jade BLE service
pub const JADE_BLE_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Ledger BLE service
pub const LEDGER_BLE_SERVICE: Uuid = Uuid::from_u128(0x13d63400_2c97_0004_0000_4c6564676572);

/// Battery service; never on an allow-list
pub const UNSUPPORTED_BLE_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a mock USB endpoint on bus 1
///
/// # Example
/// ```
/// use common::test_utils::create_mock_usb_endpoint;
///
/// let endpoint = create_mock_usb_endpoint(7, 0x2c97, 0x4011, None);
/// assert_eq!(endpoint.location(), (1, 7));
/// assert_eq!(endpoint.serial_number, None);
/// ```
pub fn create_mock_usb_endpoint(
    device_address: u8,
    vendor_id: u16,
    product_id: u16,
    serial_number: Option<&str>,
) -> UsbEndpoint {
    UsbEndpoint {
        bus_number: 1,
        device_address,
        vendor_id,
        product_id,
        class: 0x00,
        serial_number: serial_number.map(str::to_string),
        manufacturer: Some(format!("Test Manufacturer {:04x}", vendor_id)),
        product: Some(format!("Test Wallet {:04x}:{:04x}", vendor_id, product_id)),
    }
}

/// Create a mock BLE advertisement for a single service
pub fn create_mock_advertisement(address: &str, service: Uuid) -> BleAdvertisement {
    BleAdvertisement {
        address: address.to_string(),
        name: Some(format!("Wallet {}", address)),
        service_uuids: vec![service],
        bonded: None,
    }
}

/// Timeout wrapper for async tests
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

// ============================================================================
// USB
// ============================================================================

/// Scriptable USB backend
#[derive(Debug, Default)]
pub struct MockUsbBackend {
    endpoints: Mutex<Vec<UsbEndpoint>>,
    accessible: Mutex<HashSet<IdentityKey>>,
    prompts: Mutex<Vec<(IdentityKey, CorrelationToken)>>,
    events: Mutex<Option<EventSender>>,
    fail_enumeration: AtomicBool,
    fail_prompts: AtomicBool,
    enumerations: AtomicUsize,
}

impl MockUsbBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint and notify the subscriber, if any
    pub fn plug(&self, endpoint: UsbEndpoint) {
        let location = endpoint.location();
        lock(&self.endpoints).push(endpoint);
        self.post(ManagerEvent::UsbAttached {
            bus_number: Some(location.0),
            device_address: Some(location.1),
        });
    }

    /// Detach every endpoint with `key` and notify the subscriber, if any
    pub fn unplug(&self, key: &IdentityKey) {
        lock(&self.endpoints).retain(|endpoint| endpoint.identity_key() != *key);
        lock(&self.accessible).remove(key);
        self.post(ManagerEvent::UsbDetached {
            bus_number: None,
            device_address: None,
        });
    }

    /// Mark an endpoint as accessible without a prompt
    pub fn set_accessible(&self, key: &IdentityKey, accessible: bool) {
        let mut set = lock(&self.accessible);
        if accessible {
            set.insert(key.clone());
        } else {
            set.remove(key);
        }
    }

    /// Prompts issued so far
    pub fn prompts(&self) -> Vec<(IdentityKey, CorrelationToken)> {
        lock(&self.prompts).clone()
    }

    /// Answer the latest prompt for `key` as the OS would
    pub fn answer_prompt(&self, key: &IdentityKey, granted: bool) {
        let token = lock(&self.prompts)
            .iter()
            .rev()
            .find(|(prompted, _)| prompted == key)
            .map(|(_, token)| *token);

        if granted {
            self.set_accessible(key, true);
        }
        self.post(ManagerEvent::PermissionResult {
            endpoint: Some(key.clone()),
            token,
            granted,
        });
    }

    /// Make subsequent enumerations fail
    pub fn set_enumeration_failure(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent prompts fail to be issued
    pub fn set_prompt_failure(&self, fail: bool) {
        self.fail_prompts.store(fail, Ordering::SeqCst);
    }

    /// Number of enumerations performed
    pub fn enumeration_count(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.events).is_some()
    }

    /// Post a raw event to the subscriber; returns false when unsubscribed
    pub fn post(&self, event: ManagerEvent) -> bool {
        match lock(&self.events).as_ref() {
            Some(events) => events.post(event).is_ok(),
            None => false,
        }
    }
}

impl UsbBackend for MockUsbBackend {
    fn enumerate(&self) -> crate::Result<Vec<UsbEndpoint>> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(crate::Error::Usb("enumeration failed".to_string()));
        }
        Ok(lock(&self.endpoints).clone())
    }

    fn has_permission(&self, endpoint: &UsbEndpoint) -> bool {
        lock(&self.accessible).contains(&endpoint.identity_key())
    }

    fn request_permission(
        &self,
        endpoint: &UsbEndpoint,
        token: CorrelationToken,
    ) -> crate::Result<()> {
        if self.fail_prompts.load(Ordering::SeqCst) {
            return Err(crate::Error::Usb("prompt unavailable".to_string()));
        }
        lock(&self.prompts).push((endpoint.identity_key(), token));
        Ok(())
    }

    fn subscribe(&self, events: EventSender) -> crate::Result<()> {
        *lock(&self.events) = Some(events);
        Ok(())
    }

    fn unsubscribe(&self) {
        lock(&self.events).take();
    }
}

// ============================================================================
// BLE
// ============================================================================

/// Scriptable BLE backend
#[derive(Debug, Default)]
pub struct MockBleBackend {
    events: Mutex<Option<EventSender>>,
    services: Mutex<Vec<Uuid>>,
    scans: AtomicUsize,
    stops: AtomicUsize,
}

impl MockBleBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an advertisement; returns false when not scanning
    pub fn advertise(&self, advertisement: BleAdvertisement) -> bool {
        self.post(ManagerEvent::Advertisement(advertisement))
    }

    /// Deliver a bond-state change; returns false when not scanning
    pub fn set_bonded(&self, address: &str, bonded: bool) -> bool {
        self.post(ManagerEvent::BondStateChanged {
            address: address.to_string(),
            bonded,
        })
    }

    /// Services passed to the latest scan
    pub fn services(&self) -> Vec<Uuid> {
        lock(&self.services).clone()
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.events).is_some()
    }

    fn post(&self, event: ManagerEvent) -> bool {
        match lock(&self.events).as_ref() {
            Some(events) => events.post(event).is_ok(),
            None => false,
        }
    }
}

impl BleBackend for MockBleBackend {
    fn start_scan(&self, services: &[Uuid], events: EventSender) -> crate::Result<()> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        *lock(&self.services) = services.to_vec();
        *lock(&self.events) = Some(events);
        Ok(())
    }

    fn stop_scan(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        lock(&self.events).take();
    }
}

// ============================================================================
// Device channels
// ============================================================================

/// How a mock device answers requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockResponder {
    /// Reply to every request with its own payload
    Echo,
    /// Never reply on its own; tests answer through the handle
    Silent,
}

#[derive(Debug)]
struct MockChannelState {
    inbox: async_channel::Sender<Vec<u8>>,
    written: Mutex<Vec<Envelope>>,
    fail_writes: AtomicBool,
    closed: AtomicBool,
    released: AtomicBool,
}

/// In-memory device channel
#[derive(Debug)]
pub struct MockChannel {
    inbox: async_channel::Receiver<Vec<u8>>,
    state: Arc<MockChannelState>,
    responder: MockResponder,
}

/// Test-side handle to a [`MockChannel`]
#[derive(Debug, Clone)]
pub struct MockChannelHandle {
    state: Arc<MockChannelState>,
}

impl MockChannel {
    pub fn new(responder: MockResponder) -> (Self, MockChannelHandle) {
        let (tx, rx) = async_channel::unbounded();
        let state = Arc::new(MockChannelState {
            inbox: tx,
            written: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
        });

        (
            Self {
                inbox: rx,
                state: state.clone(),
                responder,
            },
            MockChannelHandle { state },
        )
    }
}

#[async_trait]
impl DeviceChannel for MockChannel {
    async fn write(&mut self, frame: &[u8]) -> crate::Result<()> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(crate::Error::Transport("write failed".to_string()));
        }

        let envelope =
            decode_framed(frame).map_err(|e| crate::Error::Transport(e.to_string()))?;
        lock(&self.state.written).push(envelope.clone());

        if self.responder == MockResponder::Echo {
            let reply = encode_framed(&Envelope::new(envelope.id, envelope.payload))
                .map_err(|e| crate::Error::Transport(e.to_string()))?;
            let _ = self.state.inbox.try_send(reply);
        }
        Ok(())
    }

    async fn read(&mut self) -> crate::Result<Vec<u8>> {
        self.inbox
            .recv()
            .await
            .map_err(|_| crate::Error::Transport("channel disconnected".to_string()))
    }

    async fn close(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.inbox.close();
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        self.state.released.store(true, Ordering::SeqCst);
    }
}

impl MockChannelHandle {
    /// Requests written by the session so far
    pub fn written(&self) -> Vec<Envelope> {
        lock(&self.state.written).clone()
    }

    /// Reply to `id` with `payload`
    pub fn reply(&self, id: RequestId, payload: &[u8]) {
        if let Ok(frame) = encode_framed(&Envelope::new(id, payload.to_vec())) {
            self.inject(frame);
        }
    }

    /// Deliver raw bytes to the reader
    pub fn inject(&self, bytes: Vec<u8>) {
        let _ = self.state.inbox.try_send(bytes);
    }

    /// Simulate the device dropping off mid-exchange
    pub fn disconnect(&self) {
        self.state.inbox.close();
    }

    pub fn fail_writes(&self) {
        self.state.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Whether the channel was dropped
    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::SeqCst)
    }
}

/// Connector producing [`MockChannel`]s
#[derive(Debug)]
pub struct MockConnector {
    responder: MockResponder,
    fail: AtomicBool,
    opened: Mutex<Vec<MockChannelHandle>>,
}

impl MockConnector {
    pub fn new(responder: MockResponder) -> Self {
        Self {
            responder,
            fail: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Make subsequent opens fail
    pub fn set_failure(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        lock(&self.opened).len()
    }

    /// Handle to the most recently opened channel
    pub fn last_channel(&self) -> Option<MockChannelHandle> {
        lock(&self.opened).last().cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, device: &LogicalDevice) -> crate::Result<Box<dyn DeviceChannel>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(crate::Error::Transport(format!(
                "failed to open {}",
                device.key
            )));
        }

        let (channel, handle) = MockChannel::new(self.responder);
        lock(&self.opened).push(handle);
        Ok(Box::new(channel))
    }
}
