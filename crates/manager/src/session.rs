//! Connection sessions
//!
//! A [`ConnectionSession`] owns the live channel to one connected device and
//! runs one request/response exchange at a time. Requests travel in framed
//! envelopes tagged with a fresh [`RequestId`]; replies carrying any other id
//! are late answers to an earlier, timed-out request and are discarded.
//!
//! # Timeouts
//!
//! Each exchange is bounded by the budget of its [`TimeoutClass`]. A timeout
//! leaves the session open in the [`SessionHealth::Indeterminate`] state: the
//! device may still be working on the request, and the caller decides whether
//! to retry or tear down. `TimeoutClass::None` waits until a reply arrives or
//! the session is torn down through a [`SessionCancelHandle`], `disconnect`, or
//! loss of the device.

use crate::lock;
use crate::timeout::TimeoutPolicy;
use common::{DeviceChannel, EventSender, ManagerEvent};
use protocol::{DeviceError, Envelope, FrameDecoder, IdentityKey, RequestId, TimeoutClass};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Observable condition of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionHealth {
    /// Idle and usable
    Ready,
    /// A request is in flight
    Busy,
    /// The last request timed out; device state unknown
    Indeterminate,
    /// Torn down; every further request fails
    Closed,
}

struct Link {
    channel: Box<dyn DeviceChannel>,
    decoder: FrameDecoder,
}

/// State shared between a session, its cancel handles and the manager
pub(crate) struct SessionCore {
    id: u64,
    key: IdentityKey,
    policy: TimeoutPolicy,
    link: tokio::sync::Mutex<Option<Link>>,
    in_flight: AtomicBool,
    indeterminate: AtomicBool,
    closed: watch::Sender<bool>,
    next_request: AtomicU64,
    /// Set once the manager has been told the session ended
    released: Mutex<Option<EventSender>>,
}

impl SessionCore {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Close the session and drop the channel if no exchange holds it
    ///
    /// An exchange in progress observes the close signal and drops the
    /// channel itself.
    pub(crate) fn teardown(&self) {
        let was_closed = self.closed.send_replace(true);
        if let Ok(mut link) = self.link.try_lock() {
            link.take();
        }
        if !was_closed {
            info!("Session {} for {} closed", self.id, self.key);
        }
    }

    /// Tell the manager the session is gone, at most once
    fn notify_released(&self) {
        if let Some(events) = lock(&self.released).take() {
            let _ = events.post(ManagerEvent::SessionReleased {
                key: self.key.clone(),
                session_id: self.id,
            });
        }
    }

    fn health(&self) -> SessionHealth {
        if self.is_closed() {
            SessionHealth::Closed
        } else if self.in_flight.load(Ordering::Acquire) {
            SessionHealth::Busy
        } else if self.indeterminate.load(Ordering::Acquire) {
            SessionHealth::Indeterminate
        } else {
            SessionHealth::Ready
        }
    }

    async fn exchange(&self, request: &[u8], class: TimeoutClass) -> Result<Vec<u8>, DeviceError> {
        let id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        let frame = protocol::encode_framed(&Envelope::new(id, request.to_vec()))
            .map_err(|e| DeviceError::InvalidRequest(e.to_string()))?;

        let mut guard = self.link.lock().await;
        let Some(link) = guard.as_mut() else {
            return Err(DeviceError::TransportLost("session closed".to_string()));
        };

        let mut closed = self.closed.subscribe();
        let close_signal = async move {
            let _ = closed.wait_for(|closed| *closed).await;
        };

        let round_trip = async {
            link.channel.write(&frame).await.map_err(transport_lost)?;
            loop {
                while let Some(envelope) = link.decoder.next_envelope().map_err(transport_lost)? {
                    if envelope.id == id {
                        return Ok(envelope.payload);
                    }
                    debug!(
                        "Session {}: discarding stale reply {:?} (waiting for {:?})",
                        self.id, envelope.id, id
                    );
                }
                let chunk = link.channel.read().await.map_err(transport_lost)?;
                link.decoder.push(&chunk);
            }
        };

        let bounded = async {
            match self.policy.budget(class) {
                Some(budget) => tokio::time::timeout(budget, round_trip)
                    .await
                    .unwrap_or(Err(DeviceError::Timeout { class, budget })),
                None => round_trip.await,
            }
        };

        let result = tokio::select! {
            result = bounded => result,
            _ = close_signal => Err(DeviceError::TransportLost("session closed".to_string())),
        };

        if matches!(result, Err(DeviceError::TransportLost(_))) {
            guard.take();
            self.closed.send_replace(true);
        }
        result
    }
}

fn transport_lost(e: impl fmt::Display) -> DeviceError {
    DeviceError::TransportLost(e.to_string())
}

/// Clears the in-flight flag even if the exchange future is dropped
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Live session to one connected device
///
/// Dropping the session releases the channel and moves the device to
/// `Disconnected`.
pub struct ConnectionSession {
    core: Arc<SessionCore>,
}

impl ConnectionSession {
    /// Wrap an open channel
    ///
    /// `release` receives a `SessionReleased` event when the session ends.
    pub fn new(
        id: u64,
        key: IdentityKey,
        channel: Box<dyn DeviceChannel>,
        policy: TimeoutPolicy,
        release: Option<EventSender>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            core: Arc::new(SessionCore {
                id,
                key,
                policy,
                link: tokio::sync::Mutex::new(Some(Link {
                    channel,
                    decoder: FrameDecoder::new(),
                })),
                in_flight: AtomicBool::new(false),
                indeterminate: AtomicBool::new(false),
                closed,
                next_request: AtomicU64::new(1),
                released: Mutex::new(release),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn key(&self) -> &IdentityKey {
        &self.core.key
    }

    pub fn health(&self) -> SessionHealth {
        self.core.health()
    }

    /// Send a request and wait for its reply within the class budget
    ///
    /// Fails with `DuplicateRequest`, leaving the outstanding exchange
    /// untouched, when another request is still in flight.
    pub async fn send(&self, request: &[u8], class: TimeoutClass) -> Result<Vec<u8>, DeviceError> {
        if self.core.is_closed() {
            return Err(DeviceError::TransportLost("session closed".to_string()));
        }
        if self
            .core
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DeviceError::DuplicateRequest);
        }
        let _in_flight = InFlight(&self.core.in_flight);

        let result = self.core.exchange(request, class).await;
        match &result {
            Ok(_) => self.core.indeterminate.store(false, Ordering::Release),
            Err(DeviceError::Timeout { budget, .. }) => {
                warn!(
                    "Session {} for {}: no {} reply within {:?}",
                    self.core.id, self.core.key, class, budget
                );
                self.core.indeterminate.store(true, Ordering::Release);
            }
            Err(DeviceError::TransportLost(reason)) => {
                warn!(
                    "Session {} for {} lost: {}",
                    self.core.id, self.core.key, reason
                );
                self.core.notify_released();
            }
            Err(_) => {}
        }
        result
    }

    /// Handle that tears the session down from another task
    pub fn cancel_handle(&self) -> SessionCancelHandle {
        SessionCancelHandle {
            core: self.core.clone(),
        }
    }

    /// Close the channel gracefully
    pub async fn close(self) {
        {
            let mut link = self.core.link.lock().await;
            if let Some(mut link) = link.take() {
                link.channel.close().await;
            }
        }
        // Drop finishes the teardown and notifies the manager
    }

    pub(crate) fn core(&self) -> Arc<SessionCore> {
        self.core.clone()
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.core.teardown();
        self.core.notify_released();
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.core.id)
            .field("key", &self.core.key)
            .field("health", &self.health())
            .finish()
    }
}

/// Tears a session down without owning it
#[derive(Clone)]
pub struct SessionCancelHandle {
    core: Arc<SessionCore>,
}

impl SessionCancelHandle {
    /// Abort any outstanding request and close the session
    pub fn cancel(&self) {
        self.core.teardown();
        self.core.notify_released();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

impl fmt::Debug for SessionCancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCancelHandle")
            .field("id", &self.core.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_event_bridge;
    use common::test_utils::{MockChannel, MockChannelHandle, MockResponder};
    use std::time::Duration;

    fn session(responder: MockResponder) -> (ConnectionSession, MockChannelHandle) {
        let (channel, handle) = MockChannel::new(responder);
        let key = IdentityKey::Usb {
            vendor_id: 0x10c4,
            product_id: 0xea60,
            serial_number: Some("JADE01".to_string()),
        };
        let session =
            ConnectionSession::new(1, key, Box::new(channel), TimeoutPolicy::default(), None);
        (session, handle)
    }

    #[tokio::test]
    async fn test_send_returns_reply() {
        let (session, handle) = session(MockResponder::Echo);

        let reply = session
            .send(b"get_version_info", TimeoutClass::Autonomous)
            .await
            .unwrap();
        assert_eq!(reply, b"get_version_info");
        assert_eq!(handle.written().len(), 1);
        assert_eq!(session.health(), SessionHealth::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_interaction_timeout_leaves_session_open() {
        let (session, handle) = session(MockResponder::Silent);

        let started = tokio::time::Instant::now();
        let err = session
            .send(b"sign_tx", TimeoutClass::UserInteraction)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DeviceError::Timeout {
                class: TimeoutClass::UserInteraction,
                budget: Duration::from_secs(120),
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert!(!err.is_retryable());
        assert_eq!(session.health(), SessionHealth::Indeterminate);
        assert!(!handle.is_released());

        // A late reply to the timed-out request is skipped
        let stale = handle.written()[0].id;
        handle.reply(stale, b"late");
        let next = tokio::spawn({
            let handle = handle.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let id = handle.written()[1].id;
                handle.reply(id, b"fresh");
            }
        });
        let reply = session.send(b"ping", TimeoutClass::Autonomous).await.unwrap();
        next.await.unwrap();
        assert_eq!(reply, b"fresh");
        assert_eq!(session.health(), SessionHealth::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_send_rejected_without_side_effects() {
        let (session, handle) = session(MockResponder::Silent);
        let session = Arc::new(session);

        let outstanding = tokio::spawn({
            let session = session.clone();
            async move { session.send(b"first", TimeoutClass::UserInteraction).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.health(), SessionHealth::Busy);

        let err = session
            .send(b"second", TimeoutClass::Autonomous)
            .await
            .unwrap_err();
        assert_eq!(err, DeviceError::DuplicateRequest);
        assert_eq!(handle.written().len(), 1);
        assert_eq!(session.health(), SessionHealth::Busy);

        let id = handle.written()[0].id;
        handle.reply(id, b"done");
        assert_eq!(outstanding.await.unwrap().unwrap(), b"done");
    }

    #[tokio::test]
    async fn test_unbounded_send_cancelled_by_teardown() {
        let (session, handle) = session(MockResponder::Silent);
        let cancel = session.cancel_handle();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = session.send(b"get_mnemonic", TimeoutClass::None).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, DeviceError::TransportLost(_)));
        assert_eq!(session.health(), SessionHealth::Closed);
        assert!(handle.is_released());
    }

    #[tokio::test]
    async fn test_disconnect_mid_exchange_is_transport_lost() {
        let (tx, rx) = create_event_bridge();
        let (channel, handle) = MockChannel::new(MockResponder::Silent);
        let key = IdentityKey::Ble {
            service: common::test_utils::JADE_BLE_SERVICE,
            address: "AA:BB:CC:DD:EE:FF".to_string(),
        };
        let session = ConnectionSession::new(
            7,
            key,
            Box::new(channel),
            TimeoutPolicy::default(),
            Some(tx),
        );

        handle.disconnect();
        let err = session.send(b"ping", TimeoutClass::Autonomous).await.unwrap_err();
        assert!(matches!(err, DeviceError::TransportLost(_)));
        assert!(handle.is_released());
        assert!(matches!(
            rx.try_recv(),
            Some(ManagerEvent::SessionReleased { session_id: 7, .. })
        ));

        // Released exactly once
        drop(session);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_close_releases_channel() {
        let (session, handle) = session(MockResponder::Echo);
        session.close().await;
        assert!(handle.is_closed());
        assert!(handle.is_released());
    }
}
