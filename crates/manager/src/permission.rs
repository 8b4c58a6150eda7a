//! USB permission gateway
//!
//! Tracks at most one outstanding OS permission prompt per identity key. Each
//! prompt is a [`PendingPermissionRequest`] owning exactly two continuations,
//! one of which runs exactly once: on grant, on denial, when superseded by a
//! newer request, or when the record is dropped unresolved.
//!
//! Continuations never run while the gateway lock is held, so they may call
//! back into the manager.

use crate::lock;
use common::UsbBackend;
use protocol::{CorrelationToken, DenialReason, IdentityKey, UsbEndpoint};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Continuation run when access is granted
pub type GrantedFn = Box<dyn FnOnce() + Send + 'static>;

/// Continuation run when access is not granted
pub type DeniedFn = Box<dyn FnOnce(DenialReason) + Send + 'static>;

/// An in-flight OS permission request for one endpoint
pub struct PendingPermissionRequest {
    endpoint: UsbEndpoint,
    key: IdentityKey,
    token: CorrelationToken,
    on_granted: Option<GrantedFn>,
    on_denied: Option<DeniedFn>,
}

impl PendingPermissionRequest {
    pub fn new(
        endpoint: UsbEndpoint,
        token: CorrelationToken,
        on_granted: GrantedFn,
        on_denied: DeniedFn,
    ) -> Self {
        Self {
            key: endpoint.identity_key(),
            endpoint,
            token,
            on_granted: Some(on_granted),
            on_denied: Some(on_denied),
        }
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn endpoint(&self) -> &UsbEndpoint {
        &self.endpoint
    }

    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    /// Run the success continuation
    pub fn grant(mut self) {
        self.on_denied = None;
        if let Some(on_granted) = self.on_granted.take() {
            on_granted();
        }
    }

    /// Run the failure continuation
    pub fn deny(mut self, reason: DenialReason) {
        self.on_granted = None;
        if let Some(on_denied) = self.on_denied.take() {
            on_denied(reason);
        }
    }
}

impl Drop for PendingPermissionRequest {
    fn drop(&mut self) {
        if let Some(on_denied) = self.on_denied.take() {
            self.on_granted = None;
            debug!("Permission request {:?} for {} dropped", self.token, self.key);
            on_denied(DenialReason::Cancelled);
        }
    }
}

impl fmt::Debug for PendingPermissionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPermissionRequest")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("resolved", &self.on_denied.is_none())
            .finish()
    }
}

/// A settled request whose continuation has not run yet
///
/// The manager applies the registry update first, then calls [`complete`].
///
/// [`complete`]: Resolution::complete
#[derive(Debug)]
pub struct Resolution {
    request: PendingPermissionRequest,
    denial: Option<DenialReason>,
}

impl Resolution {
    pub fn key(&self) -> &IdentityKey {
        self.request.key()
    }

    pub fn is_granted(&self) -> bool {
        self.denial.is_none()
    }

    /// Run the matching continuation
    pub fn complete(self) {
        match self.denial {
            None => self.request.grant(),
            Some(reason) => self.request.deny(reason),
        }
    }
}

#[derive(Debug, Default)]
struct GatewayState {
    pending: HashMap<IdentityKey, PendingPermissionRequest>,
    /// Grants cached for the current attachment
    granted: HashSet<IdentityKey>,
}

pub struct PermissionGateway {
    backend: Arc<dyn UsbBackend>,
    state: Mutex<GatewayState>,
    next_token: AtomicU64,
}

impl PermissionGateway {
    pub fn new(backend: Arc<dyn UsbBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(GatewayState::default()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Request access to `endpoint`
    ///
    /// With a cached grant (or access the OS already allows) the request
    /// settles immediately and is returned for the caller to complete.
    /// Otherwise the OS prompt is issued and `None` is returned; the answer
    /// arrives later through [`resolve`](Self::resolve).
    pub fn request_permission(
        &self,
        endpoint: &UsbEndpoint,
        on_granted: GrantedFn,
        on_denied: DeniedFn,
    ) -> Option<Resolution> {
        let token = CorrelationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let request = PendingPermissionRequest::new(endpoint.clone(), token, on_granted, on_denied);
        let key = request.key.clone();

        if self.is_granted(&key) || self.backend.has_permission(endpoint) {
            debug!("Permission for {} already granted", key);
            let superseded = {
                let mut state = lock(&self.state);
                state.granted.insert(key.clone());
                state.pending.remove(&key)
            };
            if let Some(old) = superseded {
                old.deny(DenialReason::Superseded);
            }
            return Some(Resolution {
                request,
                denial: None,
            });
        }

        let superseded = lock(&self.state).pending.insert(key.clone(), request);
        if let Some(old) = superseded {
            info!(
                "Permission request {:?} for {} superseded by {:?}",
                old.token, key, token
            );
            old.deny(DenialReason::Superseded);
        }

        if let Err(e) = self.backend.request_permission(endpoint, token) {
            warn!("Failed to issue permission prompt for {}: {}", key, e);
            let failed = {
                let mut state = lock(&self.state);
                match state.pending.get(&key) {
                    Some(pending) if pending.token == token => state.pending.remove(&key),
                    _ => None,
                }
            };
            if let Some(request) = failed {
                request.deny(DenialReason::Refused);
            }
            return None;
        }

        debug!("Permission prompt {:?} issued for {}", token, key);
        None
    }

    /// Match an OS permission answer to its pending request
    ///
    /// A stale token (an answer for a superseded prompt) is ignored. An answer
    /// carrying neither endpoint nor token cannot be attributed, so every
    /// pending request is denied as `Unmatched`.
    ///
    /// The returned resolutions are completed by the caller once the answer
    /// has been applied.
    pub fn resolve(
        &self,
        endpoint: Option<&IdentityKey>,
        token: Option<CorrelationToken>,
        granted: bool,
    ) -> Vec<Resolution> {
        let request = {
            let mut state = lock(&self.state);

            let key = match (endpoint, token) {
                (Some(key), _) => key.clone(),
                (None, Some(token)) => {
                    let matched = state
                        .pending
                        .values()
                        .find(|pending| pending.token == token)
                        .map(|pending| pending.key.clone());
                    match matched {
                        Some(key) => key,
                        None => {
                            warn!("Permission result {:?} matches no pending request", token);
                            return Vec::new();
                        }
                    }
                }
                (None, None) => {
                    let unmatched: Vec<_> =
                        state.pending.drain().map(|(_, request)| request).collect();
                    drop(state);
                    if !unmatched.is_empty() {
                        warn!(
                            "Permission result without endpoint, denying {} pending requests",
                            unmatched.len()
                        );
                    }
                    return unmatched
                        .into_iter()
                        .map(|request| Resolution {
                            request,
                            denial: Some(DenialReason::Unmatched),
                        })
                        .collect();
                }
            };

            let Some(pending) = state.pending.get(&key) else {
                warn!("Permission result for {} with no pending request", key);
                return Vec::new();
            };
            if let Some(token) = token
                && token != pending.token
            {
                warn!(
                    "Stale permission result {:?} for {} (pending {:?})",
                    token, key, pending.token
                );
                return Vec::new();
            }

            match state.pending.remove(&key) {
                Some(request) => request,
                None => return Vec::new(),
            }
        };

        // The access check may open the device; keep it outside the lock
        let granted = granted || self.backend.has_permission(&request.endpoint);
        if granted {
            lock(&self.state).granted.insert(request.key.clone());
        }

        info!(
            "Permission for {} {}",
            request.key,
            if granted { "granted" } else { "refused" }
        );
        vec![Resolution {
            request,
            denial: (!granted).then_some(DenialReason::Refused),
        }]
    }

    /// Whether a grant is cached for `key`
    pub fn is_granted(&self, key: &IdentityKey) -> bool {
        lock(&self.state).granted.contains(key)
    }

    /// Forget the cached grant and cancel any pending request for `key`
    pub fn forget(&self, key: &IdentityKey) {
        let pending = {
            let mut state = lock(&self.state);
            state.granted.remove(key);
            state.pending.remove(key)
        };
        if let Some(request) = pending {
            request.deny(DenialReason::Cancelled);
        }
    }

    /// Cancel every pending request
    pub fn cancel_all(&self) {
        let pending: Vec<_> = lock(&self.state)
            .pending
            .drain()
            .map(|(_, request)| request)
            .collect();
        for request in pending {
            request.deny(DenialReason::Cancelled);
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }
}

impl fmt::Debug for PermissionGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionGateway")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
