//! BLE advertisement scanner
//!
//! Advertisements arrive continuously. The scanner filters them against the
//! supported service allow-list and reports each identity once per scan
//! session; `clear` starts a new session so every device is reported again.

use protocol::{BleAdvertisement, IdentityKey};
use std::collections::HashSet;
use tracing::{info, trace};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct BleScanner {
    supported: Vec<Uuid>,
    advertised: HashSet<IdentityKey>,
}

impl BleScanner {
    pub fn new(supported: Vec<Uuid>) -> Self {
        Self {
            supported,
            advertised: HashSet::new(),
        }
    }

    /// Service allow-list handed to the OS scanner
    pub fn services(&self) -> &[Uuid] {
        &self.supported
    }

    /// Observe an advertisement
    ///
    /// Returns the identity key on the first sighting since the last `clear`.
    /// Advertisements without a supported service are ignored.
    pub fn observe(&mut self, advertisement: &BleAdvertisement) -> Option<IdentityKey> {
        let Some(key) = advertisement.identity_key(&self.supported) else {
            trace!(
                "Ignoring advertisement from {} with unsupported services {:?}",
                advertisement.address, advertisement.service_uuids
            );
            return None;
        };

        if !self.advertised.insert(key.clone()) {
            return None;
        }

        info!("BLE device advertised: {} ({})", advertisement.label(), key);
        Some(key)
    }

    /// Forget every sighting
    pub fn clear(&mut self) {
        self.advertised.clear();
    }

    pub fn len(&self) -> usize {
        self.advertised.len()
    }

    pub fn is_empty(&self) -> bool {
        self.advertised.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{
        JADE_BLE_SERVICE, LEDGER_BLE_SERVICE, UNSUPPORTED_BLE_SERVICE, create_mock_advertisement,
    };

    #[test]
    fn test_unsupported_service_ignored() {
        let mut scanner = BleScanner::new(vec![JADE_BLE_SERVICE]);
        let adv = create_mock_advertisement("aa:bb:cc:dd:ee:ff", UNSUPPORTED_BLE_SERVICE);

        assert!(scanner.observe(&adv).is_none());
        assert!(scanner.is_empty());
    }

    #[test]
    fn test_first_sighting_reported_once() {
        let mut scanner = BleScanner::new(vec![JADE_BLE_SERVICE]);
        let adv = create_mock_advertisement("aa:bb:cc:dd:ee:ff", JADE_BLE_SERVICE);

        assert!(scanner.observe(&adv).is_some());
        assert!(scanner.observe(&adv).is_none());

        // Address case does not create a second identity
        let upper = create_mock_advertisement("AA:BB:CC:DD:EE:FF", JADE_BLE_SERVICE);
        assert!(scanner.observe(&upper).is_none());
        assert_eq!(scanner.len(), 1);
    }

    #[test]
    fn test_clear_reseeds() {
        let mut scanner = BleScanner::new(vec![JADE_BLE_SERVICE, LEDGER_BLE_SERVICE]);
        let adv = create_mock_advertisement("11:22:33:44:55:66", LEDGER_BLE_SERVICE);

        let key = scanner.observe(&adv).unwrap();
        scanner.clear();
        assert_eq!(scanner.observe(&adv), Some(key));
    }
}
