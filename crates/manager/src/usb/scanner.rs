//! USB scanner
//!
//! Diffs the OS enumeration against the set of endpoints seen on the previous
//! scan. Every trigger (explicit refresh, hotplug attach, hotplug detach) runs
//! the same full diff, so a lost or coalesced notification is repaired by the
//! next scan.

use protocol::{IdentityKey, UsbEndpoint};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Check if a VID/PID pair is allowed by the filters
///
/// Filter format is `"0xVID:0xPID"` with `*` as a wildcard on either side.
/// Filters are validated by the config loader; malformed entries never match.
pub fn matches_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|filter| {
        let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
            return false;
        };
        matches_id(filter_vid, vid) && matches_id(filter_pid, pid)
    })
}

fn matches_id(pattern: &str, id: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let hex = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(hex, 16).is_ok_and(|v| v == id)
}

/// Result of one scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UsbScanDiff {
    /// Endpoints not present on the previous scan, in enumeration order
    pub attached: Vec<UsbEndpoint>,
    /// Identity keys no longer present
    pub detached: Vec<IdentityKey>,
}

impl UsbScanDiff {
    pub fn is_empty(&self) -> bool {
        self.attached.is_empty() && self.detached.is_empty()
    }
}

/// Tracks the endpoints present on the last successful scan
#[derive(Debug, Default)]
pub struct UsbScanner {
    filters: Vec<String>,
    /// OS location -> identity assigned at attach time
    present: HashMap<(u8, u8), (IdentityKey, UsbEndpoint)>,
}

impl UsbScanner {
    pub fn new(filters: Vec<String>) -> Self {
        Self {
            filters,
            present: HashMap::new(),
        }
    }

    /// Diff an enumeration result against the previous scan
    ///
    /// Enumeration itself belongs to the caller so that a failed enumeration
    /// never reaches the known set.
    pub fn diff(&mut self, endpoints: Vec<UsbEndpoint>) -> UsbScanDiff {
        let mut diff = UsbScanDiff::default();
        let mut next: HashMap<(u8, u8), (IdentityKey, UsbEndpoint)> = HashMap::new();

        for endpoint in endpoints {
            if endpoint.is_root_hub() {
                debug!(
                    "Skipping root hub: bus={}, addr={}",
                    endpoint.bus_number, endpoint.device_address
                );
                continue;
            }

            if !matches_filter(endpoint.vendor_id, endpoint.product_id, &self.filters) {
                debug!(
                    "Device ignored by filter: bus={}, addr={}, vid={:#06x}, pid={:#06x}",
                    endpoint.bus_number,
                    endpoint.device_address,
                    endpoint.vendor_id,
                    endpoint.product_id
                );
                continue;
            }

            let location = endpoint.location();
            // Same location with the same ids is the same attachment, even if
            // the serial string only became readable now.
            let key = match self.present.get(&location) {
                Some((key, known))
                    if known.vendor_id == endpoint.vendor_id
                        && known.product_id == endpoint.product_id =>
                {
                    key.clone()
                }
                _ => {
                    diff.attached.push(endpoint.clone());
                    endpoint.identity_key()
                }
            };
            next.insert(location, (key, endpoint));
        }

        // Keys still held by an attachment that survived this scan. A key seen
        // only at a new location is a fresh attachment and must detach first.
        let carried: HashSet<&IdentityKey> = self
            .present
            .iter()
            .filter(|(location, (key, _))| {
                next.get(*location).is_some_and(|(next_key, _)| next_key == key)
            })
            .map(|(_, (key, _))| key)
            .collect();
        let mut detached: Vec<IdentityKey> = self
            .present
            .iter()
            .filter(|(_, (key, _))| !carried.contains(key))
            .map(|(_, (key, _))| key.clone())
            .collect();
        detached.sort_by_key(|key| key.to_string());
        detached.dedup();
        diff.detached = detached;

        self.present = next;

        if !diff.is_empty() {
            debug!(
                "USB scan: {} attached, {} detached, {} present",
                diff.attached.len(),
                diff.detached.len(),
                self.present.len()
            );
        }
        diff
    }

    /// Endpoint currently present for `key`
    pub fn endpoint(&self, key: &IdentityKey) -> Option<&UsbEndpoint> {
        self.present
            .values()
            .find(|(present, _)| present == key)
            .map(|(_, endpoint)| endpoint)
    }

    /// Whether `key` was present on the last scan
    pub fn is_present(&self, key: &IdentityKey) -> bool {
        self.endpoint(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::create_mock_usb_endpoint;

    fn jade(address: u8) -> UsbEndpoint {
        create_mock_usb_endpoint(address, 0x10c4, 0xea60, Some("JADE01"))
    }

    #[test]
    fn test_filter_matching() {
        let filters = vec!["0x1234:0x5678".to_string(), "0xABCD:*".to_string()];

        assert!(matches_filter(0x1234, 0x5678, &filters));
        assert!(matches_filter(0xABCD, 0x1111, &filters));
        assert!(matches_filter(0xABCD, 0x9999, &filters));

        assert!(!matches_filter(0x1234, 0x9999, &filters));
        assert!(!matches_filter(0x9999, 0x5678, &filters));
        assert!(!matches_filter(0x0000, 0x0000, &filters));

        assert!(matches_filter(0x1234, 0x5678, &[]));
        assert!(matches_filter(0x0001, 0x0002, &["*:*".to_string()]));
    }

    #[test]
    fn test_diff_reports_attach_then_nothing() {
        let mut scanner = UsbScanner::new(Vec::new());

        let first = scanner.diff(vec![jade(4)]);
        assert_eq!(first.attached.len(), 1);
        assert!(first.detached.is_empty());

        let second = scanner.diff(vec![jade(4)]);
        assert!(second.is_empty());
    }

    #[test]
    fn test_diff_reports_detach() {
        let mut scanner = UsbScanner::new(Vec::new());
        let key = jade(4).identity_key();
        scanner.diff(vec![jade(4)]);

        let diff = scanner.diff(vec![]);
        assert!(diff.attached.is_empty());
        assert_eq!(diff.detached, vec![key]);
        assert!(scanner.is_empty());
    }

    #[test]
    fn test_replug_at_new_address_is_reattach() {
        let mut scanner = UsbScanner::new(Vec::new());
        scanner.diff(vec![jade(4)]);
        scanner.diff(vec![]);

        let diff = scanner.diff(vec![jade(9)]);
        assert_eq!(diff.attached.len(), 1);
        assert_eq!(diff.attached[0].location(), (1, 9));
    }

    #[test]
    fn test_move_within_one_scan_detaches_then_attaches() {
        let mut scanner = UsbScanner::new(Vec::new());
        let key = jade(4).identity_key();
        scanner.diff(vec![jade(4)]);

        let diff = scanner.diff(vec![jade(9)]);
        assert_eq!(diff.detached, vec![key.clone()]);
        assert_eq!(diff.attached.len(), 1);
        assert_eq!(diff.attached[0].location(), (1, 9));
        assert_eq!(scanner.endpoint(&key).map(|ep| ep.location()), Some((1, 9)));
    }

    #[test]
    fn test_reused_address_detaches_previous_device() {
        let mut scanner = UsbScanner::new(Vec::new());
        let key = jade(4).identity_key();
        scanner.diff(vec![jade(4)]);

        let ledger = create_mock_usb_endpoint(4, 0x2c97, 0x4011, Some("NANO"));
        let diff = scanner.diff(vec![ledger]);
        assert_eq!(diff.detached, vec![key]);
        assert_eq!(diff.attached.len(), 1);
        assert_eq!(diff.attached[0].vendor_id, 0x2c97);
    }

    #[test]
    fn test_key_stable_when_serial_appears_late() {
        let mut scanner = UsbScanner::new(Vec::new());
        let unreadable = create_mock_usb_endpoint(4, 0x10c4, 0xea60, None);
        let key = unreadable.identity_key();
        scanner.diff(vec![unreadable]);

        let diff = scanner.diff(vec![jade(4)]);
        assert!(diff.is_empty());
        assert!(scanner.is_present(&key));
    }

    #[test]
    fn test_root_hub_and_filtered_skipped() {
        let mut scanner = UsbScanner::new(vec!["0x10c4:0xea60".to_string()]);
        let mut hub = create_mock_usb_endpoint(1, 0x1d6b, 0x0002, None);
        hub.class = protocol::USB_CLASS_HUB;
        let keyboard = create_mock_usb_endpoint(2, 0x046d, 0xc31c, None);

        let diff = scanner.diff(vec![hub, keyboard, jade(4)]);
        assert_eq!(diff.attached.len(), 1);
        assert_eq!(diff.attached[0].vendor_id, 0x10c4);
        assert_eq!(scanner.len(), 1);
    }

    #[test]
    fn test_identical_devices_without_serial_share_key() {
        let mut scanner = UsbScanner::new(Vec::new());
        let a = create_mock_usb_endpoint(4, 0x2c97, 0x4011, None);
        let b = create_mock_usb_endpoint(5, 0x2c97, 0x4011, None);
        let key = a.identity_key();
        scanner.diff(vec![a.clone(), b]);

        // Unplugging one of the two keeps the shared key present
        let diff = scanner.diff(vec![a]);
        assert!(diff.detached.is_empty());
        assert!(scanner.is_present(&key));
    }
}
