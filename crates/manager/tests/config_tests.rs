//! Integration tests for configuration parsing
//!
//! Covers full and minimal TOML documents, defaults for omitted sections,
//! validation failures and save/load through the filesystem.

use manager::ManagerConfig;
use manager::config::load_config;
use std::time::Duration;
use tempfile::TempDir;

const FULL_CONFIG: &str = r#"
[manager]
log_level = "debug"
event_batch_limit = 16

[usb]
enabled = true
hotplug = false
filters = ["0x2c97:*", "0x10c4:0xea60"]

[ble]
enabled = false
supported_services = ["6e400001-b5a3-f393-e0a9-e50e24dcca9e"]

[timeouts]
autonomous_ms = 2000
autonomous_long_ms = 6000
user_interaction_ms = 90000
"#;

const MINIMAL_CONFIG: &str = r#"
[manager]
log_level = "info"
"#;

mod parsing {
    use super::*;

    #[test]
    fn test_full_config() {
        let config = ManagerConfig::parse(FULL_CONFIG).unwrap();

        assert_eq!(config.manager.log_level, "debug");
        assert_eq!(config.manager.event_batch_limit, 16);
        assert!(!config.usb.hotplug);
        assert_eq!(config.usb.filters.len(), 2);
        assert!(!config.ble.enabled);
        assert_eq!(config.ble.service_uuids().len(), 1);
        assert_eq!(config.timeouts.autonomous(), Duration::from_secs(2));
        assert_eq!(config.timeouts.user_interaction(), Duration::from_secs(90));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ManagerConfig::parse(MINIMAL_CONFIG).unwrap();
        let defaults = ManagerConfig::default();

        assert_eq!(config.manager.event_batch_limit, 64);
        assert!(config.usb.enabled);
        assert!(config.usb.hotplug);
        assert_eq!(config.usb.filters, defaults.usb.filters);
        assert_eq!(config.ble.supported_services, defaults.ble.supported_services);
        assert_eq!(config.timeouts.autonomous_long_ms, 8_000);
        assert_eq!(config.timeouts.user_interaction_ms, 120_000);
    }

    #[test]
    fn test_empty_filter_list_allowed() {
        let config = ManagerConfig::parse(
            r#"
[manager]
log_level = "warn"

[usb]
filters = []
"#,
        )
        .unwrap();
        assert!(config.usb.filters.is_empty());
    }
}

mod validation {
    use super::*;

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(ManagerConfig::parse("[manager\nlog_level = ").is_err());
    }

    #[test]
    fn test_missing_manager_section_rejected() {
        assert!(ManagerConfig::parse("[usb]\nenabled = true\n").is_err());
    }

    #[test]
    fn test_bad_filter_rejected() {
        let err = ManagerConfig::parse(
            r#"
[manager]
log_level = "info"

[usb]
filters = ["2c97:4011"]
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid VID"));
    }

    #[test]
    fn test_bad_service_uuid_rejected() {
        let err = ManagerConfig::parse(
            r#"
[manager]
log_level = "info"

[ble]
supported_services = ["jade"]
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid BLE service UUID"));
    }

    #[test]
    fn test_inverted_autonomous_budgets_rejected() {
        let err = ManagerConfig::parse(
            r#"
[manager]
log_level = "info"

[timeouts]
autonomous_ms = 10000
autonomous_long_ms = 8000
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("must not exceed"));
    }

    #[test]
    fn test_zero_batch_limit_rejected() {
        let mut config = ManagerConfig::default();
        config.manager.event_batch_limit = 0;
        assert!(config.validate().is_err());
    }
}

mod persistence {
    use super::*;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("manager.toml");

        let mut config = ManagerConfig::default();
        config.usb.filters = vec!["0x534c:0x0001".to_string()];
        config.timeouts.user_interaction_ms = 60_000;
        config.save(&path).unwrap();

        let loaded = ManagerConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.usb.filters, vec!["0x534c:0x0001".to_string()]);
        assert_eq!(loaded.timeouts.user_interaction_ms, 60_000);
    }

    #[test]
    fn test_load_config_from_path_string() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manager.toml");
        std::fs::write(&path, FULL_CONFIG).unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.manager.log_level, "debug");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let result = ManagerConfig::load(Some(dir.path().join("absent.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_default_path_location() {
        let path = ManagerConfig::default_path();
        assert!(path.ends_with("hw-devmgr/manager.toml"));
    }
}
