//! BLE subsystem
//!
//! Advertisement filtering only; scanning and bonding live in the OS and reach
//! the manager through a `BleBackend`.

pub mod scanner;

pub use scanner::BleScanner;
