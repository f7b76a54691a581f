//! Controller for a six-axis servo robotic arm.
//!
//! Drives the arm over classic Bluetooth serial, BLE GATT or a WiFi
//! WebSocket, records keyframe sequences into SQLite and plays them back.

pub mod app;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use app::ArmControllerApp;
pub use error::{Error, Result};
