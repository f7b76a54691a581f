//! Transports, wire protocol, persistence and logging.

pub mod connection;
pub mod logging;
pub mod protocol;
pub mod storage;
