pub mod protocol;
pub mod serial;
pub mod tracker;

pub use serial::SerialSniffer;

use std::fmt;
use std::time::SystemTime;

use crate::device::{Device, DeviceCatalog};
use crate::error::{Result, SnifferError};

/// One captured link-layer packet as it came off the sniffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlePacket {
    pub timestamp: SystemTime,
    pub channel: u8,
    pub rssi: i16,
    /// The complete UART frame (header + payload), unescaped.
    pub data: Vec<u8>,
}

/// Lifecycle of a sniffer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Scanning,
    Following,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Scanning => write!(f, "scanning"),
            SessionState::Following => write!(f, "following"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

impl SessionState {
    /// Validates a state change. Closing is always allowed.
    pub fn transition(self, to: SessionState) -> Result<SessionState> {
        use SessionState::*;

        match (self, to) {
            (_, Closed)
            | (Disconnected, Connecting)
            | (Connecting, Scanning)
            | (Scanning, Scanning)
            | (Scanning, Following) => Ok(to),
            (from, to) => Err(SnifferError::InvalidState(format!("{from} -> {to}"))),
        }
    }
}

/// Control surface of a sniffer: scanning, following a target, and a
/// pull-based packet drain for the relay loop.
pub trait SnifferSession {
    fn start(&mut self) -> Result<()>;
    fn scan(&mut self) -> Result<()>;
    fn devices(&self) -> Result<DeviceCatalog>;
    fn follow(&mut self, device: &Device) -> Result<()>;

    /// Takes every packet buffered since the last call, oldest first.
    fn drain_packets(&mut self) -> Result<Vec<BlePacket>>;

    fn in_connection(&self) -> Result<bool>;
    fn missed_packets(&self) -> Result<u64>;
    fn firmware_version(&self) -> Option<String>;

    /// Stops the sniffer. Safe to call more than once.
    fn close(&mut self);
}
