use thiserror::Error;

use crate::sniffer::protocol::FrameError;

pub type Result<T> = std::result::Result<T, SnifferError>;

#[derive(Debug, Error)]
pub enum SnifferError {
    #[error("Unable to open serial port '{port}'")]
    Setup {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Sniffer session read failed: {0}")]
    SessionRead(String),

    #[error("Invalid session transition: {0}")]
    InvalidState(String),

    #[error("Malformed sniffer frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Capture sink error: {0}")]
    Sink(#[from] pcap::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Interrupted by user")]
    Interrupted,
}
