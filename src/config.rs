use std::path::PathBuf;
use std::time::Duration;

use crate::cli::CliArgs;

pub const DEFAULT_BAUD_RATE: u32 = 460_800;
pub const DEFAULT_PIPE_NAME: &str = "ble.pipe";

/// Settings for opening and driving the sniffer hardware.
#[derive(Debug, Clone)]
pub struct SnifferConfig {
    pub port: String,
    pub baud_rate: u32,
    pub settle_delay: Duration,
    pub scan_time: Duration,
    /// Packets buffered between the serial reader and the relay loop.
    pub queue_capacity: usize,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        SnifferConfig {
            port: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            settle_delay: Duration::from_secs(6),
            scan_time: Duration::from_secs(5),
            queue_capacity: 4096,
        }
    }
}

/// Timing of the relay loop.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    /// A status line is forced every this many ticks.
    pub status_every: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            poll_interval: Duration::from_millis(100),
            status_every: 20,
        }
    }
}

impl SnifferConfig {
    pub fn from_args(args: &CliArgs) -> Self {
        SnifferConfig {
            port: args.serialport.clone(),
            baud_rate: args.baud_rate,
            settle_delay: Duration::from_secs(args.settle_secs),
            scan_time: Duration::from_secs(args.scan_secs),
            ..SnifferConfig::default()
        }
    }
}

pub fn pipe_path(args: &CliArgs) -> PathBuf {
    args.pipe
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_PIPE_NAME))
}
