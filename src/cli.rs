use std::path::PathBuf;

use clap::Parser;

/// blepipe - relay a BLE sniffer's capture into a Wireshark pipe
#[derive(Parser, Debug)]
#[command(
    name = "blepipe",
    about = "Interacts with a serial BLE sniffer and streams captured packets to a pcap pipe"
)]
pub struct CliArgs {
    /// Serial port location ('COM14', '/dev/tty.usbserial-DN009WNO', etc.)
    pub serialport: String,

    /// Verbose mode: INFO logging and firmware version on startup
    #[arg(short, long)]
    pub verbose: bool,

    /// UART baud rate of the sniffer firmware
    #[arg(long, value_name = "BAUD", default_value_t = 460_800)]
    pub baud_rate: u32,

    /// Seconds to wait for the UART link to settle after opening the port
    #[arg(long, value_name = "SECS", default_value_t = 6)]
    pub settle_secs: u64,

    /// Seconds to scan for advertising devices before listing them
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub scan_secs: u64,

    /// Path of the named pipe Wireshark reads from.
    /// Defaults to 'ble.pipe' in the system temp directory.
    #[arg(long, value_name = "PATH")]
    pub pipe: Option<PathBuf>,
}
