pub mod pcap_pipe;

pub use pcap_pipe::PcapPipe;

use crate::error::Result;
use crate::sniffer::BlePacket;

/// Destination for relayed packets. Once closed it never reopens.
pub trait CaptureSink {
    fn is_open(&self) -> bool;
    fn write(&mut self, packet: &BlePacket) -> Result<()>;
    fn close(&mut self);
}
