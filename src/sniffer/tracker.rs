use std::time::SystemTime;

use log::{debug, info, warn};

use super::protocol::{
    BleEvent, Frame, EVENT_CONNECT, EVENT_DISCONNECT, EVENT_FOLLOW, EVENT_PACKET, PING_RESP,
};
use super::{BlePacket, SessionState};
use crate::device::{Device, DeviceCatalog};

/// Session state shared between the serial reader thread and the caller.
#[derive(Debug)]
pub struct SessionTracker {
    pub state: SessionState,
    devices: Vec<Device>,
    in_connection: bool,
    missed: u64,
    last_counter: Option<u16>,
    firmware_version: Option<u16>,
    fault: Option<String>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        SessionTracker {
            state: SessionState::Disconnected,
            devices: Vec::new(),
            in_connection: false,
            missed: 0,
            last_counter: None,
            firmware_version: None,
            fault: None,
        }
    }
}

impl SessionTracker {
    /// Applies one frame from the sniffer. Returns the packet to hand to the
    /// relay when the session is following a device.
    pub fn observe(&mut self, frame: &Frame) -> Option<BlePacket> {
        self.count_gap(frame.counter);

        match frame.id {
            EVENT_PACKET => return self.observe_packet(frame),
            EVENT_CONNECT => {
                info!("Sniffer reports connection established");
                self.in_connection = true;
            }
            EVENT_DISCONNECT => {
                info!("Sniffer reports connection lost");
                self.in_connection = false;
            }
            EVENT_FOLLOW => info!("Sniffer confirmed follow request"),
            PING_RESP => {
                if let &[lo, hi, ..] = frame.payload.as_slice() {
                    self.firmware_version = Some(u16::from_le_bytes([lo, hi]));
                }
            }
            other => debug!("Ignoring sniffer message id 0x{:02x}", other),
        }

        None
    }

    fn observe_packet(&mut self, frame: &Frame) -> Option<BlePacket> {
        let event = match BleEvent::parse(&frame.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping malformed BLE packet event: {}", e);
                self.missed += 1;
                return None;
            }
        };

        match self.state {
            SessionState::Scanning => {
                if let Some(adv) = event.advertisement() {
                    self.record_device(adv.address, adv.name, event.rssi);
                }
                None
            }
            SessionState::Following => Some(BlePacket {
                timestamp: SystemTime::now(),
                channel: event.channel,
                rssi: event.rssi,
                data: frame.raw.clone(),
            }),
            _ => None,
        }
    }

    fn count_gap(&mut self, counter: u16) {
        if let Some(last) = self.last_counter {
            let expected = last.wrapping_add(1);
            if counter != expected {
                let lost = counter.wrapping_sub(expected) as u64;
                debug!("Packet counter jumped {} -> {} ({} lost)", last, counter, lost);
                self.missed += lost;
            }
        }
        self.last_counter = Some(counter);
    }

    fn record_device(&mut self, address: [u8; 6], name: Option<String>, rssi: i16) {
        if let Some(dev) = self.devices.iter_mut().find(|d| d.address == address) {
            dev.rssi = rssi;
            if let Some(name) = name {
                dev.name = name;
            }
            return;
        }

        let dev = Device::new(address, name.unwrap_or_else(|| "\"\"".to_string()), rssi);
        info!("Discovered {}", dev);
        self.devices.push(dev);
    }

    /// Forgets the previous scan's devices.
    pub fn reset_devices(&mut self) {
        self.devices.clear();
    }

    pub fn catalog(&self) -> DeviceCatalog {
        DeviceCatalog::new(self.devices.clone())
    }

    pub fn in_connection(&self) -> bool {
        self.in_connection
    }

    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn count_dropped(&mut self) {
        self.missed += 1;
    }

    pub fn firmware_version(&self) -> Option<u16> {
        self.firmware_version
    }

    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn set_fault(&mut self, reason: impl Into<String>) {
        self.fault = Some(reason.into());
    }
}
