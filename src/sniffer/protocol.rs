//! UART framing spoken by the sniffer firmware.
//!
//! Frames are SLIP-style delimited (`0xAB` .. `0xBC`) with a three-code
//! escape scheme. Inside a frame sits a fixed header followed by the payload:
//!
//! ```text
//! | header len | payload len | protocol ver | counter (LE u16) | id | payload.. |
//! ```

use thiserror::Error;

pub const SLIP_START: u8 = 0xAB;
pub const SLIP_END: u8 = 0xBC;
pub const SLIP_ESC: u8 = 0xCD;
pub const SLIP_ESC_START: u8 = 0xAC;
pub const SLIP_ESC_END: u8 = 0xBD;
pub const SLIP_ESC_ESC: u8 = 0xCE;

pub const HEADER_LENGTH: usize = 6;
pub const PROTOCOL_VERSION: u8 = 1;

pub const ADV_ACCESS_ADDRESS: u32 = 0x8E89_BED6;

// Message ids
pub const REQ_FOLLOW: u8 = 0x00;
pub const EVENT_FOLLOW: u8 = 0x01;
pub const EVENT_CONNECT: u8 = 0x05;
pub const EVENT_PACKET: u8 = 0x06;
pub const REQ_SCAN_CONT: u8 = 0x07;
pub const EVENT_DISCONNECT: u8 = 0x09;
pub const PING_REQ: u8 = 0x0D;
pub const PING_RESP: u8 = 0x0E;
pub const GO_IDLE: u8 = 0xFE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),

    #[error("header length {0} is below the minimum")]
    BadHeaderLength(u8),

    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Incremental SLIP decoder fed one byte at a time from the serial port.
#[derive(Debug, Default)]
pub struct SlipDecoder {
    buf: Vec<u8>,
    in_frame: bool,
    escaped: bool,
}

impl SlipDecoder {
    /// Returns a complete unescaped frame when `byte` terminates one.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if byte == SLIP_START {
            // A start byte always resynchronises, even mid-frame.
            self.buf.clear();
            self.in_frame = true;
            self.escaped = false;
            return None;
        }

        if !self.in_frame {
            return None;
        }

        if self.escaped {
            self.escaped = false;
            self.buf.push(match byte {
                SLIP_ESC_START => SLIP_START,
                SLIP_ESC_END => SLIP_END,
                SLIP_ESC_ESC => SLIP_ESC,
                other => other,
            });
            return None;
        }

        match byte {
            SLIP_END => {
                self.in_frame = false;
                Some(std::mem::take(&mut self.buf))
            }
            SLIP_ESC => {
                self.escaped = true;
                None
            }
            b => {
                self.buf.push(b);
                None
            }
        }
    }
}

pub fn slip_encode(frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len() + 2);
    out.push(SLIP_START);
    for &b in frame {
        match b {
            SLIP_START => out.extend([SLIP_ESC, SLIP_ESC_START]),
            SLIP_END => out.extend([SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => out.extend([SLIP_ESC, SLIP_ESC_ESC]),
            other => out.push(other),
        }
    }
    out.push(SLIP_END);
    out
}

/// A decoded UART message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub counter: u16,
    pub id: u8,
    pub payload: Vec<u8>,
    pub raw: Vec<u8>,
}

impl Frame {
    pub fn parse(raw: Vec<u8>) -> Result<Frame, FrameError> {
        if raw.len() < HEADER_LENGTH {
            return Err(FrameError::TooShort(raw.len()));
        }

        let header_len = raw[0] as usize;
        if header_len < HEADER_LENGTH {
            return Err(FrameError::BadHeaderLength(raw[0]));
        }

        let expected = header_len + raw[1] as usize;
        if raw.len() < expected {
            return Err(FrameError::Truncated {
                expected,
                actual: raw.len(),
            });
        }

        Ok(Frame {
            counter: u16::from_le_bytes([raw[3], raw[4]]),
            id: raw[5],
            payload: raw[header_len..expected].to_vec(),
            raw,
        })
    }

    /// Builds an unescaped host-to-sniffer message.
    pub fn encode(id: u8, counter: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LENGTH + payload.len());
        out.push(HEADER_LENGTH as u8);
        out.push(payload.len() as u8);
        out.push(PROTOCOL_VERSION);
        out.extend(counter.to_le_bytes());
        out.push(id);
        out.extend_from_slice(payload);
        out
    }
}

/// Radio metadata and PDU carried by an `EVENT_PACKET` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleEvent {
    pub channel: u8,
    pub rssi: i16,
    /// Access address, PDU header and PDU body.
    pub pdu: Vec<u8>,
}

pub struct Advertisement {
    /// Advertiser address, most significant byte first.
    pub address: [u8; 6],
    pub name: Option<String>,
}

impl BleEvent {
    pub fn parse(payload: &[u8]) -> Result<BleEvent, FrameError> {
        const MIN_BLE_HEADER: usize = 10;

        if payload.len() < MIN_BLE_HEADER {
            return Err(FrameError::TooShort(payload.len()));
        }
        let header_len = payload[0] as usize;
        if header_len < MIN_BLE_HEADER {
            return Err(FrameError::BadHeaderLength(payload[0]));
        }
        if payload.len() < header_len {
            return Err(FrameError::Truncated {
                expected: header_len,
                actual: payload.len(),
            });
        }

        // Flags, event counter and firmware timestamp (bytes 1, 4..10) stay
        // in the raw frame that goes to the pcap stream.
        Ok(BleEvent {
            channel: payload[2],
            // Firmware reports the magnitude only.
            rssi: -(payload[3] as i16),
            pdu: payload[header_len..].to_vec(),
        })
    }

    pub fn access_address(&self) -> Option<u32> {
        let aa = self.pdu.get(0..4)?;
        Some(u32::from_le_bytes([aa[0], aa[1], aa[2], aa[3]]))
    }

    pub fn is_advertising(&self) -> bool {
        self.access_address() == Some(ADV_ACCESS_ADDRESS)
    }

    /// Extracts the advertiser from PDUs that carry an AdvA field.
    pub fn advertisement(&self) -> Option<Advertisement> {
        if !self.is_advertising() {
            return None;
        }

        let header = self.pdu.get(4..6)?;
        let pdu_type = header[0] & 0x0F;
        let length = (header[1] & 0x3F) as usize;
        let body = self.pdu.get(6..)?;
        let body = &body[..length.min(body.len())];

        // ADV_IND, ADV_DIRECT_IND, ADV_NONCONN_IND, SCAN_RSP, ADV_SCAN_IND
        if !matches!(pdu_type, 0 | 1 | 2 | 4 | 6) || body.len() < 6 {
            return None;
        }

        let mut address = [0u8; 6];
        for (dst, src) in address.iter_mut().zip(body[..6].iter().rev()) {
            *dst = *src;
        }

        let name = if pdu_type == 1 {
            None
        } else {
            local_name(&body[6..])
        };

        Some(Advertisement { address, name })
    }
}

/// Finds the complete (0x09) or shortened (0x08) local name in AD structures.
fn local_name(mut ad: &[u8]) -> Option<String> {
    let mut short = None;

    while let Some((&len, rest)) = ad.split_first() {
        let len = len as usize;
        if len == 0 || rest.len() < len {
            break;
        }
        let (field, tail) = rest.split_at(len);
        match field[0] {
            0x09 => return Some(String::from_utf8_lossy(&field[1..]).into_owned()),
            0x08 => short = Some(String::from_utf8_lossy(&field[1..]).into_owned()),
            _ => {}
        }
        ad = tail;
    }

    short
}
