use std::fmt;
use std::io::{self, BufRead, Write};

/// A BLE advertiser seen during one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Hardware address, most significant byte first.
    pub address: [u8; 6],
    pub name: String,
    pub rssi: i16,
}

impl Device {
    pub fn new(address: [u8; 6], name: impl Into<String>, rssi: i16) -> Self {
        Device {
            address,
            name: name.into(),
            rssi,
        }
    }

    pub fn address_string(&self) -> String {
        format_address(&self.address)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, RSSI = {})",
            self.name,
            self.address_string(),
            self.rssi
        )
    }
}

pub fn format_address(address: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        address[0], address[1], address[2], address[3], address[4], address[5]
    )
}

/// Devices produced by a single scan cycle, in discovery order.
/// Positions are only meaningful for the catalog they came from.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    devices: Vec<Device>,
}

impl DeviceCatalog {
    pub fn new(devices: Vec<Device>) -> Self {
        DeviceCatalog { devices }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Zero-based lookup.
    pub fn find(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }
}

/// Maps a user's answer to a device. Anything other than an integer in
/// `1..=catalog.len()` means "scan again".
pub fn select_device<'a>(catalog: &'a DeviceCatalog, input: &str) -> Option<&'a Device> {
    let choice = input.trim().parse::<i64>().ok()?;
    if choice >= 1 && choice <= catalog.len() as i64 {
        catalog.find((choice - 1) as usize)
    } else {
        None
    }
}

pub fn print_device_list<W: Write>(catalog: &DeviceCatalog, out: &mut W) -> io::Result<()> {
    writeln!(out, "Found {} BLE devices:\n", catalog.len())?;
    for (i, dev) in catalog.iter().enumerate() {
        writeln!(out, "  [{}] {}", i + 1, dev)?;
    }
    Ok(())
}

/// Lists the catalog and reads one answer. `Ok(None)` asks for a re-scan.
pub fn prompt_device_selection<R: BufRead, W: Write>(
    catalog: &DeviceCatalog,
    input: &mut R,
    out: &mut W,
) -> io::Result<Option<Device>> {
    if catalog.is_empty() {
        return Ok(None);
    }

    print_device_list(catalog, out)?;
    write!(out, "\nSelect a device to sniff, or '0' to scan again\n> ")?;
    out.flush()?;

    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "input closed while selecting a device",
        ));
    }

    Ok(select_device(catalog, &line).cloned())
}
