use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, UNIX_EPOCH},
};

use log::{info, trace, warn};
use pcap::{Capture, Linktype, Packet, PacketHeader, Savefile};

use super::CaptureSink;
use crate::error::{Result, SnifferError};
use crate::sniffer::BlePacket;

/// LINKTYPE_NORDIC_BLE: a board id byte followed by the sniffer's UART frame.
pub const LINKTYPE_NORDIC_BLE: i32 = 272;

const BOARD_ID: u8 = 0;

const READER_POLL: Duration = Duration::from_millis(100);

/// Pcap stream written into a named pipe for a live Wireshark capture.
pub struct PcapPipe {
    path: PathBuf,
    savefile: Option<Savefile>,
}

impl PcapPipe {
    /// Replaces any stale file at `path` with a fresh FIFO and opens it once
    /// a reader attaches. Gives up with `SnifferError::Interrupted` when
    /// `running` clears while waiting.
    pub fn create(path: &Path, running: &AtomicBool) -> Result<Self> {
        if path.exists() {
            fs::remove_file(path)?;
        }
        make_fifo(path)?;

        // Held until the savefile has its own handle on the pipe.
        let reader_attached = wait_for_reader(path, running)?;
        let pipe = Self::open_and_init(path);
        drop(reader_attached);
        pipe
    }

    /// Opens `path` and writes the pcap global header.
    pub fn open_and_init(path: &Path) -> Result<Self> {
        let capture = Capture::dead(Linktype(LINKTYPE_NORDIC_BLE))?;
        let mut savefile = capture.savefile(path)?;
        savefile.flush()?;
        info!("Pcap stream opened at {}", path.display());

        Ok(PcapPipe {
            path: path.to_path_buf(),
            savefile: Some(savefile),
        })
    }
}

impl CaptureSink for PcapPipe {
    fn is_open(&self) -> bool {
        self.savefile.is_some()
    }

    fn write(&mut self, packet: &BlePacket) -> Result<()> {
        let Some(savefile) = self.savefile.as_mut() else {
            return Err(SnifferError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "capture pipe is closed",
            )));
        };

        let mut record = Vec::with_capacity(packet.data.len() + 1);
        record.push(BOARD_ID);
        record.extend_from_slice(&packet.data);

        let since_epoch = packet
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let header = PacketHeader {
            ts: libc::timeval {
                tv_sec: since_epoch.as_secs() as _,
                tv_usec: since_epoch.subsec_micros() as _,
            },
            caplen: record.len() as u32,
            len: record.len() as u32,
        };

        trace!(
            "ch {} rssi {} -> {} bytes",
            packet.channel,
            packet.rssi,
            record.len()
        );
        savefile.write(&Packet::new(&header, &record));

        // The reader going away only surfaces when the buffer is flushed.
        if let Err(e) = savefile.flush() {
            warn!("Capture pipe {} closed: {}", self.path.display(), e);
            self.savefile = None;
            return Err(e.into());
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut savefile) = self.savefile.take() {
            if let Err(e) = savefile.flush() {
                warn!("Final flush of {} failed: {}", self.path.display(), e);
            }
            info!("Capture pipe {} closed", self.path.display());
        }
    }
}

impl Drop for PcapPipe {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> io::Result<()> {
    use nix::sys::stat::Mode;

    nix::unistd::mkfifo(path, Mode::from_bits_truncate(0o644))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_fifo(_path: &Path) -> io::Result<()> {
    // No FIFOs here; the pcap stream lands in a regular file.
    Ok(())
}

/// Polls a non-blocking write open of the FIFO. ENXIO means nobody has it
/// open for reading yet.
#[cfg(unix)]
fn wait_for_reader(path: &Path, running: &AtomicBool) -> Result<Option<fs::File>> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut announced = false;
    loop {
        match fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => return Ok(Some(file)),
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {}
            Err(e) => return Err(e.into()),
        }

        if !running.load(Ordering::SeqCst) {
            return Err(SnifferError::Interrupted);
        }
        if !announced {
            info!("Waiting for a reader on {}", path.display());
            announced = true;
        }
        thread::sleep(READER_POLL);
    }
}

#[cfg(not(unix))]
fn wait_for_reader(_path: &Path, _running: &AtomicBool) -> Result<Option<fs::File>> {
    Ok(None)
}
