use std::{
    io::{BufRead, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use log::info;

use crate::config::SnifferConfig;
use crate::core::signal::ForceExitGuard;
use crate::device::{prompt_device_selection, Device, DeviceCatalog};
use crate::error::{Result, SnifferError};
use crate::sink::PcapPipe;
use crate::sniffer::{SerialSniffer, SnifferSession};

/// Opens the sniffer on the configured port, starts it and waits for the
/// UART link to settle.
///
/// # Arguments
///
/// * `config` - Port, baud rate, settle delay and queue size
///
/// # Errors
///
/// `SnifferError::Setup` when the port cannot be opened
pub fn connect(config: &SnifferConfig) -> Result<SerialSniffer> {
    println!("Connecting to sniffer on {}", config.port);
    let mut session = SerialSniffer::open(config)?;
    session.start()?;
    thread::sleep(config.settle_delay);
    Ok(session)
}

/// Puts the sniffer in scan mode and returns what it saw after `scan_time`.
pub fn scan_for_devices<S: SnifferSession>(
    session: &mut S,
    scan_time: Duration,
) -> Result<DeviceCatalog> {
    info!("Starting BLE device scan ({} seconds)", scan_time.as_secs_f32());
    session.scan()?;
    thread::sleep(scan_time);
    session.devices()
}

/// Scans until the user picks a device. Empty catalogs and answers outside
/// the listed range trigger another scan.
///
/// # Arguments
///
/// * `session` - Started sniffer session
/// * `scan_time` - How long each scan collects advertisers
/// * `running` - Cleared by Ctrl+C; checked around every scan and prompt
/// * `force_exit` - Armed while the prompt blocks on `input`
/// * `input` - Source of the user's answer
/// * `out` - Where the device list and prompt go
///
/// # Errors
///
/// `SnifferError::Interrupted` once `running` is cleared, session errors from
/// the scan, and I/O errors (including EOF) from the prompt
pub fn choose_device<S, R, W>(
    session: &mut S,
    scan_time: Duration,
    running: &AtomicBool,
    force_exit: &AtomicBool,
    input: &mut R,
    out: &mut W,
) -> Result<Device>
where
    S: SnifferSession,
    R: BufRead,
    W: Write,
{
    loop {
        check_running(running)?;

        writeln!(out, "Scanning for BLE devices ({}s) ...", scan_time.as_secs())?;
        let catalog = scan_for_devices(session, scan_time)?;

        check_running(running)?;
        if catalog.is_empty() {
            info!("No devices found, scanning again");
            continue;
        }

        let choice = {
            let _armed = ForceExitGuard::arm(force_exit);
            prompt_device_selection(&catalog, input, out)?
        };
        check_running(running)?;

        if let Some(device) = choice {
            return Ok(device);
        }
    }
}

fn check_running(running: &AtomicBool) -> Result<()> {
    if running.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(SnifferError::Interrupted)
    }
}

/// Creates the Wireshark pipe and waits until a reader opens it.
///
/// # Arguments
///
/// * `path` - Where the FIFO is created
/// * `running` - Cleared by Ctrl+C; aborts the wait
/// * `out` - Where the Wireshark hint is printed
///
/// # Errors
///
/// `SnifferError::Interrupted` when `running` clears before a reader
/// attaches, otherwise FIFO or pcap setup errors
pub fn open_pipe<W: Write>(path: &Path, running: &AtomicBool, out: &mut W) -> Result<PcapPipe> {
    let shown = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    writeln!(out, "Start wireshark with -Y btle -k -i {}", shown.display())?;
    out.flush()?;
    PcapPipe::create(path, running)
}

pub fn follow_device<S: SnifferSession, W: Write>(
    session: &mut S,
    device: &Device,
    out: &mut W,
) -> Result<()> {
    writeln!(out, "Attempting to follow device {}", device.address_string())?;
    session.follow(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::sniffer::BlePacket;

    struct ScriptedSession {
        catalogs: Vec<Vec<Device>>,
        scans: usize,
        followed: Option<Device>,
    }

    impl ScriptedSession {
        fn new(catalogs: Vec<Vec<Device>>) -> Self {
            ScriptedSession {
                catalogs,
                scans: 0,
                followed: None,
            }
        }
    }

    impl SnifferSession for ScriptedSession {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn scan(&mut self) -> Result<()> {
            self.scans += 1;
            Ok(())
        }
        fn devices(&self) -> Result<DeviceCatalog> {
            let index = (self.scans - 1).min(self.catalogs.len() - 1);
            Ok(DeviceCatalog::new(self.catalogs[index].clone()))
        }
        fn follow(&mut self, device: &Device) -> Result<()> {
            self.followed = Some(device.clone());
            Ok(())
        }
        fn drain_packets(&mut self) -> Result<Vec<BlePacket>> {
            Ok(Vec::new())
        }
        fn in_connection(&self) -> Result<bool> {
            Ok(false)
        }
        fn missed_packets(&self) -> Result<u64> {
            Ok(0)
        }
        fn firmware_version(&self) -> Option<String> {
            Some("1".into())
        }
        fn close(&mut self) {}
    }

    fn device_a() -> Device {
        Device::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01], "DeviceA", -40)
    }

    fn device_b() -> Device {
        Device::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x02], "DeviceB", -70)
    }

    #[test]
    fn rescans_until_a_valid_choice() {
        let mut session = ScriptedSession::new(vec![
            vec![],
            vec![device_a(), device_b()],
            vec![device_a(), device_b()],
            vec![device_a(), device_b()],
        ]);
        let running = AtomicBool::new(true);
        let force_exit = AtomicBool::new(false);
        let mut input = Cursor::new("5\nbanana\n2\n");
        let mut out = Vec::new();

        let device = choose_device(
            &mut session,
            Duration::ZERO,
            &running,
            &force_exit,
            &mut input,
            &mut out,
        )
        .unwrap();

        assert_eq!(device, device_b());
        assert_eq!(session.scans, 4);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("Scanning for BLE devices").count(), 4);
    }

    #[test]
    fn interrupt_aborts_selection() {
        let mut session = ScriptedSession::new(vec![vec![device_a()]]);
        let running = AtomicBool::new(false);
        let result = choose_device(
            &mut session,
            Duration::ZERO,
            &running,
            &AtomicBool::new(false),
            &mut Cursor::new("1\n"),
            &mut Vec::new(),
        );
        assert!(matches!(result, Err(SnifferError::Interrupted)));
        assert_eq!(session.scans, 0);
    }

    /// Answers with a valid choice, but Ctrl+C lands while the answer is read.
    struct InterruptedStdin<'a> {
        inner: Cursor<&'static str>,
        running: &'a AtomicBool,
        force_exit: &'a AtomicBool,
        armed_during_read: bool,
    }

    impl std::io::Read for InterruptedStdin<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            std::io::Read::read(&mut self.inner, buf)
        }
    }

    impl BufRead for InterruptedStdin<'_> {
        fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
            self.armed_during_read |= self.force_exit.load(Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            self.inner.fill_buf()
        }
        fn consume(&mut self, amt: usize) {
            self.inner.consume(amt)
        }
    }

    #[test]
    fn interrupt_during_prompt_discards_the_answer() {
        let mut session = ScriptedSession::new(vec![vec![device_a()]]);
        let running = AtomicBool::new(true);
        let force_exit = AtomicBool::new(false);
        let mut input = InterruptedStdin {
            inner: Cursor::new("1\n"),
            running: &running,
            force_exit: &force_exit,
            armed_during_read: false,
        };

        let result = choose_device(
            &mut session,
            Duration::ZERO,
            &running,
            &force_exit,
            &mut input,
            &mut Vec::new(),
        );

        assert!(matches!(result, Err(SnifferError::Interrupted)));
        assert!(input.armed_during_read);
        assert!(!force_exit.load(Ordering::SeqCst));
        assert_eq!(session.scans, 1);
    }

    #[cfg(unix)]
    #[test]
    fn interrupt_while_pipe_has_no_reader() {
        let dir = tempfile::tempdir().unwrap();
        let running = AtomicBool::new(false);
        let mut out = Vec::new();

        let result = open_pipe(&dir.path().join("ble.pipe"), &running, &mut out);

        assert!(matches!(result, Err(SnifferError::Interrupted)));
        assert!(String::from_utf8(out)
            .unwrap()
            .starts_with("Start wireshark with -Y btle -k -i "));
    }

    #[test]
    fn follow_announces_address() {
        let mut session = ScriptedSession::new(vec![vec![device_a()]]);
        let mut out = Vec::new();
        follow_device(&mut session, &device_a(), &mut out).unwrap();
        assert_eq!(session.followed, Some(device_a()));
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Attempting to follow device AA:BB:CC:DD:EE:01\n"
        );
    }
}
