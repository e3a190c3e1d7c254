use std::{
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};
use serialport::SerialPort;

use super::protocol::{slip_encode, Frame, SlipDecoder, GO_IDLE, PING_REQ, REQ_FOLLOW, REQ_SCAN_CONT};
use super::tracker::SessionTracker;
use super::{BlePacket, SessionState, SnifferSession};
use crate::config::SnifferConfig;
use crate::device::{Device, DeviceCatalog};
use crate::error::{Result, SnifferError};

const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Sniffer hardware attached over a serial port. A background thread decodes
/// the UART stream and feeds a bounded queue drained by `drain_packets`.
pub struct SerialSniffer {
    port: Box<dyn SerialPort>,
    tracker: Arc<Mutex<SessionTracker>>,
    packets: Receiver<BlePacket>,
    sender: Option<SyncSender<BlePacket>>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    queue_capacity: usize,
    tx_counter: u16,
}

impl SerialSniffer {
    /// Opens the serial port. Fails with `SnifferError::Setup` on a bad port.
    pub fn open(config: &SnifferConfig) -> Result<Self> {
        let port = serialport::new(&config.port, config.baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|source| SnifferError::Setup {
                port: config.port.clone(),
                source,
            })?;

        info!("Opened {} at {} baud", config.port, config.baud_rate);
        Self::from_port(port, config.queue_capacity)
    }

    pub fn from_port(port: Box<dyn SerialPort>, queue_capacity: usize) -> Result<Self> {
        let queue_capacity = queue_capacity.max(1);
        let (sender, packets) = mpsc::sync_channel(queue_capacity);
        let mut tracker = SessionTracker::default();
        tracker.state = tracker.state.transition(SessionState::Connecting)?;

        Ok(SerialSniffer {
            port,
            tracker: Arc::new(Mutex::new(tracker)),
            packets,
            sender: Some(sender),
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
            queue_capacity,
            tx_counter: 0,
        })
    }

    pub fn state(&self) -> SessionState {
        match self.tracker.lock() {
            Ok(t) => t.state,
            Err(_) => SessionState::Closed,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SessionTracker>> {
        let guard = self
            .tracker
            .lock()
            .map_err(|_| SnifferError::SessionRead("session state lock poisoned".into()))?;
        if let Some(fault) = guard.fault() {
            return Err(SnifferError::SessionRead(fault.to_string()));
        }
        Ok(guard)
    }

    fn advance(&self, to: SessionState) -> Result<()> {
        let mut tracker = self.lock()?;
        tracker.state = tracker.state.transition(to)?;
        debug!("Session state -> {}", tracker.state);
        Ok(())
    }

    fn send(&mut self, id: u8, payload: &[u8]) -> Result<()> {
        let frame = Frame::encode(id, self.tx_counter, payload);
        self.tx_counter = self.tx_counter.wrapping_add(1);
        self.port.write_all(&slip_encode(&frame))?;
        self.port.flush()?;
        Ok(())
    }
}

impl SnifferSession for SerialSniffer {
    fn start(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        let sender = self
            .sender
            .take()
            .ok_or_else(|| SnifferError::InvalidState("sniffer already closed".into()))?;

        let port = self.port.try_clone().map_err(io::Error::from)?;
        let tracker = Arc::clone(&self.tracker);
        let stop = Arc::clone(&self.stop);
        self.reader = Some(thread::spawn(move || read_loop(port, tracker, sender, stop)));

        self.send(PING_REQ, &[])
    }

    fn scan(&mut self) -> Result<()> {
        self.advance(SessionState::Scanning)?;
        self.lock()?.reset_devices();
        self.send(REQ_SCAN_CONT, &[])
    }

    fn devices(&self) -> Result<DeviceCatalog> {
        Ok(self.lock()?.catalog())
    }

    fn follow(&mut self, device: &Device) -> Result<()> {
        self.advance(SessionState::Following)?;
        // Over the air the address is little endian.
        let mut payload: Vec<u8> = device.address.iter().rev().copied().collect();
        payload.push(0);
        self.send(REQ_FOLLOW, &payload)
    }

    fn drain_packets(&mut self) -> Result<Vec<BlePacket>> {
        drop(self.lock()?);

        // At most one queue's worth per call, so a busy reader cannot keep
        // a single drain going forever.
        let mut drained = Vec::new();
        while drained.len() < self.queue_capacity {
            match self.packets.try_recv() {
                Ok(packet) => drained.push(packet),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if drained.is_empty() {
                        return Err(SnifferError::SessionRead("serial reader stopped".into()));
                    }
                    break;
                }
            }
        }
        Ok(drained)
    }

    fn in_connection(&self) -> Result<bool> {
        Ok(self.lock()?.in_connection())
    }

    fn missed_packets(&self) -> Result<u64> {
        Ok(self.lock()?.missed())
    }

    fn firmware_version(&self) -> Option<String> {
        let tracker = self.tracker.lock().ok()?;
        tracker.firmware_version().map(|v| v.to_string())
    }

    fn close(&mut self) {
        if self.state() == SessionState::Closed && self.reader.is_none() {
            return;
        }

        if self.reader.is_some() {
            if let Err(e) = self.send(GO_IDLE, &[]) {
                debug!("Could not idle sniffer: {}", e);
            }
        }

        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                error!("Serial reader thread panicked");
            }
        }

        if let Ok(mut tracker) = self.tracker.lock() {
            tracker.state = SessionState::Closed;
        }
        info!("Sniffer session closed");
    }
}

impl Drop for SerialSniffer {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_loop(
    mut port: Box<dyn SerialPort>,
    tracker: Arc<Mutex<SessionTracker>>,
    sender: SyncSender<BlePacket>,
    stop: Arc<AtomicBool>,
) {
    let mut decoder = SlipDecoder::default();
    let mut buf = [0u8; 1024];

    while !stop.load(Ordering::SeqCst) {
        let n = match port.read(&mut buf) {
            Ok(0) => {
                error!("Serial port closed");
                if let Ok(mut t) = tracker.lock() {
                    t.set_fault("serial port closed".to_string());
                }
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Serial read failed: {}", e);
                if let Ok(mut t) = tracker.lock() {
                    t.set_fault(format!("serial read failed: {e}"));
                }
                return;
            }
        };

        for &byte in &buf[..n] {
            let Some(raw) = decoder.push(byte) else {
                continue;
            };

            let frame = match Frame::parse(raw) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("{}", SnifferError::from(e));
                    continue;
                }
            };

            let packet = match tracker.lock() {
                Ok(mut t) => t.observe(&frame),
                Err(_) => return,
            };

            if let Some(packet) = packet {
                match sender.try_send(packet) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        if let Ok(mut t) = tracker.lock() {
                            t.count_dropped();
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
        }
    }
}
