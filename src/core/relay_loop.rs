use std::{
    io::Write,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use crossterm::{
    cursor::MoveToColumn,
    queue,
    terminal::{Clear, ClearType},
};
use log::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{Result, SnifferError};
use crate::sink::CaptureSink;
use crate::sniffer::SnifferSession;

/// Running totals for one capture session. Never reset while it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets: u64,
    pub missed: u64,
    pub connected: bool,
    pub ticks: u64,
}

/// Moves packets from a following sniffer into a capture sink until the sink
/// closes or the run flag drops.
pub struct RelayLoop<S: SnifferSession, K: CaptureSink> {
    session: S,
    sink: K,
    config: RelayConfig,
    stats: SessionStats,
    forward_failures: u64,
}

impl<S: SnifferSession, K: CaptureSink> RelayLoop<S, K> {
    /// Builds a loop over a session that is already following a device.
    ///
    /// # Arguments
    ///
    /// * `session` - Sniffer session, owned so it can be closed on exit
    /// * `sink` - Open capture sink receiving every drained packet
    /// * `config` - Poll interval and status line cadence
    pub fn new(session: S, sink: K, config: RelayConfig) -> Self {
        RelayLoop {
            session,
            sink,
            config,
            stats: SessionStats::default(),
            forward_failures: 0,
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Relays until the sink reports closed (`Ok`) or an interrupt or session
    /// failure (`Err`). Session and sink are closed on every path.
    ///
    /// # Arguments
    ///
    /// * `running` - Shared run flag cleared by Ctrl+C
    /// * `status` - Terminal the status line is rewritten on
    ///
    /// # Returns
    /// * `Ok(stats)` once the sink has closed
    /// * `Err(SnifferError::Interrupted)` or a session read error otherwise
    pub fn run<W: Write>(mut self, running: &AtomicBool, status: &mut W) -> Result<SessionStats> {
        let result = self.relay(running, status);

        if let Err(e) = &result {
            warn!("Relay stopped: {}", e);
        }
        self.session.close();
        self.sink.close();

        result.map(|()| self.stats)
    }

    fn relay<W: Write>(&mut self, running: &AtomicBool, status: &mut W) -> Result<()> {
        loop {
            if !self.sink.is_open() {
                info!("Capture sink closed after {} ticks", self.stats.ticks);
                return Ok(());
            }
            if !running.load(Ordering::SeqCst) {
                return Err(SnifferError::Interrupted);
            }

            thread::sleep(self.config.poll_interval);
            self.tick(status)?;
        }
    }

    /// One poll: drain, forward in order, refresh counters, maybe print.
    ///
    /// # Arguments
    ///
    /// * `status` - Where the status line goes when it is due
    ///
    /// # Returns
    /// * `Ok(true)` if a status line was emitted this tick
    /// * `Err` when the session can no longer be read
    pub fn tick<W: Write>(&mut self, status: &mut W) -> Result<bool> {
        let packets = self.session.drain_packets()?;
        self.stats.packets += packets.len() as u64;

        for (i, packet) in packets.iter().enumerate() {
            if !self.sink.is_open() {
                // Nothing else can be delivered this session.
                self.forward_failures += (packets.len() - i) as u64;
                break;
            }
            if let Err(e) = self.sink.write(packet) {
                debug!("Forward failed: {}", e);
                self.forward_failures += 1;
            }
        }

        self.stats.ticks += 1;

        let connected = self.session.in_connection()?;
        self.stats.missed = self.session.missed_packets()? + self.forward_failures;

        let changed = connected != self.stats.connected;
        self.stats.connected = connected;

        let every = self.config.status_every.max(1);
        if changed || self.stats.ticks % every == 0 {
            if let Err(e) = write_status(status, &self.stats) {
                warn!("Could not write status line: {}", e);
            }
            return Ok(true);
        }
        Ok(false)
    }
}

pub fn format_status(stats: &SessionStats) -> String {
    format!(
        "connected: {}, packets: {}, missed: {}",
        stats.connected, stats.packets, stats.missed
    )
}

/// Rewrites the current terminal line with the latest counters.
fn write_status<W: Write>(out: &mut W, stats: &SessionStats) -> std::io::Result<()> {
    queue!(out, MoveToColumn(0), Clear(ClearType::CurrentLine))?;
    write!(out, "{}", format_status(stats))?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::time::{Duration, UNIX_EPOCH};

    use crate::device::{Device, DeviceCatalog};
    use crate::sniffer::BlePacket;

    fn packet(id: u8) -> BlePacket {
        BlePacket {
            timestamp: UNIX_EPOCH,
            channel: 0,
            rssi: 0,
            data: vec![id],
        }
    }

    fn fast() -> RelayConfig {
        RelayConfig {
            poll_interval: Duration::ZERO,
            ..RelayConfig::default()
        }
    }

    #[derive(Default)]
    struct FakeSession {
        batches: VecDeque<Vec<BlePacket>>,
        connection: RefCell<VecDeque<bool>>,
        last_connection: Cell<bool>,
        missed: u64,
        fail_drain_at: Option<usize>,
        drains: usize,
        closed: Rc<Cell<bool>>,
    }

    impl SnifferSession for FakeSession {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }
        fn scan(&mut self) -> Result<()> {
            Ok(())
        }
        fn devices(&self) -> Result<DeviceCatalog> {
            Ok(DeviceCatalog::default())
        }
        fn follow(&mut self, _device: &Device) -> Result<()> {
            Ok(())
        }
        fn drain_packets(&mut self) -> Result<Vec<BlePacket>> {
            self.drains += 1;
            if self.fail_drain_at == Some(self.drains) {
                return Err(SnifferError::SessionRead("serial reader stopped".into()));
            }
            Ok(self.batches.pop_front().unwrap_or_default())
        }
        fn in_connection(&self) -> Result<bool> {
            if let Some(next) = self.connection.borrow_mut().pop_front() {
                self.last_connection.set(next);
            }
            Ok(self.last_connection.get())
        }
        fn missed_packets(&self) -> Result<u64> {
            Ok(self.missed)
        }
        fn firmware_version(&self) -> Option<String> {
            None
        }
        fn close(&mut self) {
            self.closed.set(true);
        }
    }

    #[derive(Default)]
    struct FakeSink {
        /// Number of `is_open` checks answered with true; `None` is forever.
        open_for: Option<usize>,
        checks: Cell<usize>,
        written: Rc<RefCell<Vec<u8>>>,
        reject: Vec<u8>,
        closed: Rc<Cell<bool>>,
    }

    impl CaptureSink for FakeSink {
        fn is_open(&self) -> bool {
            if self.closed.get() {
                return false;
            }
            self.checks.set(self.checks.get() + 1);
            self.open_for.map_or(true, |n| self.checks.get() <= n)
        }
        fn write(&mut self, packet: &BlePacket) -> Result<()> {
            if self.reject.contains(&packet.data[0]) {
                return Err(SnifferError::Io(std::io::ErrorKind::BrokenPipe.into()));
            }
            self.written.borrow_mut().push(packet.data[0]);
            Ok(())
        }
        fn close(&mut self) {
            self.closed.set(true);
        }
    }

    fn status_lines(out: &[u8]) -> usize {
        String::from_utf8_lossy(out).matches("connected:").count()
    }

    #[test]
    fn relayed_count_is_sum_of_drains() {
        let session = FakeSession {
            batches: VecDeque::from(vec![
                (0..3).map(packet).collect(),
                vec![],
                (3..8).map(packet).collect(),
            ]),
            ..FakeSession::default()
        };
        let mut relay = RelayLoop::new(session, FakeSink::default(), fast());
        let mut out = Vec::new();
        for _ in 0..3 {
            relay.tick(&mut out).unwrap();
        }
        assert_eq!(relay.stats().packets, 8);
        assert_eq!(relay.stats().ticks, 3);
    }

    #[test]
    fn forwards_in_arrival_order() {
        let written = Rc::new(RefCell::new(Vec::new()));
        let session = FakeSession {
            batches: VecDeque::from(vec![
                vec![packet(1), packet(2), packet(3)],
                vec![],
                vec![packet(4)],
                vec![],
                vec![],
                vec![packet(5), packet(6)],
            ]),
            ..FakeSession::default()
        };
        // Six loop checks plus one check per packet forwarded.
        let sink = FakeSink {
            open_for: Some(12),
            written: Rc::clone(&written),
            ..FakeSink::default()
        };

        let running = AtomicBool::new(true);
        let stats = RelayLoop::new(session, sink, fast())
            .run(&running, &mut Vec::new())
            .unwrap();

        assert_eq!(*written.borrow(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(stats.packets, 6);
    }

    #[test]
    fn stops_when_sink_closes_with_periodic_status() {
        let sink_closed = Rc::new(Cell::new(false));
        let session_closed = Rc::new(Cell::new(false));
        let sink = FakeSink {
            open_for: Some(25),
            closed: Rc::clone(&sink_closed),
            ..FakeSink::default()
        };
        let session = FakeSession {
            closed: Rc::clone(&session_closed),
            ..FakeSession::default()
        };

        let running = AtomicBool::new(true);
        let mut out = Vec::new();
        let stats = RelayLoop::new(session, sink, fast())
            .run(&running, &mut out)
            .unwrap();

        assert_eq!(stats.ticks, 25);
        assert_eq!(status_lines(&out), 1);
        assert!(String::from_utf8_lossy(&out).contains("connected: false, packets: 0, missed: 0"));
        assert!(sink_closed.get());
        assert!(session_closed.get());
    }

    #[test]
    fn status_on_connection_change() {
        let session = FakeSession {
            connection: RefCell::new(VecDeque::from(vec![false, true, true, false, false])),
            ..FakeSession::default()
        };
        let mut relay = RelayLoop::new(session, FakeSink::default(), fast());
        let mut out = Vec::new();

        let emitted: Vec<bool> = (0..5).map(|_| relay.tick(&mut out).unwrap()).collect();
        assert_eq!(emitted, vec![false, true, false, true, false]);
        assert!(String::from_utf8_lossy(&out).contains("connected: true"));
    }

    #[test]
    fn periodic_status_without_change() {
        let mut relay = RelayLoop::new(FakeSession::default(), FakeSink::default(), fast());
        let mut out = Vec::new();
        let emitted: Vec<u64> = (1..=60)
            .filter(|_| relay.tick(&mut out).unwrap())
            .collect();
        assert_eq!(emitted, vec![20, 40, 60]);
        assert_eq!(status_lines(&out), 3);
    }

    #[test]
    fn forward_failures_join_missed_count() {
        let session = FakeSession {
            batches: VecDeque::from(vec![vec![packet(1), packet(2), packet(3)]]),
            missed: 4,
            ..FakeSession::default()
        };
        let sink = FakeSink {
            reject: vec![2],
            ..FakeSink::default()
        };
        let mut relay = RelayLoop::new(session, sink, fast());
        relay.tick(&mut Vec::new()).unwrap();
        assert_eq!(relay.stats().packets, 3);
        assert_eq!(relay.stats().missed, 5);
    }

    #[test]
    fn no_forwards_once_sink_closed_mid_batch() {
        let written = Rc::new(RefCell::new(Vec::new()));
        let sink = FakeSink {
            open_for: Some(2),
            written: Rc::clone(&written),
            ..FakeSink::default()
        };
        let session = FakeSession {
            batches: VecDeque::from(vec![vec![packet(1), packet(2), packet(3), packet(4)]]),
            ..FakeSession::default()
        };
        let mut relay = RelayLoop::new(session, sink, fast());
        relay.tick(&mut Vec::new()).unwrap();
        assert_eq!(*written.borrow(), vec![1, 2]);
        assert_eq!(relay.stats().missed, 2);
    }

    #[test]
    fn interrupt_still_closes_both() {
        let sink_closed = Rc::new(Cell::new(false));
        let session_closed = Rc::new(Cell::new(false));
        let sink = FakeSink {
            closed: Rc::clone(&sink_closed),
            ..FakeSink::default()
        };
        let session = FakeSession {
            closed: Rc::clone(&session_closed),
            ..FakeSession::default()
        };

        let running = AtomicBool::new(false);
        let result = RelayLoop::new(session, sink, fast()).run(&running, &mut Vec::new());

        assert!(matches!(result, Err(SnifferError::Interrupted)));
        assert!(sink_closed.get());
        assert!(session_closed.get());
    }

    #[test]
    fn session_read_failure_is_fatal_and_cleans_up() {
        let sink_closed = Rc::new(Cell::new(false));
        let session_closed = Rc::new(Cell::new(false));
        let session = FakeSession {
            batches: VecDeque::from(vec![vec![packet(1)]]),
            fail_drain_at: Some(2),
            closed: Rc::clone(&session_closed),
            ..FakeSession::default()
        };
        let sink = FakeSink {
            closed: Rc::clone(&sink_closed),
            ..FakeSink::default()
        };

        let running = AtomicBool::new(true);
        let result = RelayLoop::new(session, sink, fast()).run(&running, &mut Vec::new());

        assert!(matches!(result, Err(SnifferError::SessionRead(_))));
        assert!(sink_closed.get());
        assert!(session_closed.get());
    }

    #[test]
    fn status_line_format() {
        let stats = SessionStats {
            packets: 12,
            missed: 3,
            connected: true,
            ticks: 40,
        };
        assert_eq!(format_status(&stats), "connected: true, packets: 12, missed: 3");
    }
}
