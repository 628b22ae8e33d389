use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::config::{Config, SerialConfig};
use crate::obis_utils::ObisRegistry;
use crate::snapshot::{PipelineStats, SnapshotPublisher};
use crate::storage::CsvStore;

pub mod utils;
pub mod structs;
pub mod framer;
pub mod obis_parser;
pub mod telegram;

use framer::TelegramStream;
use structs::{ParsedTelegram, RawTelegram};

#[derive(Error, Debug)]
pub enum P1Error {
    #[error("Line is not valid telegram text")]
    Framing,
    #[error("Checksum mismatch: telegram says {expected:#06x}, calculated {computed:#06x}")]
    Checksum { expected: u16, computed: u16 },
    #[error("Telegram has no checksum after the end marker")]
    MissingChecksum,
    #[error("Invalid value for {code}: {reason}")]
    Field { code: String, reason: String },
    #[error("Required field '{0}' missing from telegram")]
    MissingField(String),
    #[error("Stream error: {0}")]
    Stream(#[source] io::Error),
    #[error("Storage error: {0}")]
    Storage(#[source] io::Error),
}

/// A source of raw, line delimited bytes. `Ok(0)` means end of stream.
///
/// A line longer than [`framer::MAX_LINE_LENGTH`] may be returned in pieces.
pub trait LineSource {
    fn next_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize>;
}

impl<R: BufRead> LineSource for R {
    fn next_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        self.by_ref().take(framer::MAX_LINE_LENGTH as u64).read_until(b'\n', buf)
    }
}

/// Something that can be (re)opened to obtain a line source.
pub trait StreamSource {
    fn open(&self) -> io::Result<Box<dyn LineSource + Send>>;
    fn name(&self) -> String;
}

/// The P1 port, usually a USB serial adapter.
///
/// Line settings are applied by the OS (udev rule or `stty`), we only read
/// from the device node.
pub struct SerialDevice {
    config: SerialConfig,
}

impl SerialDevice {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }
}

impl StreamSource for SerialDevice {
    fn open(&self) -> io::Result<Box<dyn LineSource + Send>> {
        let file = File::open(&self.config.device)?;
        info!("Opened {} ({} baud, xonxoff: {})",
              self.config.device, self.config.baud_rate, self.config.xonxoff);
        Ok(Box::new(BufReader::new(file)))
    }

    fn name(&self) -> String {
        self.config.device.clone()
    }
}

/// Acquisition loop: read, frame, validate, decode, store and publish.
pub struct P1Manager {
    registry: ObisRegistry,
    storage: CsvStore,
    publisher: Arc<SnapshotPublisher>,
    stats: Arc<PipelineStats>,
    shutdown: Arc<AtomicBool>,
    max_read_errors: u32,
    read_retry_delay: Duration,
    max_reopen_attempts: u32,
    reopen_delay: Duration,
}

impl P1Manager {
    pub fn new(
        config: &Config,
        publisher: Arc<SnapshotPublisher>,
        stats: Arc<PipelineStats>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let registry = ObisRegistry::new(&config.obis_codes);
        if registry.is_empty() {
            warn!("No OBIS codes configured, every telegram will be rejected");
        } else {
            info!("Decoding {} OBIS codes", registry.len());
        }

        Self {
            registry,
            storage: CsvStore::new(&config.storage.data_dir),
            publisher,
            stats,
            shutdown,
            max_read_errors: config.serial.max_read_errors,
            read_retry_delay: Duration::from_millis(config.serial.read_retry_delay_ms),
            max_reopen_attempts: config.serial.max_reopen_attempts,
            reopen_delay: Duration::from_secs(config.serial.reopen_delay_secs),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Runs until shutdown is requested or the source cannot be reopened.
    pub fn run(&self, source: &dyn StreamSource) -> Result<(), P1Error> {
        info!("Starting P1 acquisition on {}", source.name());
        let mut reopen_attempts = 0;

        while !self.is_shutdown() {
            let mut reader = match source.open() {
                Ok(reader) => {
                    reopen_attempts = 0;
                    reader
                }
                Err(e) => {
                    if self.is_shutdown() {
                        break;
                    }
                    reopen_attempts += 1;
                    error!("Could not open {} (attempt {}): {}", source.name(), reopen_attempts, e);
                    if reopen_attempts > self.max_reopen_attempts {
                        return Err(P1Error::Stream(e));
                    }
                    std::thread::sleep(self.reopen_delay);
                    continue;
                }
            };

            self.consume(reader.as_mut());
            info!("Closing {}", source.name());
        }

        info!("P1 acquisition stopped");
        Ok(())
    }

    /// Reads telegrams until shutdown or too many consecutive read failures.
    fn consume(&self, reader: &mut dyn LineSource) {
        let mut telegrams = TelegramStream::new(reader);
        let mut consecutive_errors = 0;

        while !self.is_shutdown() {
            let failed = match telegrams.next() {
                Some(Ok(raw)) => {
                    consecutive_errors = 0;
                    self.handle_telegram(&raw);
                    false
                }
                Some(Err(P1Error::Framing)) => {
                    PipelineStats::bump(&self.stats.framing_faults);
                    warn!("Skipping line that is not valid telegram text");
                    false
                }
                Some(Err(e)) => {
                    PipelineStats::bump(&self.stats.stream_faults);
                    error!("Reading telegram failed: {}", e);
                    true
                }
                None => {
                    PipelineStats::bump(&self.stats.stream_faults);
                    warn!("End of stream reached");
                    true
                }
            };

            if failed {
                consecutive_errors += 1;
                if consecutive_errors > self.max_read_errors {
                    warn!("{} consecutive read failures, reopening the source", consecutive_errors);
                    return;
                }
                std::thread::sleep(self.read_retry_delay);
            }
        }
    }

    /// Process one framed telegram. Faults only affect this telegram.
    pub fn handle_telegram(&self, raw: &RawTelegram) {
        PipelineStats::bump(&self.stats.telegrams);
        debug!("Full telegram:\n{}", String::from_utf8_lossy(raw.as_bytes()).trim());

        match self.process_telegram(raw) {
            Ok(parsed) => self.deliver(&parsed),
            Err(e @ (P1Error::Checksum { .. } | P1Error::MissingChecksum)) => {
                PipelineStats::bump(&self.stats.checksum_faults);
                warn!("Discarding telegram: {}", e);
            }
            Err(e) => {
                PipelineStats::bump(&self.stats.field_faults);
                warn!("Discarding telegram: {}", e);
            }
        }
    }

    pub fn process_telegram(&self, raw: &RawTelegram) -> Result<ParsedTelegram, P1Error> {
        utils::verify_checksum(raw)?;
        telegram::aggregate_telegram(raw, &self.registry)
    }

    /// Storage and publication are independent, neither undoes the other.
    fn deliver(&self, parsed: &ParsedTelegram) {
        if let Err(e) = self.storage.store(parsed) {
            PipelineStats::bump(&self.stats.storage_faults);
            error!("Writing telegram of {} failed: {}", parsed.day, e);
        }
        self.publisher.publish(parsed.snapshot);
        PipelineStats::bump(&self.stats.published);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Hands out the given streams in order, then requests shutdown.
    struct ScriptedSource {
        streams: Mutex<Vec<Vec<u8>>>,
        shutdown: Arc<AtomicBool>,
    }

    impl StreamSource for ScriptedSource {
        fn open(&self) -> io::Result<Box<dyn LineSource + Send>> {
            let mut streams = self.streams.lock().unwrap();
            if streams.is_empty() {
                self.shutdown.store(true, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
            }
            Ok(Box::new(Cursor::new(streams.remove(0))))
        }

        fn name(&self) -> String {
            "scripted".to_string()
        }
    }

    /// Replays scripted reads, including read failures.
    struct FlakyLines {
        reads: VecDeque<io::Result<Vec<u8>>>,
    }

    impl LineSource for FlakyLines {
        fn next_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(line)) => {
                    buf.extend_from_slice(&line);
                    Ok(line.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    struct FailingSource;

    impl StreamSource for FailingSource {
        fn open(&self) -> io::Result<Box<dyn LineSource + Send>> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such device"))
        }

        fn name(&self) -> String {
            "missing".to_string()
        }
    }

    fn telegram(consumption: &str) -> Vec<u8> {
        let body = format!(
            "/ISk5\\2MT382-1000\r\n\r\n0-0:1.0.0(230615123045S)\r\n1-0:1.8.1({}*kWh)\r\n1-0:1.8.2(000000.000*kWh)\r\n1-0:2.8.1(000000.000*kWh)\r\n1-0:2.8.2(000000.000*kWh)\r\n!",
            consumption
        );
        let crc = utils::calculate_checksum(body.as_bytes());
        format!("{}{:04X}\r\n", body, crc).into_bytes()
    }

    fn manager(dir: &TempDir, shutdown: Arc<AtomicBool>) -> (P1Manager, Arc<SnapshotPublisher>, Arc<PipelineStats>) {
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_string_lossy().to_string();
        config.serial.max_read_errors = 0;
        config.serial.read_retry_delay_ms = 0;
        config.serial.max_reopen_attempts = 1;
        config.serial.reopen_delay_secs = 0;
        let publisher = Arc::new(SnapshotPublisher::new());
        let stats = Arc::new(PipelineStats::default());
        let manager = P1Manager::new(&config, publisher.clone(), stats.clone(), shutdown);
        (manager, publisher, stats)
    }

    #[test]
    fn test_latest_telegram_wins() {
        let dir = TempDir::new().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (manager, publisher, stats) = manager(&dir, shutdown.clone());

        let mut stream = telegram("000001.000");
        stream.extend(telegram("000002.500"));
        let source = ScriptedSource { streams: Mutex::new(vec![stream]), shutdown };

        assert!(manager.run(&source).is_ok());
        assert_eq!(publisher.read().unwrap().total_consumption, 2.5);
        assert_eq!(PipelineStats::get(&stats.published), 2);
        assert!(dir.path().join("230615.csv").exists());
    }

    #[test]
    fn test_reopens_after_end_of_stream() {
        let dir = TempDir::new().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (manager, publisher, _) = manager(&dir, shutdown.clone());

        let source = ScriptedSource {
            streams: Mutex::new(vec![telegram("000001.000"), telegram("000003.000")]),
            shutdown,
        };

        assert!(manager.run(&source).is_ok());
        assert_eq!(publisher.read().unwrap().total_consumption, 3.0);
    }

    #[test]
    fn test_corrupt_telegram_does_not_stop_ingestion() {
        let dir = TempDir::new().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (manager, publisher, stats) = manager(&dir, shutdown.clone());

        let mut stream = telegram("000005.000");
        let pos = stream.iter().position(|b| *b == b'5').unwrap();
        stream[pos] = b'6';
        stream.extend(telegram("000007.000"));
        let source = ScriptedSource { streams: Mutex::new(vec![stream]), shutdown };

        assert!(manager.run(&source).is_ok());
        assert_eq!(PipelineStats::get(&stats.checksum_faults), 1);
        assert_eq!(publisher.read().unwrap().total_consumption, 7.0);
    }

    #[test]
    fn test_read_error_mid_telegram_drops_partial_telegram() {
        let dir = TempDir::new().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let (mut manager, publisher, stats) = manager(&dir, shutdown);
        manager.max_read_errors = 3;

        let interrupted = telegram("000005.000");
        let lines: Vec<&[u8]> = interrupted.split_inclusive(|b| *b == b'\n').collect();
        let mut reads: VecDeque<io::Result<Vec<u8>>> = VecDeque::new();
        for line in &lines[..3] {
            reads.push_back(Ok(line.to_vec()));
        }
        reads.push_back(Err(io::Error::new(io::ErrorKind::Other, "line noise")));
        for line in &lines[3..] {
            reads.push_back(Ok(line.to_vec()));
        }
        for line in telegram("000009.000").split_inclusive(|b| *b == b'\n') {
            reads.push_back(Ok(line.to_vec()));
        }

        manager.consume(&mut FlakyLines { reads });

        assert_eq!(PipelineStats::get(&stats.telegrams), 1);
        assert_eq!(PipelineStats::get(&stats.published), 1);
        assert!(PipelineStats::get(&stats.stream_faults) >= 1);
        assert_eq!(publisher.read().unwrap().total_consumption, 9.0);
    }

    #[test]
    fn test_unopenable_source_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (manager, publisher, _) = manager(&dir, Arc::new(AtomicBool::new(false)));

        assert!(matches!(manager.run(&FailingSource), Err(P1Error::Stream(_))));
        assert!(publisher.read().is_none());
    }

    #[test]
    fn test_storage_failure_still_publishes() {
        let dir = TempDir::new().unwrap();
        // a file where the data directory should be
        let blocked = dir.path().join("data");
        std::fs::write(&blocked, b"").unwrap();

        let mut config = Config::default();
        config.storage.data_dir = blocked.to_string_lossy().to_string();
        let publisher = Arc::new(SnapshotPublisher::new());
        let stats = Arc::new(PipelineStats::default());
        let manager = P1Manager::new(&config, publisher.clone(), stats.clone(), Arc::new(AtomicBool::new(false)));

        manager.handle_telegram(&RawTelegram(telegram("000004.000")));
        assert_eq!(PipelineStats::get(&stats.storage_faults), 1);
        assert_eq!(publisher.read().unwrap().total_consumption, 4.0);
    }
}
