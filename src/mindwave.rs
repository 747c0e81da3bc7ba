//! MindWave client: owns the byte source, the read loop and the handlers.
//!
//! # Threading
//!
//! [`MindWave::start`] moves the byte source into a dedicated thread that
//! reads, reassembles, decodes and dispatches sequentially. Handlers therefore
//! run on that thread, one record at a time, in stream order; keep them short.
//! Handlers can be registered at any time from any thread.
//!
//! [`MindWave::stop`] (or a [`StopHandle`] from elsewhere) only raises a flag.
//! The loop sees it after finishing the packets of the current read, closes
//! the source and exits, so the wait is bounded by the source read timeout.
//!
//! # Session end
//!
//! A source that closes, fails, or stays idle past
//! [`ClientConfig::idle_timeout`] ends the session: the `disconnected` handler
//! receives a [`DisconnectReason`] and the [`SessionReport`] says why. An
//! explicit stop does not emit `disconnected`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::bluetooth::BluetoothConnector;
use crate::decoder::{decode_into, CodeTable};
use crate::errors::{DriverError, Result};
use crate::framing::{FrameParser, DEFAULT_BUFFER_CAPACITY};
use crate::registry::{Dispatch, Handler, HandlerRegistry};
use crate::source::{self, ByteSource, IoSource, ReadStatus};
use crate::types::{DisconnectReason, Event, Record, Value};

const DEFAULT_READ_CHUNK: usize = 512;
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

const READER_THREAD_NAME: &str = "mindwave-reader";

/// Client settings. `Default` suits MindWave Mobile over RFCOMM.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bytes requested from the source per read.
    pub read_chunk_size: usize,
    /// Bound on bytes buffered by the frame parser.
    pub buffer_capacity: usize,
    /// Per-read timeout applied to serial and RFCOMM sources.
    pub read_timeout: Duration,
    /// How long the source may stay silent before the session is ended.
    pub idle_timeout: Duration,
    /// Start reading as soon as `connect_*` returns.
    pub autostart: bool,
    pub code_table: CodeTable,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_READ_CHUNK,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            read_timeout: DEFAULT_READ_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            autostart: false,
            code_table: CodeTable::thinkgear(),
        }
    }
}

impl ClientConfig {
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the per-read timeout, at least one millisecond. A zero socket
    /// timeout blocks forever.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout.max(MIN_READ_TIMEOUT);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn with_code_table(mut self, table: CodeTable) -> Self {
        self.code_table = table;
        self
    }
}

/// Session counters. Framing counters mirror [`FramingStats`](crate::FramingStats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub bytes_read: u64,
    pub packets: u64,
    pub records: u64,
    pub checksum_errors: u64,
    pub oversized_lengths: u64,
    pub discarded_bytes: u64,
    pub overflow_bytes: u64,
    pub decode_errors: u64,
    /// Records with no handler registered for their event.
    pub unhandled_records: u64,
    pub handler_errors: u64,
}

impl SessionStats {
    /// Total frames or packets thrown away for framing or decoding problems.
    pub fn dropped_packets(&self) -> u64 {
        self.checksum_errors + self.oversized_lengths + self.decode_errors
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// `stop()` was requested.
    Stopped,
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub stats: SessionStats,
}

/// Cloneable handle that asks a running session to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Client for one headset stream.
///
/// # Example
/// ```ignore
/// let mut mw = MindWave::connect_bluetooth("A4:DA:32:70:03:4E", ClientConfig::default())?;
/// mw.register(Event::Attention, |v: Value| -> anyhow::Result<()> {
///     println!("Attention: {:?}", v.as_level());
///     Ok(())
/// });
/// mw.start()?;
/// std::thread::sleep(Duration::from_secs(30));
/// let report = mw.stop();
/// ```
pub struct MindWave {
    source: Option<Box<dyn ByteSource>>,
    config: ClientConfig,
    registry: Arc<HandlerRegistry>,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<SessionStats>>,
    worker: Option<JoinHandle<SessionReport>>,
    report: Option<SessionReport>,
}

impl MindWave {
    pub fn new<S: ByteSource + 'static>(source: S, config: ClientConfig) -> Self {
        Self {
            source: Some(Box::new(source)),
            config,
            registry: Arc::new(HandlerRegistry::new()),
            stop: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(SessionStats::default())),
            worker: None,
            report: None,
        }
    }

    /// Open a serial device (`/dev/rfcomm0`, a USB dongle port, ...).
    pub fn connect_serial(path: &str, config: ClientConfig) -> Result<Self> {
        let port = source::open_serial(path, config.read_timeout.max(MIN_READ_TIMEOUT))?;
        Self::with_autostart(port, config)
    }

    /// Open an RFCOMM connection to an already paired headset.
    pub fn connect_bluetooth(mac: &str, config: ClientConfig) -> Result<Self> {
        let connector = BluetoothConnector {
            io_timeout: config.read_timeout.max(MIN_READ_TIMEOUT),
            ..BluetoothConnector::default()
        };
        let stream = connector.connect(mac)?;
        Self::with_autostart(IoSource::new(stream), config)
    }

    fn with_autostart<S: ByteSource + 'static>(source: S, config: ClientConfig) -> Result<Self> {
        let autostart = config.autostart;
        let mut client = Self::new(source, config);
        if autostart {
            client.start()?;
        }
        Ok(client)
    }

    /// Install `handler` for `event`; replaces any previous handler.
    pub fn register<H: Handler>(&self, event: Event, handler: H) {
        self.registry.register(event, handler);
    }

    /// Install a handler by event name (`"eeg"`, `"attention"`, `"blinkStrength"`, ...).
    pub fn register_named<H: Handler>(&self, name: &str, handler: H) -> Result<()> {
        self.registry.register_named(name, handler)
    }

    pub fn unregister(&self, event: Event) -> bool {
        self.registry.unregister(event)
    }

    /// Shared registry, for registering from other threads.
    pub fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop),
        }
    }

    /// Whether the read loop thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Live counters of the current (or last) session.
    pub fn stats(&self) -> SessionStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the read loop and return immediately.
    pub fn start(&mut self) -> Result<()> {
        self.ensure_idle()?;
        let read_loop = self.take_loop()?;
        let worker = thread::Builder::new()
            .name(READER_THREAD_NAME.into())
            .spawn(move || read_loop.run())?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Run the read loop on the calling thread until the session ends.
    pub fn run(&mut self) -> Result<SessionReport> {
        self.ensure_idle()?;
        let report = self.take_loop()?.run();
        self.report = Some(report.clone());
        Ok(report)
    }

    /// Request the loop to stop and wait for it.
    ///
    /// Returns the session report, or `None` if no session ever ran. A source
    /// that was never started is closed.
    pub fn stop(&mut self) -> Option<SessionReport> {
        self.stop.store(true, Ordering::Release);
        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.close() {
                warn!("failed to close unused byte source: {}", e);
            }
        }
        self.wait()
    }

    /// Wait for the loop to end on its own (disconnect or a [`StopHandle`]).
    pub fn wait(&mut self) -> Option<SessionReport> {
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(report) => self.report = Some(report),
                Err(_) => error!("{} thread panicked", READER_THREAD_NAME),
            }
        }
        self.report.clone()
    }

    /// Fail with `AlreadyRunning` while the loop thread is alive; collect the
    /// report of a loop that already ended on its own.
    fn ensure_idle(&mut self) -> Result<()> {
        let Some(worker) = &self.worker else {
            return Ok(());
        };
        if !worker.is_finished() {
            return Err(DriverError::AlreadyRunning);
        }
        self.wait();
        Ok(())
    }

    fn take_loop(&mut self) -> Result<ReadLoop> {
        let source = self
            .source
            .take()
            .ok_or_else(|| DriverError::NotReady("byte source already consumed".into()))?;
        self.stop.store(false, Ordering::Release);
        Ok(ReadLoop {
            source,
            parser: FrameParser::with_capacity(self.config.buffer_capacity),
            table: self.config.code_table.clone(),
            registry: Arc::clone(&self.registry),
            stop: Arc::clone(&self.stop),
            shared_stats: Arc::clone(&self.stats),
            stats: SessionStats::default(),
            chunk_size: self
                .config
                .read_chunk_size
                .clamp(1, self.config.buffer_capacity.max(1)),
            idle_timeout: self.config.idle_timeout,
        })
    }
}

impl Drop for MindWave {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ReadLoop {
    source: Box<dyn ByteSource>,
    parser: FrameParser,
    table: CodeTable,
    registry: Arc<HandlerRegistry>,
    stop: Arc<AtomicBool>,
    shared_stats: Arc<Mutex<SessionStats>>,
    stats: SessionStats,
    chunk_size: usize,
    idle_timeout: Duration,
}

impl ReadLoop {
    fn run(mut self) -> SessionReport {
        info!("read loop started");
        let mut chunk = vec![0u8; self.chunk_size];
        let mut records = Vec::new();
        let mut idle_since: Option<Instant> = None;

        let end = loop {
            if self.stop.load(Ordering::Acquire) {
                break SessionEnd::Stopped;
            }

            match self.source.read_bytes(&mut chunk) {
                Ok(ReadStatus::Data(n)) if n > 0 => {
                    idle_since = None;
                    self.stats.bytes_read += n as u64;
                    self.parser.feed(&chunk[..n]);
                    self.drain(&mut records);
                }
                Ok(ReadStatus::Data(_)) | Ok(ReadStatus::Idle) => {
                    let since = *idle_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.idle_timeout {
                        break SessionEnd::Disconnected(DisconnectReason::Timeout);
                    }
                }
                Ok(ReadStatus::Closed) => {
                    break SessionEnd::Disconnected(DisconnectReason::EndOfStream);
                }
                Err(e) => {
                    break SessionEnd::Disconnected(DisconnectReason::Error(e.to_string()));
                }
            }
            self.publish();
        };

        if let Err(e) = self.source.close() {
            warn!("failed to close byte source: {}", e);
        }

        match &end {
            SessionEnd::Stopped => info!("read loop stopped"),
            SessionEnd::Disconnected(reason) => {
                warn!("headset disconnected: {}", reason);
                let outcome = self
                    .registry
                    .emit(Event::Disconnected, Value::Disconnected(reason.clone()));
                if outcome == Dispatch::Failed {
                    self.stats.handler_errors += 1;
                }
            }
        }

        self.publish();
        let stats = self.stats;
        if stats.dropped_packets() > 0 {
            warn!(
                "session dropped {} packets (checksum={}, oversized={}, decode={})",
                stats.dropped_packets(),
                stats.checksum_errors,
                stats.oversized_lengths,
                stats.decode_errors
            );
        }
        SessionReport { end, stats }
    }

    /// Decode and dispatch every packet completed by the last feed.
    fn drain(&mut self, records: &mut Vec<Record>) {
        while let Some(packet) = self.parser.next_packet() {
            records.clear();
            if let Err(e) = decode_into(&self.table, packet.payload(), records) {
                self.stats.decode_errors += 1;
                debug!("dropping packet of {} bytes: {}", packet.len(), e);
                continue;
            }

            for record in records.iter() {
                self.stats.records += 1;
                match self.registry.dispatch(record) {
                    Dispatch::Delivered => {}
                    Dispatch::Dropped => self.stats.unhandled_records += 1,
                    Dispatch::Failed => self.stats.handler_errors += 1,
                }
            }
        }
    }

    fn publish(&mut self) {
        let framing = self.parser.stats();
        self.stats.packets = framing.packets;
        self.stats.checksum_errors = framing.checksum_errors;
        self.stats.oversized_lengths = framing.oversized_lengths;
        self.stats.discarded_bytes = framing.discarded_bytes;
        self.stats.overflow_bytes = framing.overflow_bytes;
        *self
            .shared_stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = self.stats;
    }
}
