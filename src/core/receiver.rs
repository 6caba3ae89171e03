//! Receive pipeline
//!
//! Drains the channel reader and regroups raw chunks into packets:
//! - Immediate mode forwards every chunk as one packet
//! - Buffered mode joins chunks that arrive within `threshold_ms` of each
//!   other, and flushes after an idle period or when the buffer would
//!   overflow `MAX_BUFFER_SIZE`
//!
//! The grouping rules live in [`Reassembler`], which is pure and takes the
//! clock as an argument. [`ReceivePipeline`] wires it to a reader, timers,
//! stall detection and the log aggregator.

use super::logger::LogAggregator;
use super::packet::{Packet, PacketDirection};
use super::session::{LinkStats, SessionEvent};
use super::transport::ChannelReader;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Upper bound for a buffered packet before a forced flush
pub const MAX_BUFFER_SIZE: usize = 16_384;

/// Threshold used when none (or zero) is configured
pub const DEFAULT_THRESHOLD_MS: u64 = 50;

/// Largest accepted threshold; larger values are clamped
pub const MAX_THRESHOLD_MS: u64 = 3_600_000;

/// Floor of the idle-flush timer
pub const MIN_IDLE_FLUSH_MS: u64 = 50;

/// A read pending this long raises the stall signal
pub const STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Transient read warnings clear themselves after this long
pub const WARNING_CLEAR_AFTER: Duration = Duration::from_secs(3);

/// Packetization settings; may change while connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveSettings {
    /// Buffered (timing) mode instead of immediate mode
    pub timing_enabled: bool,
    /// Inter-chunk gap, in milliseconds, that starts a new packet
    pub threshold_ms: u64,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            timing_enabled: true,
            threshold_ms: DEFAULT_THRESHOLD_MS,
        }
    }
}

impl ReceiveSettings {
    /// Effective threshold, falling back to the default for zero and
    /// capped at `MAX_THRESHOLD_MS`
    pub fn threshold(&self) -> Duration {
        let ms = match self.threshold_ms {
            0 => DEFAULT_THRESHOLD_MS,
            ms => ms.min(MAX_THRESHOLD_MS),
        };
        Duration::from_millis(ms)
    }

    /// Idle period after which a non-empty buffer is flushed
    pub fn idle_flush(&self) -> Duration {
        let threshold = self.threshold().as_millis() as u64;
        Duration::from_millis(threshold.saturating_add(10).max(MIN_IDLE_FLUSH_MS))
    }
}

/// Chunk-to-packet regrouping state
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: BytesMut,
    started_at: Option<DateTime<Local>>,
    last_arrival: Option<Instant>,
    idle_deadline: Option<Instant>,
}

impl Reassembler {
    /// Create an empty reassembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk that arrived at `now`; returns the packets it completes
    pub fn push(&mut self, chunk: Bytes, now: Instant, settings: &ReceiveSettings) -> Vec<Packet> {
        let mut out = Vec::new();
        if chunk.is_empty() {
            return out;
        }

        if !settings.timing_enabled {
            // Mode switched off with bytes still held: they go first
            out.extend(self.flush());
            out.extend(Packet::rx(chunk));
            return out;
        }

        if !self.buffer.is_empty() {
            let gap = self.last_arrival.map(|last| now.saturating_duration_since(last));
            if gap.is_some_and(|gap| gap > settings.threshold()) {
                out.extend(self.flush());
            }
        }
        if !self.buffer.is_empty() && self.buffer.len() + chunk.len() > MAX_BUFFER_SIZE {
            out.extend(self.flush());
        }

        if self.buffer.is_empty() {
            self.started_at = Some(Local::now());
        }
        self.buffer.extend_from_slice(&chunk);
        self.last_arrival = Some(now);
        self.idle_deadline = Some(now + settings.idle_flush());
        out
    }

    /// Emit whatever is buffered
    pub fn flush(&mut self) -> Option<Packet> {
        self.idle_deadline = None;
        if self.buffer.is_empty() {
            return None;
        }
        let data = self.buffer.split().freeze();
        let timestamp = self.started_at.take().unwrap_or_else(Local::now);
        Packet::at(PacketDirection::Rx, data, timestamp)
    }

    /// When the idle-flush timer fires, if armed
    pub fn idle_deadline(&self) -> Option<Instant> {
        if self.buffer.is_empty() {
            None
        } else {
            self.idle_deadline
        }
    }

    /// Bytes currently held
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Why the pipeline stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineExit {
    /// Cancelled by the connection manager
    Cancelled,
    /// Reader reported end of stream
    EndOfStream,
    /// Fatal channel error
    DeviceLost(String),
}

impl PipelineExit {
    /// The link must be torn down from the pipeline side
    pub fn needs_teardown(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// Where finished RX packets go
#[derive(Clone)]
pub(crate) struct PacketSink {
    pub(crate) stats: Arc<RwLock<LinkStats>>,
    pub(crate) log: LogAggregator,
    pub(crate) events: broadcast::Sender<SessionEvent>,
}

impl PacketSink {
    fn deliver(&self, packet: Packet) {
        let snapshot = {
            let mut stats = self.stats.write();
            stats.rx_bytes += packet.len() as u64;
            *stats
        };
        tracing::debug!("RX packet: {} bytes", packet.len());
        let _ = self.events.send(SessionEvent::Stats(snapshot));
        self.log.queue(packet);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Read loop owning the exclusive reader
pub(crate) struct ReceivePipeline {
    reader: Box<dyn ChannelReader>,
    reassembler: Reassembler,
    settings: Arc<RwLock<ReceiveSettings>>,
    sink: PacketSink,
}

impl ReceivePipeline {
    pub(crate) fn new(
        reader: Box<dyn ChannelReader>,
        settings: Arc<RwLock<ReceiveSettings>>,
        sink: PacketSink,
    ) -> Self {
        Self {
            reader,
            reassembler: Reassembler::new(),
            settings,
            sink,
        }
    }

    /// Run until cancelled or the channel fails. The reader is dropped
    /// (released) when this returns.
    pub(crate) async fn run(mut self, cancel: CancellationToken) -> PipelineExit {
        let mut read_started = Instant::now();
        let mut stalled = false;
        let mut warning_until: Option<Instant> = None;

        let exit = loop {
            let idle = self.reassembler.idle_deadline();
            let stall_at = read_started + STALL_TIMEOUT;

            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    if let Err(e) = self.reader.cancel().await {
                        tracing::warn!("Reader cancel failed: {}", e);
                    }
                    break PipelineExit::Cancelled;
                }

                result = self.reader.read() => {
                    read_started = Instant::now();
                    if stalled {
                        stalled = false;
                        self.sink.emit(SessionEvent::Stalled(false));
                    }
                    match result {
                        Ok(Some(chunk)) => self.accept(chunk),
                        Ok(None) => break PipelineExit::EndOfStream,
                        Err(e) if e.is_device_lost() => {
                            tracing::error!("Read error: {}", e);
                            break PipelineExit::DeviceLost(e.to_string());
                        }
                        Err(e) => {
                            tracing::warn!("Read error: {}", e);
                            self.sink.emit(SessionEvent::Warning(Some(e.to_string())));
                            warning_until = Some(Instant::now() + WARNING_CLEAR_AFTER);
                        }
                    }
                }

                () = sleep_until(idle.unwrap_or(read_started)), if idle.is_some() => {
                    if let Some(packet) = self.reassembler.flush() {
                        self.sink.deliver(packet);
                    }
                }

                () = sleep_until(stall_at), if !stalled => {
                    tracing::warn!("No data for {:?}; link may be stalled", STALL_TIMEOUT);
                    stalled = true;
                    self.sink.emit(SessionEvent::Stalled(true));
                }

                () = sleep_until(warning_until.unwrap_or(read_started)), if warning_until.is_some() => {
                    warning_until = None;
                    self.sink.emit(SessionEvent::Warning(None));
                }
            }

            tokio::task::yield_now().await;
        };

        if let Some(packet) = self.reassembler.flush() {
            self.sink.deliver(packet);
        }
        if stalled {
            self.sink.emit(SessionEvent::Stalled(false));
        }
        if warning_until.is_some() {
            self.sink.emit(SessionEvent::Warning(None));
        }
        tracing::debug!("Receive pipeline stopped: {:?}", exit);
        exit
    }

    fn accept(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        tracing::trace!("RX chunk: {} bytes", chunk.len());
        let settings = *self.settings.read();
        for packet in self.reassembler.push(chunk, Instant::now(), &settings) {
            self.sink.deliver(packet);
        }
    }
}
