//! Traffic log aggregation
//!
//! Packets from both directions are queued, rendered in batches into both
//! views, and appended to two histories:
//! - display history: trailing window capped at `max_lines` (0 = unbounded)
//! - export history: everything since the last `clear()`
//!
//! Batches are published to subscribers in queue order.

use crate::core::codec::{display_text, encode_hex, CodecType};
use crate::core::packet::{Packet, PacketDirection};
use crate::core::receiver::MAX_BUFFER_SIZE;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

/// Delay between a first queued packet and the batch flush
pub const LOG_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Pending entries above this count force an immediate flush
pub const MAX_PENDING_ENTRIES: usize = 50;

/// One rendered packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Packet timestamp
    pub timestamp: DateTime<Local>,
    /// Direction
    pub direction: PacketDirection,
    /// Hex rendering
    pub hex: String,
    /// Display-safe text rendering
    pub text: String,
}

impl LogEntry {
    /// Render both views of `packet`
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            timestamp: packet.timestamp(),
            direction: packet.direction(),
            hex: encode_hex(packet.data()),
            text: display_text(packet.data()),
        }
    }

    /// Rendering for `view`
    pub fn payload(&self, view: CodecType) -> &str {
        match view {
            CodecType::Hex => &self.hex,
            CodecType::Text => &self.text,
        }
    }

    /// `HH:MM:SS.mmm`
    pub fn time_label(&self) -> String {
        self.timestamp.format("%H:%M:%S%.3f").to_string()
    }

    /// One export line: `[HH:MM:SS.mmm] RX: payload`
    pub fn to_export_line(&self, view: CodecType) -> String {
        format!(
            "[{}] {}: {}",
            self.time_label(),
            self.direction,
            self.payload(view)
        )
    }
}

/// A flushed batch, in arrival order
pub type LogBatch = Arc<Vec<Arc<LogEntry>>>;

#[derive(Default)]
struct LogState {
    pending: Vec<Packet>,
    pending_bytes: usize,
    display: VecDeque<Arc<LogEntry>>,
    export: Vec<Arc<LogEntry>>,
    max_lines: usize,
    // Ticket of the armed flush timer; a fired timer with a stale ticket is a no-op
    scheduled: Option<u64>,
    tickets: u64,
}

impl LogState {
    fn trim_display(&mut self) {
        if self.max_lines == 0 {
            return;
        }
        while self.display.len() > self.max_lines {
            self.display.pop_front();
        }
    }

    fn flush(&mut self, batches: &broadcast::Sender<LogBatch>) {
        self.scheduled = None;
        if self.pending.is_empty() {
            return;
        }

        let packets = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;

        let batch: Vec<Arc<LogEntry>> = packets
            .iter()
            .map(|packet| Arc::new(LogEntry::from_packet(packet)))
            .collect();

        self.export.extend(batch.iter().cloned());
        self.display.extend(batch.iter().cloned());
        self.trim_display();

        tracing::trace!("Flushed {} log entries", batch.len());
        // Sent under the lock so concurrent flushes publish in order
        let _ = batches.send(Arc::new(batch));
    }
}

/// Batched dual-view log with bounded display and unbounded export history
#[derive(Clone)]
pub struct LogAggregator {
    state: Arc<Mutex<LogState>>,
    batches: broadcast::Sender<LogBatch>,
}

impl Default for LogAggregator {
    fn default() -> Self {
        Self::new(0)
    }
}

impl LogAggregator {
    /// Create an aggregator keeping at most `max_lines` display entries
    pub fn new(max_lines: usize) -> Self {
        let (batches, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(LogState {
                max_lines,
                ..LogState::default()
            })),
            batches,
        }
    }

    /// Subscribe to flushed batches
    pub fn subscribe(&self) -> broadcast::Receiver<LogBatch> {
        self.batches.subscribe()
    }

    /// Queue a packet for the next batch
    pub fn queue(&self, packet: Packet) {
        let mut state = self.state.lock();
        state.pending_bytes += packet.len();
        state.pending.push(packet);

        if state.pending.len() > MAX_PENDING_ENTRIES || state.pending_bytes > MAX_BUFFER_SIZE {
            state.flush(&self.batches);
            return;
        }

        if state.scheduled.is_some() {
            return;
        }
        // Outside a runtime there is no timer: entries wait for an explicit
        // `flush()` or export
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        state.tickets += 1;
        let ticket = state.tickets;
        state.scheduled = Some(ticket);
        drop(state);
        self.schedule(&runtime, ticket);
    }

    fn schedule(&self, runtime: &tokio::runtime::Handle, ticket: u64) {
        let state: Weak<Mutex<LogState>> = Arc::downgrade(&self.state);
        let batches = self.batches.clone();
        runtime.spawn(async move {
            tokio::time::sleep(LOG_FLUSH_INTERVAL).await;
            if let Some(state) = state.upgrade() {
                let mut state = state.lock();
                if state.scheduled == Some(ticket) {
                    state.flush(&batches);
                }
            }
        });
    }

    /// Render and publish everything pending now
    pub fn flush(&self) {
        self.state.lock().flush(&self.batches);
    }

    /// Empty pending, display and export histories
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.pending_bytes = 0;
        state.display.clear();
        state.export.clear();
        state.scheduled = None;
    }

    /// Change the display cap (0 = unbounded)
    pub fn set_max_lines(&self, max_lines: usize) {
        let mut state = self.state.lock();
        state.max_lines = max_lines;
        state.trim_display();
    }

    /// Display cap
    pub fn max_lines(&self) -> usize {
        self.state.lock().max_lines
    }

    /// Snapshot of the display history
    pub fn display(&self) -> Vec<Arc<LogEntry>> {
        self.state.lock().display.iter().cloned().collect()
    }

    /// Snapshot of the export history
    pub fn history(&self) -> Vec<Arc<LogEntry>> {
        self.state.lock().export.clone()
    }

    /// Entries in the display history
    pub fn display_len(&self) -> usize {
        self.state.lock().display.len()
    }

    /// Entries in the export history
    pub fn export_len(&self) -> usize {
        self.state.lock().export.len()
    }

    /// Packets waiting for the next flush
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Full history rendered in `view`, one line per entry
    pub fn export_text(&self, view: CodecType) -> String {
        let mut state = self.state.lock();
        state.flush(&self.batches);

        let mut result = String::new();
        for entry in &state.export {
            result.push_str(&entry.to_export_line(view));
            result.push('\n');
        }
        result
    }

    /// Write the export artifact into `dir`; returns its path
    pub fn export_to_dir(&self, view: CodecType, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(export_filename(view, Local::now()));
        std::fs::write(&path, self.export_text(view))?;
        tracing::info!("Exported {} entries to {}", self.export_len(), path.display());
        Ok(path)
    }
}

/// Export filename embedding the view and a sortable timestamp
pub fn export_filename(view: CodecType, at: DateTime<Local>) -> String {
    format!("uart-log-{}-{}.txt", view.name(), at.format("%Y-%m-%dT%H-%M-%S"))
}
