//! In-process virtual device
//!
//! A scriptable stand-in for a UART: tests and the `--loopback` demo inject
//! inbound chunks, faults and hang-ups through a [`LoopbackDevice`] handle
//! and inspect everything the session wrote.

use super::{Channel, ChannelError, ChannelProvider, ChannelReader, ChannelWriter, LinkConfig};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Injected failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Device unplugged
    DeviceLost,
    /// Recoverable I/O error with a message
    Transient(String),
}

impl From<Fault> for ChannelError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::DeviceLost => ChannelError::DeviceLost("loopback device removed".to_string()),
            Fault::Transient(msg) => ChannelError::Io(std::io::Error::other(msg)),
        }
    }
}

enum Inbound {
    Chunk(Bytes),
    Fault(Fault),
    Hangup,
}

struct DeviceState {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    // Parked here whenever no reader holds it
    inbound_rx: Option<mpsc::UnboundedReceiver<Inbound>>,
    written: Vec<Bytes>,
    echo: bool,
    open: bool,
    config: Option<LinkConfig>,
    dismiss_next_selection: bool,
    reject_next_open: Option<String>,
    fail_next_write: Option<Fault>,
    write_delay: Option<Duration>,
    hang_on_close: bool,
    opens: usize,
    closes: usize,
    forgets: usize,
    discarded: usize,
}

/// Handle onto the virtual device
#[derive(Clone)]
pub struct LoopbackDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackDevice {
    /// Create a silent device
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                inbound_tx,
                inbound_rx: Some(inbound_rx),
                written: Vec::new(),
                echo: false,
                open: false,
                config: None,
                dismiss_next_selection: false,
                reject_next_open: None,
                fail_next_write: None,
                write_delay: None,
                hang_on_close: false,
                opens: 0,
                closes: 0,
                forgets: 0,
                discarded: 0,
            })),
        }
    }

    /// Create a device that echoes every write back as input
    pub fn echo() -> Self {
        let device = Self::new();
        device.state.lock().echo = true;
        device
    }

    /// Provider selecting this device
    pub fn provider(&self) -> LoopbackProvider {
        LoopbackProvider {
            device: self.clone(),
        }
    }

    /// Queue an inbound chunk
    pub fn inject(&self, data: impl Into<Bytes>) {
        let _ = self.state.lock().inbound_tx.send(Inbound::Chunk(data.into()));
    }

    /// Make the next read fail
    pub fn inject_fault(&self, fault: Fault) {
        let _ = self.state.lock().inbound_tx.send(Inbound::Fault(fault));
    }

    /// End the inbound stream
    pub fn hang_up(&self) {
        let _ = self.state.lock().inbound_tx.send(Inbound::Hangup);
    }

    /// Dismiss the next device selection
    pub fn dismiss_next_selection(&self) {
        self.state.lock().dismiss_next_selection = true;
    }

    /// Reject the next open with `reason`
    pub fn reject_next_open(&self, reason: &str) {
        self.state.lock().reject_next_open = Some(reason.to_string());
    }

    /// Fail the next write
    pub fn fail_next_write(&self, fault: Fault) {
        self.state.lock().fail_next_write = Some(fault);
    }

    /// Delay every write by `delay`
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.state.lock().write_delay = delay;
    }

    /// Make `close` never settle
    pub fn set_hang_on_close(&self, hang: bool) {
        self.state.lock().hang_on_close = hang;
    }

    /// Every write, in order
    pub fn written(&self) -> Vec<Bytes> {
        self.state.lock().written.clone()
    }

    /// All written bytes concatenated
    pub fn written_bytes(&self) -> Vec<u8> {
        self.state.lock().written.iter().flat_map(|b| b.iter().copied()).collect()
    }

    /// Number of writes
    pub fn write_count(&self) -> usize {
        self.state.lock().written.len()
    }

    /// Device currently open
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Framing used by the last open
    pub fn last_config(&self) -> Option<LinkConfig> {
        self.state.lock().config.clone()
    }

    /// Counts of (opens, closes, forgets)
    pub fn lifecycle_counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.opens, state.closes, state.forgets)
    }

    /// Stale chunks thrown away at open time
    pub fn discarded_chunks(&self) -> usize {
        self.state.lock().discarded
    }

    /// Reader currently out on loan
    pub fn reader_acquired(&self) -> bool {
        self.state.lock().inbound_rx.is_none()
    }
}

/// Provider that always selects its loopback device
#[derive(Clone)]
pub struct LoopbackProvider {
    device: LoopbackDevice,
}

#[async_trait]
impl ChannelProvider for LoopbackProvider {
    async fn request_device(&self, _config: &LinkConfig) -> Result<Box<dyn Channel>, ChannelError> {
        let mut state = self.device.state.lock();
        if std::mem::take(&mut state.dismiss_next_selection) {
            return Err(ChannelError::SelectionCancelled);
        }
        Ok(Box::new(LoopbackChannel {
            device: self.device.clone(),
        }))
    }
}

struct LoopbackChannel {
    device: LoopbackDevice,
}

#[async_trait]
impl Channel for LoopbackChannel {
    async fn open(&mut self, config: &LinkConfig) -> Result<(), ChannelError> {
        config.validate()?;
        let mut state = self.device.state.lock();
        if let Some(reason) = state.reject_next_open.take() {
            return Err(ChannelError::OpenRejected(reason));
        }
        if state.open {
            return Err(ChannelError::OpenRejected("device busy".to_string()));
        }
        state.open = true;
        state.opens += 1;
        state.config = Some(config.clone());
        Ok(())
    }

    async fn discard_input(&mut self) -> Result<usize, ChannelError> {
        let mut state = self.device.state.lock();
        let mut dropped = 0;
        if let Some(rx) = state.inbound_rx.as_mut() {
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
        }
        state.discarded += dropped;
        Ok(dropped)
    }

    fn acquire(&mut self) -> Result<(Box<dyn ChannelReader>, Box<dyn ChannelWriter>), ChannelError> {
        let mut state = self.device.state.lock();
        if !state.open {
            return Err(ChannelError::NotConnected);
        }
        let rx = state
            .inbound_rx
            .take()
            .ok_or_else(|| ChannelError::OpenRejected("reader already locked".to_string()))?;
        let reader = LoopbackReader {
            rx: Some(rx),
            device: self.device.clone(),
        };
        let writer = LoopbackWriter {
            device: self.device.clone(),
        };
        Ok((Box::new(reader), Box::new(writer)))
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        let hang = self.device.state.lock().hang_on_close;
        if hang {
            std::future::pending::<()>().await;
        }
        let mut state = self.device.state.lock();
        state.open = false;
        state.closes += 1;
        Ok(())
    }

    async fn forget(&mut self) -> Result<(), ChannelError> {
        let mut state = self.device.state.lock();
        state.open = false;
        state.forgets += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "loopback".to_string()
    }
}

struct LoopbackReader {
    rx: Option<mpsc::UnboundedReceiver<Inbound>>,
    device: LoopbackDevice,
}

#[async_trait]
impl ChannelReader for LoopbackReader {
    async fn read(&mut self) -> Result<Option<Bytes>, ChannelError> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };
        match rx.recv().await {
            Some(Inbound::Chunk(data)) => Ok(Some(data)),
            Some(Inbound::Fault(fault)) => Err(fault.into()),
            Some(Inbound::Hangup) | None => Ok(None),
        }
    }
}

impl Drop for LoopbackReader {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.device.state.lock().inbound_rx = Some(rx);
        }
    }
}

struct LoopbackWriter {
    device: LoopbackDevice,
}

#[async_trait]
impl ChannelWriter for LoopbackWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        let delay = self.device.state.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.device.state.lock();
        if !state.open {
            return Err(ChannelError::NotConnected);
        }
        if let Some(fault) = state.fail_next_write.take() {
            return Err(fault.into());
        }
        let data = Bytes::copy_from_slice(data);
        state.written.push(data.clone());
        if state.echo {
            let _ = state.inbound_tx.send(Inbound::Chunk(data));
        }
        Ok(())
    }
}
