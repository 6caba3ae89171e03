//! Session management for a single UART link
//!
//! A [`Session`] owns the link lifecycle:
//! - `open` selects and opens a device, drains stale input, takes the
//!   exclusive reader/writer and starts the receive pipeline
//! - `close` tears everything down with bounded waits and never fails; a
//!   close issued while `open` is still selecting or opening aborts it
//!
//! Every exit path of `open`/`close` releases the channel, reader and writer.
//! Only one link can be up per session.

use super::codec::{create_codec, CodecError, CodecType, LineEnding};
use super::logger::LogAggregator;
use super::packet::Packet;
use super::receiver::{PacketSink, PipelineExit, ReceivePipeline, ReceiveSettings};
use super::sequencer::RunReport;
use super::transport::{Channel, ChannelError, ChannelProvider, ChannelWriter, LinkConfig};
use bytes::Bytes;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Bound on stopping the receive pipeline
pub const READER_CANCEL_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on reclaiming the writer from an in-flight write
pub const WRITER_RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on closing the channel before falling back to `forget`
pub const CHANNEL_CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on waiting for a concurrent open or close to finish
pub const LIFECYCLE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Display cap used by [`Session::new`]
pub const DEFAULT_MAX_LINES: usize = 1000;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Selecting and opening the device
    Connecting,
    /// Connected and active
    Connected,
    /// Teardown in progress
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnecting => "Disconnecting",
        })
    }
}

/// Byte counters; survive disconnects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Bytes received
    pub rx_bytes: u64,
    /// Bytes sent
    pub tx_bytes: u64,
}

/// Session events
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// State changed
    StateChanged(SessionState),
    /// Link configuration inputs locked (true) or editable again
    InputsLocked(bool),
    /// Counters updated
    Stats(LinkStats),
    /// Read pending for too long, or recovered
    Stalled(bool),
    /// Transient link warning, `None` when cleared
    Warning(Option<String>),
    /// Surfaced failure
    Error(String),
    /// A script run began
    ScriptStarted {
        /// Commands in the script
        commands: usize,
    },
    /// A script run ended
    ScriptFinished(Result<RunReport, String>),
}

/// Result of a successful `open` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Link is up
    Connected,
    /// Operator dismissed the device chooser
    Cancelled,
}

/// Manual send failure
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Operator input did not decode
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Link refused the write
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

type WriterSlot = Arc<Mutex<Option<Box<dyn ChannelWriter>>>>;

struct ReceiverTask {
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Link {
    channel: Option<Box<dyn Channel>>,
    receiver: Option<ReceiverTask>,
    writer: Option<LinkWriter>,
    token: CancellationToken,
}

struct SessionInner {
    provider: Box<dyn ChannelProvider>,
    state: RwLock<SessionState>,
    inputs_locked: AtomicBool,
    lifecycle: Mutex<Link>,
    opening: RwLock<Option<CancellationToken>>,
    current_writer: RwLock<Option<LinkWriter>>,
    stats: Arc<RwLock<LinkStats>>,
    link_config: RwLock<Option<LinkConfig>>,
    receive: Arc<RwLock<ReceiveSettings>>,
    line_ending: RwLock<LineEnding>,
    log: LogAggregator,
    events: broadcast::Sender<SessionEvent>,
    generation: AtomicU64,
}

/// Connection manager
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a disconnected session over `provider`
    pub fn new(provider: impl ChannelProvider + 'static) -> Self {
        Self::with_log(provider, LogAggregator::new(DEFAULT_MAX_LINES))
    }

    /// Create a session feeding an existing aggregator
    pub fn with_log(provider: impl ChannelProvider + 'static, log: LogAggregator) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(SessionInner {
                provider: Box::new(provider),
                state: RwLock::new(SessionState::Disconnected),
                inputs_locked: AtomicBool::new(false),
                lifecycle: Mutex::new(Link::default()),
                opening: RwLock::new(None),
                current_writer: RwLock::new(None),
                stats: Arc::new(RwLock::new(LinkStats::default())),
                link_config: RwLock::new(None),
                receive: Arc::new(RwLock::new(ReceiveSettings::default())),
                line_ending: RwLock::new(LineEnding::default()),
                log,
                events,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Link configuration inputs must stay disabled
    pub fn inputs_locked(&self) -> bool {
        self.inner.inputs_locked.load(Ordering::SeqCst)
    }

    /// Snapshot of the configuration the active link was opened with
    pub fn link_config(&self) -> Option<LinkConfig> {
        self.inner.link_config.read().clone()
    }

    /// Byte counters
    pub fn stats(&self) -> LinkStats {
        *self.inner.stats.read()
    }

    /// Traffic log
    pub fn log(&self) -> &LogAggregator {
        &self.inner.log
    }

    /// Receive packetization settings
    pub fn receive_settings(&self) -> ReceiveSettings {
        *self.inner.receive.read()
    }

    /// Change packetization; applies to the next chunk
    pub fn set_receive_settings(&self, settings: ReceiveSettings) {
        *self.inner.receive.write() = settings;
    }

    /// Line terminator for sends
    pub fn line_ending(&self) -> LineEnding {
        *self.inner.line_ending.read()
    }

    /// Set the line terminator for sends
    pub fn set_line_ending(&self, ending: LineEnding) {
        *self.inner.line_ending.write() = ending;
    }

    /// Writer of the active link
    pub fn writer(&self) -> Option<LinkWriter> {
        self.inner.current_writer.read().clone()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    fn set_state(&self, state: SessionState) {
        *self.inner.state.write() = state;
        tracing::debug!("Session state: {}", state);
        self.emit(SessionEvent::StateChanged(state));
    }

    fn set_inputs_locked(&self, locked: bool) {
        self.inner.inputs_locked.store(locked, Ordering::SeqCst);
        self.emit(SessionEvent::InputsLocked(locked));
    }

    /// Select, open and arm a link.
    ///
    /// A dismissed device chooser, or a `close` racing the open, is
    /// `Ok(OpenOutcome::Cancelled)`. Every other failure rolls back to
    /// `Disconnected` and is also broadcast as [`SessionEvent::Error`].
    pub async fn open(&self, config: LinkConfig) -> Result<OpenOutcome, ChannelError> {
        config.validate()?;

        let mut link = self.inner.lifecycle.lock().await;
        {
            let mut state = self.inner.state.write();
            if *state != SessionState::Disconnected {
                return Err(ChannelError::AlreadyConnected);
            }
            *state = SessionState::Connecting;
        }
        let aborted = CancellationToken::new();
        *self.inner.opening.write() = Some(aborted.clone());
        self.emit(SessionEvent::StateChanged(SessionState::Connecting));

        let result = tokio::select! {
            result = self.establish(&mut link, &config) => result,
            _ = aborted.cancelled() => {
                tracing::info!("Open aborted by close");
                Err(ChannelError::SelectionCancelled)
            }
        };
        self.inner.opening.write().take();

        match result {
            Ok(()) => {
                *self.inner.link_config.write() = Some(config);
                self.set_state(SessionState::Connected);
                self.set_inputs_locked(true);
                tracing::info!("Connected: {}", link.channel.as_ref().map(|c| c.describe()).unwrap_or_default());
                Ok(OpenOutcome::Connected)
            }
            Err(e) => {
                self.release(&mut link, true).await;
                self.set_state(SessionState::Disconnected);
                if e.is_cancellation() {
                    tracing::info!("Device selection dismissed");
                    Ok(OpenOutcome::Cancelled)
                } else {
                    tracing::error!("Failed to connect: {}", e);
                    self.emit(SessionEvent::Error(format!("Failed to connect: {e}")));
                    Err(e)
                }
            }
        }
    }

    async fn establish(&self, link: &mut Link, config: &LinkConfig) -> Result<(), ChannelError> {
        let channel = self.inner.provider.request_device(config).await?;
        let channel = link.channel.insert(channel);
        channel.open(config).await?;

        let stale = channel.discard_input().await?;
        if stale > 0 {
            tracing::debug!("Discarded {} stale input chunk(s)", stale);
        }

        let (reader, writer) = channel.acquire()?;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        link.token = token.clone();

        let link_writer = LinkWriter {
            slot: Arc::new(Mutex::new(Some(writer))),
            stats: self.inner.stats.clone(),
            log: self.inner.log.clone(),
            events: self.inner.events.clone(),
            closed: token.clone(),
            session: Arc::downgrade(&self.inner),
            generation,
        };
        link.writer = Some(link_writer.clone());
        *self.inner.current_writer.write() = Some(link_writer);

        let sink = PacketSink {
            stats: self.inner.stats.clone(),
            log: self.inner.log.clone(),
            events: self.inner.events.clone(),
        };
        let pipeline = ReceivePipeline::new(reader, self.inner.receive.clone(), sink);
        let session = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let exit = pipeline.run(token).await;
            if !exit.needs_teardown() {
                return;
            }
            let Some(inner) = session.upgrade() else {
                return;
            };
            let session = Session { inner };
            match &exit {
                PipelineExit::DeviceLost(reason) => {
                    session.emit(SessionEvent::Error(format!("Device disconnected: {reason}")));
                }
                _ => tracing::info!("Device closed the stream"),
            }
            // Closing awaits this task, so it runs detached
            tokio::spawn(async move {
                session.close_link(false, Some(generation)).await;
            });
        });
        link.receiver = Some(ReceiverTask { handle });
        Ok(())
    }

    /// Tear the link down. Idempotent, never fails.
    ///
    /// `force` aborts the receive pipeline instead of waiting for it to wind
    /// down.
    pub async fn close(&self, force: bool) {
        self.close_link(force, None).await;
    }

    async fn close_link(&self, force: bool, generation: Option<u64>) {
        if generation.is_none() {
            if let Some(opening) = self.inner.opening.read().as_ref() {
                opening.cancel();
            }
        }
        let Ok(mut link) = timeout(LIFECYCLE_LOCK_TIMEOUT, self.inner.lifecycle.lock()).await else {
            tracing::warn!("Close gave up waiting for the link after {:?}", LIFECYCLE_LOCK_TIMEOUT);
            return;
        };
        if generation.is_some_and(|g| g != self.inner.generation.load(Ordering::SeqCst)) {
            return;
        }
        {
            let mut state = self.inner.state.write();
            if *state == SessionState::Disconnected {
                return;
            }
            *state = SessionState::Disconnecting;
        }
        self.emit(SessionEvent::StateChanged(SessionState::Disconnecting));

        self.release(&mut link, force).await;

        *self.inner.link_config.write() = None;
        self.set_state(SessionState::Disconnected);
        self.set_inputs_locked(false);
        self.emit(SessionEvent::Stalled(false));
        self.emit(SessionEvent::Warning(None));
        tracing::info!("Disconnected");
    }

    async fn release(&self, link: &mut Link, force: bool) {
        link.token.cancel();
        *self.inner.current_writer.write() = None;

        if let Some(task) = link.receiver.take() {
            let mut handle = task.handle;
            if force {
                handle.abort();
            }
            if timeout(READER_CANCEL_TIMEOUT, &mut handle).await.is_err() {
                tracing::warn!("Reader cancel timed out after {:?}", READER_CANCEL_TIMEOUT);
                handle.abort();
            }
        }

        if let Some(writer) = link.writer.take() {
            writer.release().await;
        }

        if let Some(mut channel) = link.channel.take() {
            match timeout(CHANNEL_CLOSE_TIMEOUT, channel.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Channel close failed: {}", e);
                    forget(channel.as_mut()).await;
                }
                Err(_) => {
                    tracing::warn!("Channel close timed out after {:?}", CHANNEL_CLOSE_TIMEOUT);
                    forget(channel.as_mut()).await;
                }
            }
        }
    }

    /// Send raw bytes as-is
    pub async fn send(&self, data: Bytes) -> Result<(), SendError> {
        let writer = self.writer().ok_or(ChannelError::NotConnected)?;
        writer.write(data).await?;
        Ok(())
    }

    /// Decode operator input with the `codec` view and send it followed by
    /// the line terminator. Nothing is written when the input does not decode.
    pub async fn send_as(&self, codec: CodecType, text: &str) -> Result<(), SendError> {
        let codec = create_codec(codec);
        let decoded = codec.decode(text)?;
        tracing::trace!("Sending {} bytes as {}", decoded.len(), codec.codec_type());
        let data = self.line_ending().terminate(&decoded);
        self.send(data).await
    }

    /// Send `text` followed by the line terminator
    pub async fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.send_as(CodecType::Text, text).await
    }

    /// Decode `text` as hex and send it followed by the line terminator
    pub async fn send_hex(&self, text: &str) -> Result<(), SendError> {
        self.send_as(CodecType::Hex, text).await
    }

    /// Reset both byte counters
    pub fn reset_stats(&self) {
        let snapshot = {
            let mut stats = self.inner.stats.write();
            *stats = LinkStats::default();
            *stats
        };
        self.emit(SessionEvent::Stats(snapshot));
    }
}

async fn forget(channel: &mut dyn Channel) {
    if let Err(e) = channel.forget().await {
        tracing::warn!("Channel forget failed: {}", e);
    }
}

/// Shared handle onto the exclusive writer of one link.
///
/// Every successful write bumps `tx_bytes` and logs a TX packet. A write
/// that reports device loss tears the link down.
#[derive(Clone)]
pub struct LinkWriter {
    slot: WriterSlot,
    stats: Arc<RwLock<LinkStats>>,
    log: LogAggregator,
    events: broadcast::Sender<SessionEvent>,
    closed: CancellationToken,
    session: Weak<SessionInner>,
    generation: u64,
}

impl LinkWriter {
    /// Write `data` in full
    pub async fn write(&self, data: Bytes) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::NotConnected);
        }
        if data.is_empty() {
            return Ok(());
        }

        let result = {
            let mut slot = self.slot.lock().await;
            let writer = slot.as_mut().ok_or(ChannelError::NotConnected)?;
            writer.write(&data).await
        };

        match result {
            Ok(()) => {
                let snapshot = {
                    let mut stats = self.stats.write();
                    stats.tx_bytes += data.len() as u64;
                    *stats
                };
                tracing::debug!("TX packet: {} bytes", data.len());
                self.notify(SessionEvent::Stats(snapshot));
                if let Some(packet) = Packet::tx(data) {
                    self.log.queue(packet);
                }
                Ok(())
            }
            Err(e) => {
                if e.is_device_lost() {
                    tracing::error!("Write error: {}", e);
                    self.notify(SessionEvent::Error(format!("Device disconnected: {e}")));
                    self.teardown();
                }
                Err(e)
            }
        }
    }

    /// Link already closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the link closes
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Broadcast a session event
    pub fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn teardown(&self) {
        let Some(inner) = self.session.upgrade() else {
            return;
        };
        let session = Session { inner };
        let generation = self.generation;
        tokio::spawn(async move {
            session.close_link(false, Some(generation)).await;
        });
    }

    async fn release(&self) {
        match timeout(WRITER_RELEASE_TIMEOUT, self.slot.lock()).await {
            Ok(mut slot) => {
                slot.take();
            }
            Err(_) => {
                tracing::warn!("Writer busy after {:?}; releasing when the write settles", WRITER_RELEASE_TIMEOUT);
                let slot = self.slot.clone();
                tokio::spawn(async move {
                    slot.lock().await.take();
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{Fault, LoopbackDevice, MockChannelProvider};

    async fn connected(device: &LoopbackDevice) -> Session {
        let session = Session::new(device.provider());
        session.set_line_ending(LineEnding::None);
        let outcome = session.open(LinkConfig::default()).await.unwrap();
        assert_eq!(outcome, OpenOutcome::Connected);
        session
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[SessionEvent]) -> Vec<SessionState> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_open_close_lifecycle() {
        let device = LoopbackDevice::new();
        device.inject(&b"stale"[..]);
        let session = Session::new(device.provider());
        let mut rx = session.subscribe();

        session.open(LinkConfig::new(9600)).await.unwrap();
        assert!(session.is_connected());
        assert!(session.inputs_locked());
        assert_eq!(session.link_config().unwrap().baud_rate, 9600);
        assert_eq!(device.discarded_chunks(), 1);
        assert!(device.reader_acquired());

        session.close(false).await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.inputs_locked());
        assert!(session.writer().is_none());
        assert!(session.link_config().is_none());
        assert!(!device.is_open());
        assert!(!device.reader_acquired());

        use SessionState::*;
        assert_eq!(
            states(&drain(&mut rx)),
            vec![Connecting, Connected, Disconnecting, Disconnected]
        );
    }

    #[tokio::test]
    async fn test_second_open_rejected() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        let err = session.open(LinkConfig::default()).await.unwrap_err();
        assert!(matches!(err, ChannelError::AlreadyConnected));
        assert!(session.is_connected());
        session.close(false).await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        session.close(false).await;
        session.close(false).await;
        session.close(true).await;
        assert_eq!(device.lifecycle_counts(), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_dismissed_chooser_is_silent() {
        let device = LoopbackDevice::new();
        device.dismiss_next_selection();
        let session = Session::new(device.provider());
        let mut rx = session.subscribe();

        let outcome = session.open(LinkConfig::default()).await.unwrap();
        assert_eq!(outcome, OpenOutcome::Cancelled);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!drain(&mut rx).iter().any(|e| matches!(e, SessionEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_provider_failure_rolls_back() {
        let mut provider = MockChannelProvider::new();
        provider
            .expect_request_device()
            .times(1)
            .returning(|_| Err(ChannelError::DeviceUnavailable("no ports".to_string())));
        let session = Session::new(provider);
        let mut rx = session.subscribe();

        let err = session.open(LinkConfig::default()).await.unwrap_err();
        assert!(matches!(err, ChannelError::DeviceUnavailable(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.inputs_locked());

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, SessionEvent::Error(_))));
        assert_eq!(
            states(&events),
            vec![SessionState::Connecting, SessionState::Disconnected]
        );
    }

    #[tokio::test]
    async fn test_rejected_open_releases_device() {
        let device = LoopbackDevice::new();
        device.reject_next_open("framing not supported");
        let session = Session::new(device.provider());

        let err = session.open(LinkConfig::default()).await.unwrap_err();
        assert!(matches!(err, ChannelError::OpenRejected(_)));
        assert!(!device.is_open());
        assert!(!device.reader_acquired());

        // A later attempt succeeds from a clean slate
        session.open(LinkConfig::default()).await.unwrap();
        assert!(session.is_connected());
        session.close(false).await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_selection() {
        let mut provider = MockChannelProvider::new();
        provider.expect_request_device().never();
        let session = Session::new(provider);
        let err = session.open(LinkConfig::new(20_000_000)).await.unwrap_err();
        assert!(matches!(err, ChannelError::InvalidConfiguration(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_hex_without_terminator() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;

        session.send_hex("41 42 0D 0A").await.unwrap();
        assert_eq!(device.written_bytes(), vec![0x41, 0x42, 0x0D, 0x0A]);
        assert_eq!(session.stats().tx_bytes, 4);

        session.log().flush();
        let entries = session.log().history();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload(CodecType::Hex), "41 42 0D 0A");
        assert_eq!(entries[0].payload(CodecType::Text), "AB␍␊");
        session.close(false).await;
    }

    #[tokio::test]
    async fn test_send_appends_terminator() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        session.set_line_ending(LineEnding::CrLf);

        session.send_text("AT").await.unwrap();
        session.send_hex("01").await.unwrap();
        assert_eq!(device.written_bytes(), b"AT\r\n\x01\r\n");
        session.close(false).await;
    }

    #[tokio::test]
    async fn test_send_as_decodes_with_view() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        session.set_line_ending(LineEnding::Lf);

        session.send_as(CodecType::Hex, "ff 00").await.unwrap();
        session.send_as(CodecType::Text, "41").await.unwrap();
        assert_eq!(device.written_bytes(), b"\xFF\x00\n41\n");

        let err = session.send_as(CodecType::Hex, "   ").await.unwrap_err();
        assert!(matches!(err, SendError::Codec(CodecError::Empty)));
        assert_eq!(device.write_count(), 2);
        session.close(false).await;
    }

    #[tokio::test]
    async fn test_invalid_hex_writes_nothing() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;

        let err = session.send_hex("41 4G 123").await.unwrap_err();
        match err {
            SendError::Codec(CodecError::InvalidHexTokens(tokens)) => {
                assert_eq!(tokens, vec!["4G".to_string(), "123".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(device.write_count(), 0);
        assert!(session.is_connected());
        session.close(false).await;
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let session = Session::new(LoopbackDevice::new().provider());
        let err = session.send_text("hi").await.unwrap_err();
        assert!(matches!(err, SendError::Channel(ChannelError::NotConnected)));
    }

    #[tokio::test]
    async fn test_counters_survive_close() {
        let device = LoopbackDevice::echo();
        let session = connected(&device).await;
        session.send_text("ping").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = session.stats();
        assert_eq!(stats.tx_bytes, 4);
        assert_eq!(stats.rx_bytes, 4);
        session.close(false).await;
        assert_eq!(session.stats(), stats);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_close_falls_back_to_forget() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        device.set_hang_on_close(true);

        let started = tokio::time::Instant::now();
        session.close(false).await;
        assert!(started.elapsed() <= CHANNEL_CLOSE_TIMEOUT + READER_CANCEL_TIMEOUT);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(device.lifecycle_counts(), (1, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_loss_on_read_closes() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        let mut rx = session.subscribe();

        device.inject(&b"tail"[..]);
        device.inject_fault(Fault::DeviceLost);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!device.is_open());
        assert!(drain(&mut rx).iter().any(|e| matches!(e, SessionEvent::Error(_))));

        session.log().flush();
        assert_eq!(session.log().export_len(), 1);

        // Reconnect after the device comes back
        session.open(LinkConfig::default()).await.unwrap();
        assert!(session.is_connected());
        session.close(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_loss_on_write_closes() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        device.fail_next_write(Fault::DeviceLost);

        let err = session.send_text("x").await.unwrap_err();
        assert!(matches!(err, SendError::Channel(ChannelError::DeviceLost(_))));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_teardown_ignores_new_link() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        let old_writer = session.writer().unwrap();

        session.close(false).await;
        session.open(LinkConfig::default()).await.unwrap();

        old_writer.teardown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.is_connected());
        assert!(old_writer.is_closed());
        session.close(false).await;
    }

    struct StuckProvider;

    #[async_trait::async_trait]
    impl ChannelProvider for StuckProvider {
        async fn request_device(&self, _config: &LinkConfig) -> Result<Box<dyn Channel>, ChannelError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_aborts_pending_open() {
        let session = Session::new(StuckProvider);
        let mut rx = session.subscribe();
        let opener = session.clone();
        let handle = tokio::spawn(async move { opener.open(LinkConfig::default()).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state(), SessionState::Connecting);

        let closed = timeout(Duration::from_secs(1), session.close(false)).await;
        assert!(closed.is_ok());
        assert_eq!(handle.await.unwrap().unwrap(), OpenOutcome::Cancelled);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.inputs_locked());
        assert!(!drain(&mut rx).iter().any(|e| matches!(e, SessionEvent::Error(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_gives_up_on_held_lifecycle() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;

        let held = session.inner.lifecycle.lock().await;
        let started = tokio::time::Instant::now();
        session.close(false).await;
        assert!(started.elapsed() >= LIFECYCLE_LOCK_TIMEOUT);
        assert!(session.is_connected());

        drop(held);
        session.close(false).await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
