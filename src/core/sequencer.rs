//! Command sequencer
//!
//! Replays a [`Script`] through a [`LinkWriter`], strictly in order. At most
//! one run is active per sequencer. `stop()` never interrupts a write that
//! is already in flight; it only keeps the next wait or write from starting.

use super::codec::LineEnding;
use super::script::{Repeat, Script};
use super::session::{LinkWriter, SessionEvent};
use super::transport::ChannelError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every command ran to completion
    Completed,
    /// `stop()` was called
    Stopped,
    /// The link went down underneath the run
    LinkClosed,
}

/// Summary of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Writes performed
    pub writes: u64,
    /// Bytes written
    pub bytes: u64,
    /// How the run ended
    pub outcome: RunOutcome,
}

/// Script runtime errors
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Another run is active
    #[error("A script is already running")]
    AlreadyRunning,

    /// No link to write to
    #[error("Please connect to UART first")]
    NotConnected,

    /// A write failed; the run was aborted
    #[error("Command {command} failed: {source}")]
    Write {
        /// Zero-based command index
        command: usize,
        /// Cause
        source: ChannelError,
    },
}

/// Position of the active run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunProgress {
    /// Command being executed
    pub command: usize,
    /// Completed repetitions of that command
    pub repeat: u64,
}

#[derive(Default)]
struct RunState {
    stop: Option<CancellationToken>,
    progress: RunProgress,
}

/// Runs one script at a time
#[derive(Clone, Default)]
pub struct CommandSequencer {
    running: Arc<AtomicBool>,
    run: Arc<Mutex<RunState>>,
}

struct RunningGuard<'a> {
    sequencer: &'a CommandSequencer,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.sequencer.run.lock() = RunState::default();
        self.sequencer.running.store(false, Ordering::SeqCst);
    }
}

enum Wait {
    Elapsed,
    Stopped,
    LinkClosed,
}

impl CommandSequencer {
    /// Create an idle sequencer
    pub fn new() -> Self {
        Self::default()
    }

    /// A run is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Where the active run is, if any
    pub fn progress(&self) -> Option<RunProgress> {
        self.is_running().then(|| self.run.lock().progress)
    }

    /// Request the active run to stop before its next wait or write
    pub fn stop(&self) {
        if let Some(stop) = &self.run.lock().stop {
            tracing::info!("Stopping script");
            stop.cancel();
        }
    }

    /// Execute `script`. Starting while another run is active is rejected
    /// without side effects.
    pub async fn run(
        &self,
        script: &Script,
        writer: Option<&LinkWriter>,
        ending: LineEnding,
    ) -> Result<RunReport, ScriptError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ScriptError::AlreadyRunning);
        }
        let _guard = RunningGuard { sequencer: self };

        let Some(writer) = writer.filter(|w| !w.is_closed()) else {
            return Err(ScriptError::NotConnected);
        };

        let stop = CancellationToken::new();
        self.run.lock().stop = Some(stop.clone());

        writer.notify(SessionEvent::ScriptStarted {
            commands: script.len(),
        });
        tracing::info!("Running script with {} command(s)", script.len());

        let result = self.execute(script, writer, ending, &stop).await;
        match &result {
            Ok(report) => {
                tracing::info!(
                    "Script finished ({:?}): {} writes, {} bytes",
                    report.outcome,
                    report.writes,
                    report.bytes
                );
                writer.notify(SessionEvent::ScriptFinished(Ok(*report)));
            }
            Err(e) => {
                tracing::error!("Script aborted: {}", e);
                writer.notify(SessionEvent::ScriptFinished(Err(e.to_string())));
            }
        }
        result
    }

    async fn execute(
        &self,
        script: &Script,
        writer: &LinkWriter,
        ending: LineEnding,
        stop: &CancellationToken,
    ) -> Result<RunReport, ScriptError> {
        let mut report = RunReport {
            writes: 0,
            bytes: 0,
            outcome: RunOutcome::Completed,
        };

        for (index, command) in script.commands().iter().enumerate() {
            if command.repeat == Repeat::Skip {
                continue;
            }
            let data = command.resolve(ending);
            let mut done: u64 = 0;

            while command.repeat.allows(done) {
                self.set_progress(index, done);

                if let Some(outcome) = interrupted(stop, writer) {
                    report.outcome = outcome;
                    return Ok(report);
                }
                if let Wait::Stopped | Wait::LinkClosed = wait(command.pre_delay, stop, writer).await {
                    report.outcome = interrupted(stop, writer).unwrap_or(RunOutcome::Stopped);
                    return Ok(report);
                }
                if let Some(outcome) = interrupted(stop, writer) {
                    report.outcome = outcome;
                    return Ok(report);
                }

                match writer.write(data.clone()).await {
                    Ok(()) => {
                        report.writes += 1;
                        report.bytes += data.len() as u64;
                    }
                    // Closing mid-write is an interruption, not a failure
                    Err(_) if writer.is_closed() => {
                        report.outcome = RunOutcome::LinkClosed;
                        return Ok(report);
                    }
                    Err(source) => {
                        return Err(ScriptError::Write {
                            command: index,
                            source,
                        });
                    }
                }

                if let Wait::Stopped | Wait::LinkClosed = wait(command.post_delay, stop, writer).await {
                    report.outcome = interrupted(stop, writer).unwrap_or(RunOutcome::Stopped);
                    return Ok(report);
                }

                if command.repeat != Repeat::Infinite {
                    done += 1;
                }
                tokio::task::yield_now().await;
            }
        }

        Ok(report)
    }

    fn set_progress(&self, command: usize, repeat: u64) {
        self.run.lock().progress = RunProgress { command, repeat };
    }
}

fn interrupted(stop: &CancellationToken, writer: &LinkWriter) -> Option<RunOutcome> {
    if writer.is_closed() {
        Some(RunOutcome::LinkClosed)
    } else if stop.is_cancelled() {
        Some(RunOutcome::Stopped)
    } else {
        None
    }
}

async fn wait(delay: Duration, stop: &CancellationToken, writer: &LinkWriter) -> Wait {
    if delay.is_zero() {
        return Wait::Elapsed;
    }
    tokio::select! {
        () = stop.cancelled() => Wait::Stopped,
        () = writer.closed() => Wait::LinkClosed,
        () = tokio::time::sleep(delay) => Wait::Elapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::ScriptCommand;
    use crate::core::session::Session;
    use crate::core::transport::{Fault, LinkConfig, LoopbackDevice};
    use tokio_test::assert_ok;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    async fn connected(device: &LoopbackDevice) -> Session {
        let session = Session::new(device.provider());
        assert_ok!(session.open(LinkConfig::default()).await);
        session
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_in_order_with_repeats() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        let script = Script::new(vec![
            ScriptCommand::literal("A"),
            ScriptCommand::framed(&b"\x01"[..]).repeat(Repeat::Times(3)),
            ScriptCommand::literal("never").repeat(Repeat::Skip),
            ScriptCommand::literal("B").delays(ms(10), ms(0)),
        ]);

        let sequencer = CommandSequencer::new();
        let report = sequencer
            .run(&script, session.writer().as_ref(), LineEnding::Lf)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.writes, 5);
        assert_eq!(device.written_bytes(), b"A\n\x01\x01\x01B\n");
        assert_eq!(session.stats().tx_bytes, 7);
        assert!(!sequencer.is_running());
        session.close(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_are_honoured() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        let script = Script::new(vec![
            ScriptCommand::literal("x").delays(ms(200), ms(300)).repeat(Repeat::Times(2)),
        ]);

        let started = tokio::time::Instant::now();
        CommandSequencer::new()
            .run(&script, session.writer().as_ref(), LineEnding::None)
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= ms(1000) && elapsed < ms(1010), "{elapsed:?}");
        session.close(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_infinite_run() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        let script = Script::new(vec![ScriptCommand::literal("tick").repeat(Repeat::Infinite)]);

        let sequencer = CommandSequencer::new();
        let runner = sequencer.clone();
        let writer = session.writer();
        let handle = tokio::spawn(async move {
            runner.run(&script, writer.as_ref(), LineEnding::None).await
        });

        // Default 100 ms post delay: writes at 0, 100, 200
        tokio::time::sleep(ms(250)).await;
        assert!(sequencer.is_running());
        sequencer.stop();
        let report = handle.await.unwrap().unwrap();

        assert_eq!(report.outcome, RunOutcome::Stopped);
        assert_eq!(report.writes, 3);
        assert_eq!(device.write_count(), 3);
        assert!(!sequencer.is_running());

        tokio::time::sleep(ms(500)).await;
        assert_eq!(device.write_count(), 3);
        session.close(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_rejected() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        let script = Script::new(vec![ScriptCommand::literal("slow").delays(ms(0), ms(1000))]);

        let sequencer = CommandSequencer::new();
        let runner = sequencer.clone();
        let writer = session.writer();
        let first_script = script.clone();
        let handle = tokio::spawn(async move {
            runner.run(&first_script, writer.as_ref(), LineEnding::None).await
        });
        tokio::time::sleep(ms(10)).await;

        let err = sequencer
            .run(&script, session.writer().as_ref(), LineEnding::None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::AlreadyRunning));
        assert!(sequencer.is_running());

        assert_eq!(handle.await.unwrap().unwrap().writes, 1);
        assert_eq!(device.write_count(), 1);
        session.close(false).await;
    }

    #[tokio::test]
    async fn test_not_connected() {
        let sequencer = CommandSequencer::new();
        let err = sequencer
            .run(&Script::default(), None, LineEnding::None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::NotConnected));
        assert!(!sequencer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_aborts_run() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        let script = Script::new(vec![
            ScriptCommand::literal("one"),
            ScriptCommand::literal("two"),
            ScriptCommand::literal("three"),
        ]);

        let sequencer = CommandSequencer::new();
        let mut events = session.subscribe();
        let writer = session.writer();
        let runner = sequencer.clone();
        let handle = tokio::spawn(async move {
            runner.run(&script, writer.as_ref(), LineEnding::None).await
        });
        tokio::time::sleep(ms(50)).await;
        device.fail_next_write(Fault::Transient("write timeout".into()));

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ScriptError::Write { command: 1, .. }));
        assert_eq!(device.written_bytes(), b"one");
        assert!(!sequencer.is_running());
        assert!(session.is_connected());

        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::ScriptFinished(Err(_)) = event {
                finished = true;
            }
        }
        assert!(finished);
        session.close(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_infinite_run() {
        let device = LoopbackDevice::new();
        let session = connected(&device).await;
        device.set_write_delay(Some(ms(40)));
        let script = Script::new(vec![
            ScriptCommand::literal("loop").delays(ms(0), ms(0)).repeat(Repeat::Infinite),
        ]);

        let sequencer = CommandSequencer::new();
        let runner = sequencer.clone();
        let writer = session.writer();
        let handle = tokio::spawn(async move {
            runner.run(&script, writer.as_ref(), LineEnding::None).await
        });

        tokio::time::sleep(ms(100)).await;
        session.close(false).await;
        let writes_at_close = device.write_count();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.outcome, RunOutcome::LinkClosed);
        assert!(!sequencer.is_running());

        tokio::time::sleep(ms(500)).await;
        assert_eq!(device.write_count(), writes_at_close);
        assert_eq!(report.writes as usize, writes_at_close);
    }
}
