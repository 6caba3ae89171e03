//! End-to-end session tests over the loopback device

use pineterm_core::core::codec::{CodecType, LineEnding};
use pineterm_core::core::logger::LogAggregator;
use pineterm_core::core::receiver::ReceiveSettings;
use pineterm_core::core::session::{OpenOutcome, Session, SessionEvent, SessionState};
use pineterm_core::core::transport::{Fault, LinkConfig, LoopbackDevice};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

async fn open(device: &LoopbackDevice, log: LogAggregator) -> Session {
    let session = Session::with_log(device.provider(), log);
    session.set_line_ending(LineEnding::None);
    assert_eq!(assert_ok!(session.open(LinkConfig::default()).await), OpenOutcome::Connected);
    session
}

fn hex_history(session: &Session) -> Vec<String> {
    session.log().flush();
    session
        .log()
        .history()
        .iter()
        .map(|entry| entry.hex.clone())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn close_chunks_form_one_packet() {
    let device = LoopbackDevice::new();
    let session = open(&device, LogAggregator::new(0)).await;

    device.inject(vec![0x48, 0x49]);
    tokio::time::sleep(ms(30)).await;
    device.inject(vec![0x21]);
    tokio::time::sleep(ms(100)).await;

    assert_eq!(hex_history(&session), vec!["48 49 21"]);
    assert_eq!(session.stats().rx_bytes, 3);
    session.close(false).await;
}

#[tokio::test(start_paused = true)]
async fn distant_chunks_form_two_packets() {
    let device = LoopbackDevice::new();
    let session = open(&device, LogAggregator::new(0)).await;

    device.inject(vec![0x48, 0x49]);
    tokio::time::sleep(ms(200)).await;
    device.inject(vec![0x21]);
    tokio::time::sleep(ms(100)).await;

    assert_eq!(hex_history(&session), vec!["48 49", "21"]);
    session.close(false).await;
}

#[tokio::test(start_paused = true)]
async fn threshold_changes_apply_while_connected() {
    let device = LoopbackDevice::new();
    let session = open(&device, LogAggregator::new(0)).await;
    session.set_receive_settings(ReceiveSettings {
        timing_enabled: true,
        threshold_ms: 300,
    });

    device.inject(&b"AB"[..]);
    tokio::time::sleep(ms(200)).await;
    device.inject(&b"C"[..]);
    tokio::time::sleep(ms(400)).await;

    assert_eq!(hex_history(&session), vec!["41 42 43"]);
    session.close(false).await;
}

#[tokio::test(start_paused = true)]
async fn immediate_mode_forwards_every_chunk() {
    let device = LoopbackDevice::new();
    let session = open(&device, LogAggregator::new(0)).await;
    session.set_receive_settings(ReceiveSettings {
        timing_enabled: false,
        threshold_ms: 50,
    });

    device.inject(&b"a"[..]);
    device.inject(&b""[..]);
    device.inject(&b"b"[..]);
    device.inject(&b"c"[..]);
    tokio::time::sleep(ms(10)).await;

    assert_eq!(hex_history(&session), vec!["61", "62", "63"]);
    session.close(false).await;
}

#[tokio::test(start_paused = true)]
async fn display_is_capped_but_export_keeps_everything() {
    let device = LoopbackDevice::new();
    let session = open(&device, LogAggregator::new(2)).await;
    session.set_receive_settings(ReceiveSettings {
        timing_enabled: false,
        threshold_ms: 50,
    });

    for i in 0..5u8 {
        device.inject(vec![i]);
    }
    tokio::time::sleep(ms(100)).await;

    let log = session.log();
    assert_eq!(log.display_len(), 2);
    assert_eq!(log.export_len(), 5);
    let shown: Vec<String> = log.display().iter().map(|e| e.hex.clone()).collect();
    assert_eq!(shown, vec!["03", "04"]);
    session.close(false).await;
}

#[tokio::test(start_paused = true)]
async fn batches_arrive_in_send_order() {
    let device = LoopbackDevice::new();
    let session = open(&device, LogAggregator::new(0)).await;
    let mut batches = session.log().subscribe();

    for text in ["one", "two", "three"] {
        assert_ok!(session.send_text(text).await);
    }
    let batch = assert_ok!(batches.recv().await);
    let texts: Vec<&str> = batch.iter().map(|e| e.text.as_str()).collect();
    assert_eq!(texts, vec!["one", "two", "three"]);
    session.close(false).await;
}

#[tokio::test(start_paused = true)]
async fn clear_discards_pending_entries() {
    let device = LoopbackDevice::new();
    let session = open(&device, LogAggregator::new(0)).await;

    assert_ok!(session.send_text("stale").await);
    session.log().clear();
    tokio::time::sleep(ms(200)).await;
    assert_eq!(session.log().export_len(), 0);

    assert_ok!(session.send_text("fresh").await);
    tokio::time::sleep(ms(200)).await;
    assert_eq!(session.log().export_len(), 1);
    session.close(false).await;
}

#[tokio::test(start_paused = true)]
async fn export_contains_both_directions() {
    let device = LoopbackDevice::echo();
    let session = open(&device, LogAggregator::new(0)).await;
    assert_ok!(session.send_hex("41 42 0D 0A").await);
    tokio::time::sleep(ms(200)).await;

    let dir = tempfile::tempdir().unwrap();
    let path = assert_ok!(session.log().export_to_dir(CodecType::Text, dir.path()));
    let content = std::fs::read_to_string(path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("TX: AB␍␊"));
    assert!(lines[1].ends_with("RX: AB␍␊"));
    assert!(lines[0].starts_with('['));
    session.close(false).await;
}

#[tokio::test(start_paused = true)]
async fn stall_signal_clears_on_data_and_disconnect() {
    let device = LoopbackDevice::new();
    let session = open(&device, LogAggregator::new(0)).await;
    let mut events = session.subscribe();

    tokio::time::sleep(Duration::from_secs(6)).await;
    device.inject(&b"!"[..]);
    tokio::time::sleep(ms(10)).await;
    tokio::time::sleep(Duration::from_secs(6)).await;
    session.close(false).await;

    let mut stalls = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Stalled(flag) = event {
            stalls.push(flag);
        }
    }
    assert_eq!(stalls.first(), Some(&true));
    assert_eq!(stalls.last(), Some(&false));
    assert_eq!(stalls.iter().filter(|s| **s).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn hang_up_disconnects_and_allows_reconnect() {
    let device = LoopbackDevice::new();
    let session = open(&device, LogAggregator::new(0)).await;

    device.hang_up();
    tokio::time::sleep(ms(10)).await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(!session.inputs_locked());
    assert_err!(session.send_text("late").await);

    assert_ok!(session.open(LinkConfig::default()).await);
    assert!(session.is_connected());
    session.close(false).await;
}

#[tokio::test(start_paused = true)]
async fn transient_error_keeps_session_up() {
    let device = LoopbackDevice::new();
    let session = open(&device, LogAggregator::new(0)).await;

    device.inject_fault(Fault::Transient("framing error".into()));
    device.inject(&b"ok"[..]);
    tokio::time::sleep(ms(100)).await;

    assert!(session.is_connected());
    assert_eq!(hex_history(&session), vec!["6F 6B"]);
    session.close(false).await;
}

#[tokio::test(start_paused = true)]
async fn forced_close_releases_everything() {
    let device = LoopbackDevice::new();
    let session = open(&device, LogAggregator::new(0)).await;
    device.inject(&b"pending"[..]);

    session.close(true).await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.writer().is_none());
    assert!(!device.is_open());
    assert!(!device.reader_acquired());
}
