//! Two authenticated sessions, offline and live

mod common;

use common::*;
use haier_lib::analysis::analyze_capture;
use haier_lib::capture::Capture;
use haier_lib::config::MonitorConfig;
use haier_lib::correlator::MonitorEvent;
use haier_lib::monitor::DualStreamMonitor;
use haier_lib::serial::StreamConnector;
use haier_lib::state::ConversationState;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const T0: i64 = 1_760_932_567_000;

fn two_session_capture() -> String {
    let mut text = String::new();
    text.push_str(&capture_line(Direction::Outbound, T0, &session_start()));
    text.push_str(&capture_line(Direction::Inbound, T0 + 100, &session_start()));
    text.push_str(&capture_line(Direction::Outbound, T0 + 1_000, &auth_challenge(&[0xa1, 0xb2, 0xc3])));
    text.push_str(&capture_line(Direction::Inbound, T0 + 1_300, &auth_response(&[0x5e, 0x6f])));
    text.push_str(&capture_line(Direction::Outbound, T0 + 30_000, &session_start()));
    text.push_str(&capture_line(Direction::Outbound, T0 + 31_000, &auth_challenge(&[0xd4, 0xe5, 0xf6])));
    text.push_str(&capture_line(Direction::Inbound, T0 + 31_300, &auth_response(&[0x70, 0x81])));
    text
}

/// States reached right after each paired event
fn states_after_pairing(events: &[MonitorEvent]) -> Vec<ConversationState> {
    let mut states = Vec::new();
    let mut awaiting = false;
    for event in events {
        match event {
            MonitorEvent::Paired { .. } => awaiting = true,
            MonitorEvent::Transition { record, .. } if awaiting => {
                states.push(record.to);
                awaiting = false;
            }
            _ => {}
        }
    }
    states
}

#[test]
fn test_two_session_capture_offline() {
    init_tracing();
    let capture = Capture::parse(&two_session_capture());
    assert!(capture.skipped().is_empty());

    let analysis = analyze_capture(&capture, &MonitorConfig::default());
    let stats = analysis.snapshot.stats;
    assert_eq!(stats.sessions, 2);
    assert_eq!(stats.paired, 2);
    assert_eq!(stats.unpaired, 0);
    assert_eq!(analysis.sessions.len(), 2);
    for session in &analysis.sessions {
        assert_eq!(session.state, ConversationState::Authenticated);
        assert_eq!(session.resolved_auth().count(), 1);
    }
    assert_eq!(
        states_after_pairing(&analysis.events),
        vec![ConversationState::Authenticated, ConversationState::Authenticated]
    );

    let latencies = analysis.auth_latencies();
    assert_eq!(latencies.len(), 2);
    assert!(latencies.iter().all(|l| l.latency == Duration::from_millis(200)));
    assert!(analysis.duplicate_challenges.is_empty());

    let timeline = analysis.timeline(2);
    assert_eq!(timeline.first().map(|t| t.to), Some(ConversationState::SessionStart));
    assert_eq!(timeline.last().map(|t| t.to), Some(ConversationState::Authenticated));
}

#[tokio::test]
async fn test_two_sessions_live() {
    init_tracing();
    let (out_local, mut machine) = tokio::io::duplex(1024);
    let (in_local, mut modem) = tokio::io::duplex(1024);

    let mut config = MonitorConfig::default();
    config.session.timeout = Duration::from_millis(300);
    let (handle, mut events) = DualStreamMonitor::start_with(
        StreamConnector::new("machine", out_local),
        StreamConnector::new("modem", in_local),
        config,
    )
    .await
    .expect("start");

    let pause = Duration::from_millis(50);
    let script = [
        (Direction::Outbound, session_start(), pause),
        (Direction::Inbound, session_start(), pause),
        (Direction::Outbound, auth_challenge(&[0xa1, 0xb2]), pause),
        (Direction::Inbound, auth_response(&[0x01]), Duration::from_millis(800)),
        (Direction::Outbound, session_start(), pause),
        (Direction::Outbound, auth_challenge(&[0xc3, 0xd4]), pause),
        (Direction::Inbound, auth_response(&[0x02]), pause),
    ];
    for (direction, frame, after) in script {
        let port = match direction {
            Direction::Outbound => &mut machine,
            Direction::Inbound => &mut modem,
        };
        port.write_all(&frame.to_bytes()).await.expect("write");
        tokio::time::sleep(after).await;
    }
    drop(machine);
    drop(modem);

    let snapshot = handle.wait().await.expect("monitor");
    let mut collected = Vec::new();
    while let Some(event) = events.recv().await {
        collected.push(event);
    }

    assert_eq!(snapshot.stats.sessions, 2);
    assert_eq!(snapshot.stats.paired, 2);
    assert_eq!(snapshot.stats.unpaired, 0);
    assert_eq!(
        states_after_pairing(&collected),
        vec![ConversationState::Authenticated, ConversationState::Authenticated]
    );
    let failed_links = collected
        .iter()
        .filter(|e| matches!(e, MonitorEvent::LinkFailed { .. }))
        .count();
    assert_eq!(failed_links, 2);
}
