//! Replaying captures over an in-memory link

mod common;

use common::*;
use haier_lib::capture::Capture;
use haier_lib::config::ReplayConfig;
use haier_lib::replay::{ResponseOutcome, SequenceReplayer};
use haier_lib::serial::FramedLink;
use std::time::Duration;
use tokio::time::Instant;

fn controller_capture() -> Capture {
    let mut text = String::new();
    text.push_str(&capture_line(Direction::Outbound, 1_000, &session_start()));
    text.push_str(&capture_line(Direction::Outbound, 1_100, &auth_challenge(&[0x10, 0x20, 0x30])));
    text.push_str(&capture_line(Direction::Inbound, 1_300, &auth_response(&[0x40])));
    text.push_str(&format!("machine 1500 - {}\n", PROGRAM_1));
    text.push_str(&format!("machine 1700 - {}\n", RESET));
    Capture::parse(&text)
}

/// Answers every auth challenge and every program start on the far end
async fn responder(stream: tokio::io::DuplexStream) {
    let mut link = FramedLink::new(stream, FrameCodec::default());
    while let Ok(frame) = link.receive_frame().await {
        let answer = match frame.kind() {
            CommandKind::AuthChallenge => auth_response(&[0x99]),
            CommandKind::ProgramStart => Frame::new(CommandCode::Single(0x61), vec![0x00]),
            _ => continue,
        };
        if link.send_frame(&answer).await.is_err() {
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_same_capture_same_delays() {
    let frames = controller_capture().frames_from(Direction::Outbound);
    assert_eq!(frames.len(), 4);

    let replayer = SequenceReplayer::new(ReplayConfig {
        timing_factor: 0.5,
        await_responses: false,
        ..ReplayConfig::default()
    })
    .expect("config");

    let mut runs = Vec::new();
    for _ in 0..2 {
        let (local, remote) = tokio::io::duplex(4096);
        let mut link = FramedLink::new(local, FrameCodec::default());
        let mut plan = replayer.load(frames.clone());
        let start = Instant::now();
        let result = replayer.run(&mut plan, &mut link).await;
        assert!(result.is_success());
        drop(remote);
        runs.push((plan.delays(), result.records.iter().map(|r| r.delay).collect::<Vec<_>>(), start.elapsed()));
    }
    assert_eq!(runs[0], runs[1]);
    assert_eq!(
        runs[0].0,
        vec![
            Duration::from_millis(50),
            Duration::from_millis(100),
            Duration::from_millis(250),
            Duration::from_millis(500),
        ]
    );
    assert_eq!(runs[0].2, Duration::from_millis(900));
}

#[tokio::test(start_paused = true)]
async fn test_replay_matches_responses() {
    let frames = controller_capture().frames_from(Direction::Outbound);
    let (local, remote) = tokio::io::duplex(4096);
    let answering = tokio::spawn(responder(remote));

    let replayer = SequenceReplayer::new(ReplayConfig {
        response_timeout: Duration::from_secs(1),
        ..ReplayConfig::default()
    })
    .expect("config");
    let mut plan = replayer.load(frames);
    let mut link = FramedLink::new(local, FrameCodec::default());
    let result = replayer.run(&mut plan, &mut link).await;

    assert!(result.is_success());
    let responses: Vec<_> = result.records.iter().map(|r| r.response.clone()).collect();
    assert_eq!(responses[0], ResponseOutcome::NotAwaited);
    assert!(matches!(
        responses[1],
        ResponseOutcome::Matched {
            kind: CommandKind::AuthResponse,
            ..
        }
    ));
    assert!(matches!(
        responses[2],
        ResponseOutcome::Matched {
            kind: CommandKind::Ack,
            ..
        }
    ));
    // nobody confirms the reset
    assert_eq!(responses[3], ResponseOutcome::TimedOut { skipped: 0 });
    assert_eq!(result.stats.matched, 2);
    assert_eq!(result.stats.unmatched, 1);

    drop(link);
    answering.await.expect("responder");
}

#[tokio::test(start_paused = true)]
async fn test_replayed_bytes_match_capture() {
    let frames = controller_capture().frames_from(Direction::Outbound);
    let (local, remote) = tokio::io::duplex(4096);
    let replayer = SequenceReplayer::new(ReplayConfig {
        timing_factor: 0.0,
        await_responses: false,
        ..ReplayConfig::default()
    })
    .expect("config");
    let mut plan = replayer.load(frames);
    let mut link = FramedLink::new(local, FrameCodec::default());
    replayer.run(&mut plan, &mut link).await;
    drop(link);

    let mut far = FramedLink::new(remote, FrameCodec::default());
    let mut seen = Vec::new();
    while let Ok(frame) = far.receive_frame().await {
        seen.push(frame.to_bytes());
    }
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[2], hex_to_bytes(PROGRAM_1));
    assert_eq!(seen[3], hex_to_bytes(RESET));
}
