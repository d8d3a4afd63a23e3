//! Pairing across two synchronized streams

mod common;

use common::*;
use haier_lib::pairer::PacketPairer;
use haier_lib::sync::{SyncQuality, TimestampSynchronizer};
use std::time::Duration;

/// Outbound clock runs 700 ms behind the inbound one
const SKEW: i64 = 700;

#[test]
fn test_challenge_pairs_once_within_window() {
    let mut sync = TimestampSynchronizer::new(Duration::from_millis(5000));
    let mut pairer = PacketPairer::new(Duration::from_secs(5), 64);

    let tx = sync.sync_timestamp(10_000, Direction::Outbound);
    let rx = sync.sync_timestamp(10_000 + SKEW, Direction::Inbound);
    assert_eq!(tx, 10_000);
    assert_eq!(rx, 10_700);
    assert_eq!(sync.quality(), Some(SyncQuality::Good));

    let challenge_at = sync.sync_timestamp(11_000, Direction::Outbound);
    assert_eq!(challenge_at, 11_700);
    assert!(pairer
        .add_frame(&auth_challenge(&[0x11, 0x22]), Direction::Outbound, challenge_at)
        .is_none());

    let response_at = sync.sync_timestamp(12_000, Direction::Inbound);
    let paired = pairer
        .add_frame(&auth_response(&[0x33]), Direction::Inbound, response_at)
        .expect("Response should pair");
    assert_eq!(paired.latency, Duration::from_millis(300));
    assert_eq!(paired.request_kind(), CommandKind::AuthChallenge);
    assert_eq!(paired.response_kind(), CommandKind::AuthResponse);

    // a second response has nothing left to pair with
    assert!(pairer
        .add_frame(&auth_response(&[0x33]), Direction::Inbound, response_at + 10)
        .is_none());
    assert_eq!(pairer.stats().paired, 1);
}

#[test]
fn test_response_after_window_is_unpaired() {
    let mut pairer = PacketPairer::new(Duration::from_secs(2), 64);
    pairer.add_frame(&auth_challenge(&[0x01]), Direction::Outbound, 0);
    assert!(pairer
        .add_frame(&auth_response(&[0x02]), Direction::Inbound, 2_001)
        .is_none());
    assert_eq!(pairer.stats().paired, 0);
    assert_eq!(pairer.stats().unpaired, 1);
}

#[test]
fn test_response_at_window_edge_still_pairs() {
    let mut pairer = PacketPairer::new(Duration::from_secs(2), 64);
    pairer.add_frame(&auth_challenge(&[0x01]), Direction::Outbound, 0);
    assert!(pairer
        .add_frame(&auth_response(&[0x02]), Direction::Inbound, 2_000)
        .is_some());
}

#[test]
fn test_program_start_pairs_with_ack() {
    let mut pairer = PacketPairer::new(Duration::from_secs(5), 64);
    let program = Frame::try_from(hex_to_bytes(PROGRAM_1)).expect("parse");
    pairer.add_frame(&program, Direction::Outbound, 0);
    let ack = Frame::new(CommandCode::Single(0x61), vec![0x00]);
    let paired = pairer.add_frame(&ack, Direction::Inbound, 150).expect("pair");
    assert_eq!(paired.request_kind(), CommandKind::ProgramStart);
}
