//! Single-writer correlation core shared by the live monitor and offline
//! capture analysis.
//!
//! Frames from both directions are applied in arrival order: synchronizer,
//! then pairer, then the session state machine. Nothing here does I/O; every
//! observable effect comes back as a list of [`MonitorEvent`]s.

use crate::codec::DesyncReason;
use crate::command::CommandKind;
use crate::config::MonitorConfig;
use crate::frame::{CommandCode, Direction, Frame, ObservedFrame, Validation};
use crate::pairer::{PacketPairer, PairedEvent};
use crate::session::{Session, SessionSummary, TransitionRecord};
use crate::state::{ConversationStateMachine, TransitionTable};
use crate::sync::{SyncReport, TimestampSynchronizer};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-frame notification for loggers and displays
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEvent {
    pub session: u64,
    /// Position in the session history
    pub sequence: u64,
    pub timestamp: i64,
    pub raw_timestamp: i64,
    pub direction: Direction,
    pub kind: CommandKind,
    pub command: CommandCode,
    pub validation: Validation,
    pub error_signal: bool,
    pub retry: bool,
    pub frame: Frame,
}

impl FrameEvent {
    pub fn is_valid(&self) -> bool {
        self.validation.is_valid()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Frame(FrameEvent),
    Transition {
        session: u64,
        record: TransitionRecord,
    },
    Paired {
        session: u64,
        event: PairedEvent,
    },
    AuthResolved {
        session: u64,
        latency: Duration,
    },
    Resync {
        direction: Direction,
        discarded: usize,
        reason: DesyncReason,
    },
    PowerCycle {
        direction: Direction,
        timestamp: i64,
    },
    SyncEstablished(SyncReport),
    SessionStarted {
        session: u64,
        timestamp: i64,
    },
    SessionEnded(Box<Session>),
    LinkDown {
        direction: Direction,
        error: String,
    },
    LinkRestored {
        direction: Direction,
    },
    LinkFailed {
        direction: Direction,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub outbound_frames: u64,
    pub inbound_frames: u64,
    pub invalid_frames: u64,
    pub resyncs: u64,
    pub bytes_discarded: u64,
    pub paired: u64,
    pub unpaired: u64,
    pub dropped: u64,
    pub sessions: u64,
    pub power_cycles: u64,
}

impl MonitorStats {
    pub fn frames(&self) -> u64 {
        self.outbound_frames + self.inbound_frames
    }
}

/// Point-in-time view handed to external consumers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub stats: MonitorStats,
    pub sync: Option<SyncReport>,
    pub session: Option<SessionSummary>,
    pub pairing_window_ms: u64,
}

#[derive(Debug)]
pub struct Correlator {
    config: MonitorConfig,
    synchronizer: TimestampSynchronizer,
    pairer: PacketPairer,
    machine: ConversationStateMachine,
    session: Option<Session>,
    next_session_id: u64,
    stats: MonitorStats,
}

impl Correlator {
    pub fn new(config: MonitorConfig) -> Self {
        let synchronizer = TimestampSynchronizer::new(config.sync.max_base_difference);
        let pairer = PacketPairer::new(config.pairing.default_window, config.pairing.queue_capacity);
        let machine = ConversationStateMachine::new(TransitionTable::standard(), config.session.error_threshold);
        Self {
            config,
            synchronizer,
            pairer,
            machine,
            session: None,
            next_session_id: 1,
            stats: MonitorStats::default(),
        }
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            stats: self.stats,
            sync: self.synchronizer.offset().map(|_| self.synchronizer.report()),
            session: self.session.as_ref().map(Session::summary),
            pairing_window_ms: self.pairer.window().as_millis() as u64,
        }
    }

    /// Apply one decoded frame read from `direction` at `raw_timestamp` (ms,
    /// on that stream's clock)
    pub fn observe_frame(&mut self, direction: Direction, raw_timestamp: i64, frame: Frame) -> Vec<MonitorEvent> {
        let mut events = Vec::new();

        match direction {
            Direction::Outbound => self.stats.outbound_frames += 1,
            Direction::Inbound => self.stats.inbound_frames += 1,
        }
        if !frame.validation.is_valid() {
            self.stats.invalid_frames += 1;
        }

        let synced_before = self.synchronizer.offset().is_some();
        let timestamp = self.synchronizer.sync_timestamp(raw_timestamp, direction);
        if !synced_before && self.synchronizer.offset().is_some() {
            let report = self.synchronizer.report();
            let window = self.config.pairing.window_for(report.quality);
            self.pairer.set_window(window);
            debug!(window_ms = window.as_millis() as u64, "Pairing window set from sync quality");
            events.push(MonitorEvent::SyncEstablished(report));
        }

        let kind = frame.kind();
        let expired = self.session.as_ref().is_some_and(|s| {
            kind == CommandKind::SessionStart
                && !s.is_empty()
                && timestamp - s.last_activity > self.config.session.timeout.as_millis() as i64
        });
        if expired {
            info!("Session start after timeout, rotating session");
            self.end_session(&mut events);
        }
        if self.session.is_none() {
            self.start_session(timestamp, &mut events);
        }

        let paired = if frame.validation.is_valid() {
            self.pairer.add_frame(&frame, direction, timestamp)
        } else {
            self.pairer.evict_expired(timestamp);
            None
        };
        self.refresh_pairing_stats();

        let observed = ObservedFrame {
            direction,
            raw_timestamp,
            timestamp,
            frame,
        };
        let Some(session) = self.session.as_mut() else {
            return events;
        };
        let effect = self.machine.apply(session, &observed);
        let session_id = session.id;

        if effect.error_signal {
            warn!(
                session = session_id,
                %direction,
                %kind,
                validation = ?observed.frame.validation,
                "Error signal"
            );
        }

        events.push(MonitorEvent::Frame(FrameEvent {
            session: session_id,
            sequence: effect.sequence,
            timestamp,
            raw_timestamp,
            direction,
            kind,
            command: observed.frame.command,
            validation: observed.frame.validation,
            error_signal: effect.error_signal,
            retry: effect.retry,
            frame: observed.frame,
        }));
        if let Some(event) = paired {
            events.push(MonitorEvent::Paired {
                session: session_id,
                event,
            });
        }
        if let Some(record) = effect.transition {
            events.push(MonitorEvent::Transition {
                session: session_id,
                record,
            });
        }
        if let Some(latency) = effect.auth_resolved {
            events.push(MonitorEvent::AuthResolved {
                session: session_id,
                latency,
            });
        }
        events
    }

    pub fn observe_resync(&mut self, direction: Direction, discarded: usize, reason: DesyncReason) -> Vec<MonitorEvent> {
        self.stats.resyncs += 1;
        self.stats.bytes_discarded += discarded as u64;
        vec![MonitorEvent::Resync {
            direction,
            discarded,
            reason,
        }]
    }

    /// A side power-cycled: the current session ends here
    pub fn observe_power_cycle(&mut self, direction: Direction, raw_timestamp: i64) -> Vec<MonitorEvent> {
        let timestamp = self.synchronizer.sync_timestamp(raw_timestamp, direction);
        self.stats.power_cycles += 1;
        info!(%direction, timestamp, "Power cycle");
        let mut events = vec![MonitorEvent::PowerCycle { direction, timestamp }];
        self.end_session(&mut events);
        events
    }

    /// End of input: pending pairings become unpaired, the session ends
    pub fn finish(&mut self) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        self.end_session(&mut events);
        events
    }

    fn start_session(&mut self, timestamp: i64, events: &mut Vec<MonitorEvent>) {
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.stats.sessions += 1;
        info!(session = id, timestamp, "Session started");
        self.session = Some(Session::new(id, timestamp));
        events.push(MonitorEvent::SessionStarted { session: id, timestamp });
    }

    fn end_session(&mut self, events: &mut Vec<MonitorEvent>) {
        let leftover = self.pairer.flush();
        self.refresh_pairing_stats();
        if let Some(session) = self.session.take() {
            info!(
                session = session.id,
                state = %session.state,
                frames = session.frame_count(),
                unpaired = leftover,
                "Session ended"
            );
            events.push(MonitorEvent::SessionEnded(Box::new(session)));
        }
    }

    fn refresh_pairing_stats(&mut self) {
        let pairing = self.pairer.stats();
        self.stats.paired = pairing.paired;
        self.stats.unpaired = pairing.unpaired;
        self.stats.dropped = pairing.dropped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConversationState;

    fn session_start() -> Frame {
        Frame::with_header(
            crate::frame::FrameFlags::link_level(),
            [0; crate::constants::RESERVED_SIZE],
            CommandCode::Single(0x70),
            vec![0x00],
        )
    }

    fn challenge(seed: u8) -> Frame {
        Frame::new(CommandCode::Double(0x12, 0x10), vec![0x02, 0x00, 0x01, seed, seed ^ 0x5a])
    }

    fn response(seed: u8) -> Frame {
        Frame::new(CommandCode::Double(0x11, 0x10), vec![0x02, 0x00, 0x01, seed, 0x33])
    }

    #[test]
    fn test_first_frame_opens_session() {
        let mut correlator = Correlator::new(MonitorConfig::default());
        let events = correlator.observe_frame(Direction::Outbound, 1_000, session_start());
        assert!(matches!(events[0], MonitorEvent::SessionStarted { session: 1, .. }));
        let session = correlator.session().expect("session");
        assert_eq!(session.state, ConversationState::SessionStart);
        assert_eq!(correlator.stats().outbound_frames, 1);
    }

    #[test]
    fn test_challenge_response_pairs_and_authenticates() {
        let mut correlator = Correlator::new(MonitorConfig::default());
        correlator.observe_frame(Direction::Outbound, 1_000, challenge(1));
        let events = correlator.observe_frame(Direction::Inbound, 1_200, response(1));
        assert!(events.iter().any(|e| matches!(e, MonitorEvent::Paired { .. })));
        assert!(events.iter().any(|e| matches!(e, MonitorEvent::AuthResolved { .. })));
        assert_eq!(
            correlator.session().map(|s| s.state),
            Some(ConversationState::Authenticated)
        );
        assert_eq!(correlator.stats().paired, 1);
    }

    #[test]
    fn test_power_cycle_ends_session() {
        let mut correlator = Correlator::new(MonitorConfig::default());
        correlator.observe_frame(Direction::Outbound, 0, challenge(1));
        let events = correlator.observe_power_cycle(Direction::Outbound, 100);
        assert!(events.iter().any(|e| matches!(e, MonitorEvent::SessionEnded(_))));
        assert!(correlator.session().is_none());
        // the challenge never got an answer
        assert_eq!(correlator.stats().unpaired, 1);

        correlator.observe_frame(Direction::Outbound, 200, session_start());
        assert_eq!(correlator.session().map(|s| s.id), Some(2));
    }

    #[test]
    fn test_session_start_within_timeout_keeps_session() {
        let mut correlator = Correlator::new(MonitorConfig::default());
        correlator.observe_frame(Direction::Outbound, 0, session_start());
        correlator.observe_frame(Direction::Outbound, 2_000, session_start());
        assert_eq!(correlator.stats().sessions, 1);
        correlator.observe_frame(Direction::Outbound, 20_000, session_start());
        assert_eq!(correlator.stats().sessions, 2);
    }

    #[test]
    fn test_invalid_frames_are_counted_not_paired() {
        let mut correlator = Correlator::new(MonitorConfig::default());
        let mut bad = challenge(1);
        bad.validation = Validation::ChecksumMismatch {
            expected: 0x01,
            actual: 0x02,
        };
        let events = correlator.observe_frame(Direction::Outbound, 0, bad);
        let frame_event = events
            .iter()
            .find_map(|e| match e {
                MonitorEvent::Frame(f) => Some(f),
                _ => None,
            })
            .expect("frame event");
        assert!(!frame_event.is_valid());
        assert!(frame_event.error_signal);
        assert_eq!(correlator.stats().invalid_frames, 1);
        correlator.finish();
        assert_eq!(correlator.stats().unpaired, 0);
    }
}
