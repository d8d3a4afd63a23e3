//! Offline analysis of a parsed capture.
//!
//! Runs the same [`Correlator`] as the live monitor, in file order, and
//! collects what it reports into a [`CaptureAnalysis`].

use crate::capture::{Capture, CaptureItem};
use crate::codec::FrameCodec;
use crate::config::MonitorConfig;
use crate::correlator::{Correlator, MonitorEvent, MonitorSnapshot};
use crate::session::{Session, SessionSummary, TransitionRecord};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

/// A challenge payload the controller sent more than once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateChallenge {
    pub challenge: Bytes,
    /// `(session, timestamp)` of every occurrence, in order
    pub occurrences: Vec<(u64, i64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthLatency {
    pub session: u64,
    pub challenged_at: i64,
    #[serde(with = "crate::config::millis")]
    pub latency: Duration,
}

#[derive(Debug, Clone)]
pub struct CaptureAnalysis {
    pub snapshot: MonitorSnapshot,
    pub events: Vec<MonitorEvent>,
    /// Every session in the order it ended
    pub sessions: Vec<Session>,
    pub duplicate_challenges: Vec<DuplicateChallenge>,
    pub skipped_lines: usize,
}

impl CaptureAnalysis {
    pub fn session(&self, id: u64) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn timeline(&self, id: u64) -> &[TransitionRecord] {
        self.session(id).map_or(&[], |s| &s.transitions)
    }

    /// Latency of every resolved auth attempt
    pub fn auth_latencies(&self) -> Vec<AuthLatency> {
        self.sessions
            .iter()
            .flat_map(|session| {
                session.resolved_auth().filter_map(move |attempt| {
                    attempt.resolution.as_ref().map(|r| AuthLatency {
                        session: session.id,
                        challenged_at: attempt.challenged_at,
                        latency: r.latency,
                    })
                })
            })
            .collect()
    }

    pub fn report(&self) -> AnalysisReport {
        AnalysisReport {
            snapshot: self.snapshot,
            sessions: self.sessions.iter().map(Session::summary).collect(),
            timelines: self
                .sessions
                .iter()
                .map(|s| (s.id, s.transitions.clone()))
                .collect(),
            auth_latencies: self.auth_latencies(),
            duplicate_challenges: self
                .duplicate_challenges
                .iter()
                .map(|d| DuplicateChallengeReport {
                    challenge: hex::encode(&d.challenge),
                    count: d.occurrences.len(),
                    sessions: d.occurrences.iter().map(|(session, _)| *session).collect(),
                })
                .collect(),
            skipped_lines: self.skipped_lines,
        }
    }
}

/// Serialisable digest of a [`CaptureAnalysis`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub snapshot: MonitorSnapshot,
    pub sessions: Vec<SessionSummary>,
    pub timelines: Vec<(u64, Vec<TransitionRecord>)>,
    pub auth_latencies: Vec<AuthLatency>,
    pub duplicate_challenges: Vec<DuplicateChallengeReport>,
    pub skipped_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateChallengeReport {
    pub challenge: String,
    pub count: usize,
    pub sessions: Vec<u64>,
}

pub fn analyze_capture(capture: &Capture, config: &MonitorConfig) -> CaptureAnalysis {
    let mut correlator = Correlator::new(config.clone());
    let mut events = Vec::new();

    for item in capture.decode(FrameCodec::default) {
        let produced = match item {
            CaptureItem::Frame {
                direction,
                raw_timestamp,
                frame,
                ..
            } => correlator.observe_frame(direction, raw_timestamp, frame),
            CaptureItem::Resync {
                direction,
                discarded,
                reason,
                ..
            } => correlator.observe_resync(direction, discarded, reason),
            CaptureItem::PowerCycle {
                direction,
                raw_timestamp,
                ..
            } => correlator.observe_power_cycle(direction, raw_timestamp),
        };
        events.extend(produced);
    }
    events.extend(correlator.finish());

    let sessions: Vec<Session> = events
        .iter()
        .filter_map(|event| match event {
            MonitorEvent::SessionEnded(session) => Some(session.as_ref().clone()),
            _ => None,
        })
        .collect();
    let duplicate_challenges = find_duplicate_challenges(&sessions);
    let snapshot = correlator.snapshot();

    info!(
        sessions = sessions.len(),
        frames = snapshot.stats.frames(),
        paired = snapshot.stats.paired,
        unpaired = snapshot.stats.unpaired,
        duplicates = duplicate_challenges.len(),
        "Capture analysed"
    );

    CaptureAnalysis {
        snapshot,
        events,
        sessions,
        duplicate_challenges,
        skipped_lines: capture.skipped().len(),
    }
}

fn find_duplicate_challenges(sessions: &[Session]) -> Vec<DuplicateChallenge> {
    let mut order: Vec<Bytes> = Vec::new();
    let mut seen: HashMap<Bytes, Vec<(u64, i64)>> = HashMap::new();
    for session in sessions {
        for attempt in &session.auth_attempts {
            let occurrences = seen.entry(attempt.challenge.clone()).or_default();
            if occurrences.is_empty() {
                order.push(attempt.challenge.clone());
            }
            occurrences.push((session.id, attempt.challenged_at));
        }
    }
    order
        .into_iter()
        .filter_map(|challenge| {
            let occurrences = seen.remove(&challenge)?;
            (occurrences.len() > 1).then_some(DuplicateChallenge { challenge, occurrences })
        })
        .collect()
}
