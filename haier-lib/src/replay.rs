//! Timing-aware replay of captured frames.
//!
//! Each frame is sent, optionally answered, and followed by a delay derived
//! from its command kind and scaled by the timing factor. Failures are
//! recorded per frame and never end the run; only a stop request does.

use crate::command::{CommandKind, TimingCategory};
use crate::config::ReplayConfig;
use crate::error::HaierError;
use crate::frame::Frame;
use crate::serial::FramedLink;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

/// Where replayed frames go and answers come from
pub trait ReplayLink {
    fn send(&mut self, frame: &Frame) -> impl Future<Output = Result<(), HaierError>> + Send;

    fn receive(&mut self) -> impl Future<Output = Result<Frame, HaierError>> + Send;
}

impl<S> ReplayLink for FramedLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: &Frame) -> Result<(), HaierError> {
        self.send_frame(frame).await.map(|_| ())
    }

    async fn receive(&mut self) -> Result<Frame, HaierError> {
        self.receive_frame().await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFrame {
    pub frame: Frame,
    pub kind: CommandKind,
    pub category: TimingCategory,
    /// Pause after this frame
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
    pub sent: u64,
    pub send_failures: u64,
    pub matched: u64,
    pub unmatched: u64,
    #[serde(with = "crate::config::millis")]
    pub elapsed: Duration,
}

/// Frames to replay, a cursor into them and what happened so far
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayPlan {
    frames: Vec<PlannedFrame>,
    cursor: usize,
    stats: ReplayStats,
}

impl ReplayPlan {
    pub fn load(frames: impl IntoIterator<Item = Frame>, timing_factor: f64) -> Self {
        let factor = if timing_factor.is_finite() { timing_factor.max(0.0) } else { 0.0 };
        let frames = frames
            .into_iter()
            .map(|frame| {
                let kind = frame.kind();
                let category = kind.timing_category();
                PlannedFrame {
                    delay: category.base_delay().mul_f64(factor),
                    frame,
                    kind,
                    category,
                }
            })
            .collect();
        Self {
            frames,
            cursor: 0,
            stats: ReplayStats::default(),
        }
    }

    pub fn frames(&self) -> &[PlannedFrame] {
        &self.frames
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.frames.iter().map(|f| f.delay).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Index of the next frame to send
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.frames.len()
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// Start over from the first frame with fresh statistics
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.stats = ReplayStats::default();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseOutcome {
    /// The frame expects no answer, or answers were not awaited
    NotAwaited,
    Matched {
        kind: CommandKind,
        #[serde(with = "crate::config::millis")]
        latency: Duration,
        /// Incompatible frames read while waiting
        skipped: usize,
    },
    TimedOut {
        skipped: usize,
    },
    LinkError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub index: usize,
    pub kind: CommandKind,
    pub category: TimingCategory,
    #[serde(with = "crate::config::millis")]
    pub delay: Duration,
    #[serde(with = "crate::config::millis")]
    pub send_duration: Duration,
    pub send_error: Option<String>,
    pub response: ResponseOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayResult {
    pub records: Vec<FrameRecord>,
    pub stats: ReplayStats,
    /// Index of the first frame not sent because of a stop request
    pub stopped_at: Option<usize>,
}

impl ReplayResult {
    /// Every frame was sent without a transport error
    pub fn is_success(&self) -> bool {
        self.stopped_at.is_none() && self.records.iter().all(|r| r.send_error.is_none())
    }

    pub fn into_result(self) -> Result<Self, HaierError> {
        match self.stopped_at {
            Some(index) => Err(HaierError::ReplayAborted { index }),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Default)]
struct ControlFlags {
    paused: AtomicBool,
    stopped: AtomicBool,
    notify: Notify,
}

/// Pause/resume/stop for a running replay. Checked between frames only.
#[derive(Debug, Clone, Default)]
pub struct ReplayControl {
    flags: Arc<ControlFlags>,
}

impl ReplayControl {
    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.flags.paused.store(false, Ordering::SeqCst);
        self.flags.notify.notify_waiters();
    }

    pub fn stop(&self) {
        self.flags.stopped.store(true, Ordering::SeqCst);
        self.flags.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.stopped.load(Ordering::SeqCst)
    }

    /// Wait out a pause; false if the replay should stop
    async fn checkpoint(&self) -> bool {
        loop {
            let notified = self.flags.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            debug!("Replay paused");
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SequenceReplayer {
    config: ReplayConfig,
    control: ReplayControl,
}

impl SequenceReplayer {
    pub fn new(config: ReplayConfig) -> Result<Self, HaierError> {
        config.validate()?;
        Ok(Self {
            config,
            control: ReplayControl::default(),
        })
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn control(&self) -> ReplayControl {
        self.control.clone()
    }

    /// Build a plan with this replayer's timing factor
    pub fn load(&self, frames: impl IntoIterator<Item = Frame>) -> ReplayPlan {
        ReplayPlan::load(frames, self.config.timing_factor)
    }

    /// Replay from the plan's cursor to the end, or until stopped
    pub async fn run<L: ReplayLink>(&self, plan: &mut ReplayPlan, link: &mut L) -> ReplayResult {
        let started = Instant::now();
        let mut records = Vec::new();
        let mut stopped_at = None;
        info!(frames = plan.len(), from = plan.cursor, "Replay started");

        while plan.cursor < plan.frames.len() {
            if !self.control.checkpoint().await {
                info!(index = plan.cursor, "Replay stopped");
                stopped_at = Some(plan.cursor);
                break;
            }
            let index = plan.cursor;
            let planned = plan.frames[index].clone();
            let record = self.replay_one(index, &planned, link, &mut plan.stats).await;
            records.push(record);
            plan.cursor += 1;

            if !planned.delay.is_zero() {
                tokio::time::sleep(planned.delay).await;
            }
        }

        plan.stats.elapsed += started.elapsed();
        let stats = plan.stats;
        info!(
            sent = stats.sent,
            failures = stats.send_failures,
            matched = stats.matched,
            unmatched = stats.unmatched,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Replay finished"
        );
        ReplayResult {
            records,
            stats,
            stopped_at,
        }
    }

    async fn replay_one<L: ReplayLink>(
        &self,
        index: usize,
        planned: &PlannedFrame,
        link: &mut L,
        stats: &mut ReplayStats,
    ) -> FrameRecord {
        let mut record = FrameRecord {
            index,
            kind: planned.kind,
            category: planned.category,
            delay: planned.delay,
            send_duration: Duration::ZERO,
            send_error: None,
            response: ResponseOutcome::NotAwaited,
        };

        let send_start = Instant::now();
        let sent = link.send(&planned.frame).await;
        record.send_duration = send_start.elapsed();
        if let Err(e) = sent {
            warn!(index, kind = %planned.kind, error = %e, "Send failed, continuing");
            stats.send_failures += 1;
            record.send_error = Some(e.to_string());
            return record;
        }
        stats.sent += 1;
        debug!(index, kind = %planned.kind, "Sent");

        if !self.config.await_responses || !planned.kind.expects_response() {
            return record;
        }

        let wait_start = Instant::now();
        let mut skipped = 0;
        let waited = timeout(self.config.response_timeout, async {
            loop {
                let frame = link.receive().await?;
                let kind = frame.kind();
                if planned.kind.accepts_response(kind) {
                    return Ok::<_, HaierError>(kind);
                }
                debug!(index, expected = %planned.kind, got = %kind, "Ignoring unrelated frame");
                skipped += 1;
            }
        })
        .await;

        record.response = match waited {
            Ok(Ok(kind)) => {
                stats.matched += 1;
                ResponseOutcome::Matched {
                    kind,
                    latency: wait_start.elapsed(),
                    skipped,
                }
            }
            Ok(Err(e)) => {
                stats.unmatched += 1;
                warn!(index, error = %e, "Receive failed");
                ResponseOutcome::LinkError(e.to_string())
            }
            Err(_) => {
                stats.unmatched += 1;
                warn!(
                    index,
                    kind = %planned.kind,
                    timeout_ms = self.config.response_timeout.as_millis() as u64,
                    "No compatible response"
                );
                ResponseOutcome::TimedOut { skipped }
            }
        };
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CommandCode;
    use std::collections::VecDeque;

    /// Records sends and answers from a script
    #[derive(Default)]
    struct ScriptedLink {
        sent: Vec<Frame>,
        answers: VecDeque<Frame>,
        fail_sends: Vec<usize>,
    }

    impl ReplayLink for ScriptedLink {
        async fn send(&mut self, frame: &Frame) -> Result<(), HaierError> {
            let index = self.sent.len();
            self.sent.push(frame.clone());
            if self.fail_sends.contains(&index) {
                return Err(HaierError::LinkClosed);
            }
            Ok(())
        }

        async fn receive(&mut self) -> Result<Frame, HaierError> {
            match self.answers.pop_front() {
                Some(frame) => Ok(frame),
                None => std::future::pending().await,
            }
        }
    }

    fn frames() -> Vec<Frame> {
        vec![
            Frame::new(CommandCode::Double(0x12, 0x10), vec![0x02, 0x00, 0x01, 0x42]),
            Frame::new(CommandCode::Single(0x60), vec![0x00, 0x01, 0x01, 0x00, 0x00, 0x00]),
            Frame::new(CommandCode::Single(0x61), vec![0x00]),
        ]
    }

    #[test]
    fn test_delays_follow_categories_and_factor() {
        let plan = ReplayPlan::load(frames(), 2.0);
        assert_eq!(
            plan.delays(),
            vec![Duration::from_millis(400), Duration::from_millis(1000), Duration::from_millis(100)]
        );
        assert_eq!(ReplayPlan::load(frames(), 0.0).delays(), vec![Duration::ZERO; 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout_is_not_fatal() {
        let replayer = SequenceReplayer::default();
        let mut plan = replayer.load(frames());
        let mut link = ScriptedLink {
            answers: VecDeque::from([Frame::new(CommandCode::Double(0x11, 0x10), vec![0x02, 0x00, 0x01, 0x99])]),
            ..ScriptedLink::default()
        };

        let result = replayer.run(&mut plan, &mut link).await;
        assert!(result.is_success());
        assert_eq!(result.records.len(), 3);
        assert!(matches!(
            result.records[0].response,
            ResponseOutcome::Matched {
                kind: CommandKind::AuthResponse,
                ..
            }
        ));
        assert_eq!(result.records[1].response, ResponseOutcome::TimedOut { skipped: 0 });
        assert_eq!(result.records[2].response, ResponseOutcome::NotAwaited);
        assert_eq!(result.stats.matched, 1);
        assert_eq!(result.stats.unmatched, 1);
        assert!(plan.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_is_recorded_and_replay_continues() {
        let replayer = SequenceReplayer::new(ReplayConfig {
            await_responses: false,
            ..ReplayConfig::default()
        })
        .expect("config");
        let mut plan = replayer.load(frames());
        let mut link = ScriptedLink {
            fail_sends: vec![1],
            ..ScriptedLink::default()
        };
        let result = replayer.run(&mut plan, &mut link).await;
        assert_eq!(link.sent.len(), 3);
        assert!(!result.is_success());
        assert_eq!(result.stats.send_failures, 1);
        assert_eq!(result.stats.sent, 2);
        assert!(result.records[1].send_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_checked_between_frames() {
        let replayer = SequenceReplayer::new(ReplayConfig {
            await_responses: false,
            ..ReplayConfig::default()
        })
        .expect("config");
        let control = replayer.control();
        control.stop();
        let mut plan = replayer.load(frames());
        let mut link = ScriptedLink::default();
        let result = replayer.run(&mut plan, &mut link).await;
        assert_eq!(result.stopped_at, Some(0));
        assert!(link.sent.is_empty());
        assert!(matches!(result.into_result(), Err(HaierError::ReplayAborted { index: 0 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_until_resume() {
        let replayer = SequenceReplayer::new(ReplayConfig {
            await_responses: false,
            ..ReplayConfig::default()
        })
        .expect("config");
        let control = replayer.control();
        control.pause();

        let resumer = {
            let control = control.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                control.resume();
            })
        };

        let start = Instant::now();
        let mut plan = replayer.load(frames());
        let result = replayer.run(&mut plan, &mut ScriptedLink::default()).await;
        resumer.await.expect("resumer");
        assert!(result.is_success());
        // 3 s paused, then 200 + 500 + 50 ms of delays
        assert_eq!(start.elapsed(), Duration::from_millis(3_750));
    }
}
