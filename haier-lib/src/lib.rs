pub mod analysis;
pub mod capture;
pub mod checksum;
pub mod codec;
pub mod command;
pub mod config;
pub mod constants;
pub mod correlator;
pub mod error;
pub mod frame;
pub mod monitor;
pub mod pairer;
pub mod replay;
pub mod serial;
pub mod session;
pub mod state;
pub mod sync;


pub use analysis::{CaptureAnalysis, analyze_capture};
pub use capture::Capture;
pub use codec::{DecodeOutcome, FrameCodec};
pub use command::CommandKind;
pub use config::MonitorConfig;
pub use correlator::{Correlator, MonitorEvent, MonitorSnapshot};
pub use error::HaierError;
pub use frame::{Direction, Frame};
pub use monitor::{DualStreamMonitor, MonitorHandle};
pub use pairer::{PacketPairer, PairedEvent};
pub use replay::{ReplayPlan, ReplayResult, SequenceReplayer};
pub use state::{ConversationState, ConversationStateMachine};
pub use sync::TimestampSynchronizer;
