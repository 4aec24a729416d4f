//! Video pipeline module
//!
//! This module runs the robot video pipeline:
//! - Source command construction for the simulator, capture devices and
//!   remote streams
//! - FFmpeg transcoder supervision with an archival recording output
//! - WebSocket fan-out of the MPEG-TS stream to any number of viewers

pub mod broadcast;
pub mod config;
pub mod ffmpeg;
pub mod manager;
pub mod process;
pub mod source;
pub mod types;

pub use broadcast::{BroadcastHub, BroadcastListener};
pub use config::{FrameFormat, VideoConfig, DEFAULT_PORT};
pub use manager::{SimulationStart, VideoManager};
pub use source::{SimulationRequest, SimulatorLocator, SourceCommand};
pub use types::{
    ClientId, PipelineEvent, ProcessRole, SessionInfo, SessionKey, SessionState, SourceKind,
    StartOutcome, VideoError, VideoResult,
};
