//! Video pipeline types
//!
//! Session identity, lifecycle state, events and errors shared by the
//! pipeline manager, the broadcast hub and the command layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Identifier handed to a client once its handshake completes
pub type ClientId = u64;

/// Where the video signal comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Synthetic simulator process piping raw frames
    Simulation,
    /// Local capture device read directly by the transcoder
    Camera,
    /// Remote network stream read directly by the transcoder
    Remote,
}

/// Identity of a pipeline session. At most one session exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "target")]
pub enum SessionKey {
    Simulation,
    Camera(PathBuf),
    Remote(String),
}

impl SessionKey {
    pub fn kind(&self) -> SourceKind {
        match self {
            SessionKey::Simulation => SourceKind::Simulation,
            SessionKey::Camera(_) => SourceKind::Camera,
            SessionKey::Remote(_) => SourceKind::Remote,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Simulation => write!(f, "simulation"),
            SessionKey::Camera(path) => write!(f, "camera:{}", path.display()),
            SessionKey::Remote(url) => write!(f, "remote:{}", url),
        }
    }
}

/// Lifecycle state of the session under a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Nothing running under this key
    Idle,
    /// Processes are being spawned
    Starting,
    /// Transcoder is alive and relaying
    Running,
    /// Termination signals have been issued
    Stopping,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Which of the pipeline's external processes an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Source,
    Transcoder,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Source => write!(f, "source"),
            ProcessRole::Transcoder => write!(f, "transcoder"),
        }
    }
}

/// Snapshot of a running session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: Uuid,
    pub key: SessionKey,
    pub state: SessionState,
    pub recording_path: PathBuf,
    pub ws_url: String,
    pub source_pid: Option<u32>,
    pub transcoder_pid: Option<u32>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Successful result of a start operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum StartOutcome {
    /// A new pipeline is running
    #[serde(rename_all = "camelCase")]
    Started { session_id: Uuid, ws_url: String },
    /// An identical pipeline was already running and was left untouched
    #[serde(rename_all = "camelCase")]
    AlreadyRunning { session_id: Uuid, ws_url: String },
}

impl StartOutcome {
    pub fn session_id(&self) -> Uuid {
        match self {
            StartOutcome::Started { session_id, .. }
            | StartOutcome::AlreadyRunning { session_id, .. } => *session_id,
        }
    }

    pub fn ws_url(&self) -> &str {
        match self {
            StartOutcome::Started { ws_url, .. } | StartOutcome::AlreadyRunning { ws_url, .. } => {
                ws_url
            }
        }
    }
}

/// Lifecycle notifications published by the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum PipelineEvent {
    /// Session under `key` moved to `state`
    #[serde(rename_all = "camelCase")]
    StateChanged {
        key: SessionKey,
        session_id: Uuid,
        state: SessionState,
    },
    /// One of the session's processes exited. `requested` is true when the
    /// exit followed a stop call.
    #[serde(rename_all = "camelCase")]
    ProcessExited {
        key: SessionKey,
        session_id: Uuid,
        role: ProcessRole,
        code: Option<i32>,
        requested: bool,
    },
    /// Asynchronous failure of a running session
    #[serde(rename_all = "camelCase")]
    Failed {
        key: SessionKey,
        session_id: Uuid,
        message: String,
    },
    /// A viewer finished its handshake on the endpoint bound for `port`
    #[serde(rename_all = "camelCase")]
    ClientConnected { port: u16, client_id: ClientId },
    /// A viewer left or was dropped
    #[serde(rename_all = "camelCase")]
    ClientDisconnected { port: u16, client_id: ClientId },
}

/// Video pipeline errors
#[derive(Error, Debug)]
pub enum VideoError {
    #[error("Simulator not found (tried: {0})")]
    SourceNotFound(String),

    #[error("Failed to spawn {process}: {source}")]
    ProcessSpawn {
        process: ProcessRole,
        #[source]
        source: std::io::Error,
    },

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Invalid stream URL: {0}")]
    InvalidUrl(String),

    #[error("{process} exited unexpectedly (code {code:?})")]
    UnexpectedExit {
        process: ProcessRole,
        code: Option<i32>,
    },

    #[error("Client connection error: {0}")]
    Connection(String),

    #[error("Failed to bind broadcast endpoint {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Port {port} is serving {holder}")]
    PortInUse { port: u16, holder: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VideoResult<T> = Result<T, VideoError>;
