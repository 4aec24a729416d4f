//! Video pipeline command handlers
//!
//! Handlers behind the application's simulation, camera and stream
//! controls. Start handlers never fail outright; they answer with
//! `{ ok, wsUrl, message }` so the caller can show the error text.

use crate::utils::error::{AppResult, ErrorResponse};
use crate::video::{
    PipelineEvent, ProcessRole, SessionInfo, SessionKey, SimulationRequest, SimulationStart,
    SimulatorLocator, SourceKind, StartOutcome, VideoConfig, VideoManager,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Sent when the simulation's transcoder goes away for any reason
pub const SIMULATION_STOPPED: &str = "simulation-stopped";
pub const VIDEO_STATE_CHANGED: &str = "video-state-changed";
pub const VIDEO_ERROR: &str = "video-error";
pub const VIDEO_CLIENTS_CHANGED: &str = "video-clients-changed";

/// Cameras and remote streams each get an ephemeral port so several can
/// run next to the simulation
const DEVICE_PORT: u16 = 0;

/// Answer to a start or stop request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl StartResponse {
    fn started(outcome: StartOutcome, recording_path: PathBuf) -> Self {
        let message = match outcome {
            StartOutcome::Started { .. } => None,
            StartOutcome::AlreadyRunning { .. } => Some("Already running".to_string()),
        };
        Self {
            ok: true,
            ws_url: Some(outcome.ws_url().to_string()),
            session_id: Some(outcome.session_id()),
            recording_path: Some(recording_path),
            message,
            code: None,
        }
    }

    fn acknowledged(message: &str) -> Self {
        Self {
            ok: true,
            ws_url: None,
            session_id: None,
            recording_path: None,
            message: Some(message.to_string()),
            code: None,
        }
    }
}

impl From<ErrorResponse> for StartResponse {
    fn from(error: ErrorResponse) -> Self {
        Self {
            ok: false,
            ws_url: None,
            session_id: None,
            recording_path: None,
            message: Some(error.message),
            code: Some(error.code),
        }
    }
}

/// State for the video commands
pub struct VideoState {
    manager: Arc<VideoManager>,
    locator: SimulatorLocator,
    recordings_dir: PathBuf,
}

impl VideoState {
    /// Build the manager and make sure the recordings directory exists
    pub fn new(config: VideoConfig, recordings_dir: impl Into<PathBuf>) -> AppResult<Self> {
        let recordings_dir = recordings_dir.into();
        std::fs::create_dir_all(&recordings_dir)?;

        let locator = SimulatorLocator::from_config(&config);
        let manager = Arc::new(VideoManager::new(config)?);

        Ok(Self {
            manager,
            locator,
            recordings_dir,
        })
    }

    pub fn manager(&self) -> &Arc<VideoManager> {
        &self.manager
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    /// Fresh, timestamped recording file for a source kind
    fn recording_path(&self, kind: SourceKind) -> PathBuf {
        let prefix = match kind {
            SourceKind::Simulation => "simulation",
            SourceKind::Camera => "camera",
            SourceKind::Remote => "remote",
        };
        let stamp = Utc::now().format("%Y%m%d-%H%M%S%.3f");
        self.recordings_dir.join(format!("{}-{}.mp4", prefix, stamp))
    }

    /// Forward pipeline events under their notification names
    ///
    /// The task ends when the manager is dropped.
    pub fn forward_events<F>(&self, emit: F) -> JoinHandle<()>
    where
        F: Fn(&'static str, &PipelineEvent) + Send + 'static,
    {
        let mut rx = self.manager.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Some(name) = notification_for(&event) {
                            emit(name, &event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dropped {} video events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Notification name for a pipeline event
pub fn notification_for(event: &PipelineEvent) -> Option<&'static str> {
    match event {
        PipelineEvent::ProcessExited {
            key: SessionKey::Simulation,
            role: ProcessRole::Transcoder,
            ..
        } => Some(SIMULATION_STOPPED),
        PipelineEvent::ProcessExited { .. } => None,
        PipelineEvent::StateChanged { .. } => Some(VIDEO_STATE_CHANGED),
        PipelineEvent::Failed { .. } => Some(VIDEO_ERROR),
        PipelineEvent::ClientConnected { .. } | PipelineEvent::ClientDisconnected { .. } => {
            Some(VIDEO_CLIENTS_CHANGED)
        }
    }
}

fn respond(result: AppResult<StartResponse>) -> StartResponse {
    result.unwrap_or_else(|e| {
        tracing::error!("Video command failed: {}", e);
        ErrorResponse::from(e).into()
    })
}

/// Start the simulator pipeline
pub async fn start_simulation(state: &VideoState, request: SimulationRequest) -> StartResponse {
    respond(try_start_simulation(state, request).await)
}

async fn try_start_simulation(
    state: &VideoState,
    request: SimulationRequest,
) -> AppResult<StartResponse> {
    let command = state.locator.resolve(&request)?;
    let recording_path = state.recording_path(SourceKind::Simulation);

    tracing::info!("Starting simulation, recording to {:?}", recording_path);
    let outcome = state
        .manager
        .start_simulation(SimulationStart {
            command,
            recording_path: recording_path.clone(),
            port: None,
        })
        .await?;

    Ok(StartResponse::started(outcome, recording_path))
}

/// Stop the simulator pipeline
pub async fn stop_simulation(state: &VideoState) -> StartResponse {
    if state.manager.stop_all(&SessionKey::Simulation).await {
        StartResponse::acknowledged("Simulation stopped")
    } else {
        StartResponse::acknowledged("Simulation was not running")
    }
}

/// Start streaming a local capture device on its own endpoint
pub async fn start_camera(state: &VideoState, device_path: String) -> StartResponse {
    let recording_path = state.recording_path(SourceKind::Camera);
    tracing::info!("Starting camera {}", device_path);

    let result = state
        .manager
        .start_camera(&device_path, recording_path.clone(), Some(DEVICE_PORT))
        .await
        .map(|outcome| StartResponse::started(outcome, recording_path))
        .map_err(Into::into);
    respond(result)
}

/// Start streaming a remote camera
pub async fn start_rtsp(state: &VideoState, url: String) -> StartResponse {
    let recording_path = state.recording_path(SourceKind::Remote);
    tracing::info!("Starting remote stream {}", url);

    let result = state
        .manager
        .start_remote_stream(&url, recording_path.clone(), Some(DEVICE_PORT))
        .await
        .map(|outcome| StartResponse::started(outcome, recording_path))
        .map_err(Into::into);
    respond(result)
}

/// Running pipelines
pub fn get_video_sessions(state: &VideoState) -> Vec<SessionInfo> {
    state.manager.sessions()
}
