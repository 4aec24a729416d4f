//! Source command construction
//!
//! Turns a logical source request (simulation, capture device, remote
//! stream) into the concrete parameters the manager spawns with. Nothing in
//! here starts or supervises a process.

use super::config::VideoConfig;
use super::types::{VideoError, VideoResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use url::Url;

/// Schemes the transcoder can open as a network input
const REMOTE_SCHEMES: &[&str] = &["rtsp", "rtsps", "rtmp", "http", "https", "srt", "udp"];

/// A program plus arguments to launch as the source process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SourceCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Caller-facing parameters of a simulation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationRequest {
    pub repo_id: Option<String>,
    pub policy_type: Option<String>,
    pub episodes: Option<u32>,
    pub fps: Option<u32>,
    pub config_path: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

impl SimulationRequest {
    /// Command-line arguments understood by the simulator
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(ref repo_id) = self.repo_id {
            args.extend(["--repo_id".to_string(), repo_id.clone()]);
        }
        if let Some(ref policy_type) = self.policy_type {
            args.extend(["--policy_type".to_string(), policy_type.clone()]);
        }
        if let Some(episodes) = self.episodes {
            args.extend(["--episodes".to_string(), episodes.to_string()]);
        }
        if let Some(fps) = self.fps {
            args.extend(["--fps".to_string(), fps.to_string()]);
        }
        if let Some(ref config_path) = self.config_path {
            args.extend([
                "--config_path".to_string(),
                config_path.to_string_lossy().to_string(),
            ]);
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// One place the simulator may live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatorCandidate {
    /// Frozen binary shipped with a packaged install
    Packaged(PathBuf),
    /// Frozen binary built in a development checkout
    Development(PathBuf),
    /// Plain script run through an interpreter
    Script { interpreter: PathBuf, script: PathBuf },
}

impl SimulatorCandidate {
    /// The file whose presence makes this candidate usable
    pub fn path(&self) -> &Path {
        match self {
            SimulatorCandidate::Packaged(path) | SimulatorCandidate::Development(path) => path,
            SimulatorCandidate::Script { script, .. } => script,
        }
    }

    fn into_command(self, mut args: Vec<String>) -> SourceCommand {
        match self {
            SimulatorCandidate::Packaged(path) | SimulatorCandidate::Development(path) => {
                SourceCommand::new(path, args)
            }
            SimulatorCandidate::Script {
                interpreter,
                script,
            } => {
                // -u keeps the interpreter from block-buffering the frame pipe
                let mut full = vec!["-u".to_string(), script.to_string_lossy().to_string()];
                full.append(&mut args);
                SourceCommand::new(interpreter, full)
            }
        }
    }
}

/// Finds the simulator among its install locations
#[derive(Debug, Clone)]
pub struct SimulatorLocator {
    resources_dir: Option<PathBuf>,
    app_root: PathBuf,
    python: PathBuf,
}

impl SimulatorLocator {
    pub fn new(resources_dir: Option<PathBuf>, app_root: PathBuf, python: PathBuf) -> Self {
        Self {
            resources_dir,
            app_root,
            python,
        }
    }

    pub fn from_config(config: &VideoConfig) -> Self {
        Self::new(
            config.resources_dir.clone(),
            config.app_root.clone(),
            config.python_path.clone(),
        )
    }

    /// Candidate locations in lookup order
    pub fn candidates(&self) -> Vec<SimulatorCandidate> {
        let binary = format!("simulate{}", std::env::consts::EXE_SUFFIX);
        let python_dir = self.app_root.join("src").join("python");

        let mut candidates = Vec::with_capacity(3);
        if let Some(ref resources) = self.resources_dir {
            candidates.push(SimulatorCandidate::Packaged(resources.join("bin").join(&binary)));
        }
        candidates.push(SimulatorCandidate::Development(
            python_dir.join("dist").join(&binary),
        ));
        candidates.push(SimulatorCandidate::Script {
            interpreter: self.python.clone(),
            script: python_dir.join("simulate.py"),
        });
        candidates
    }

    /// Resolve the first existing candidate into a launchable command
    pub fn resolve(&self, request: &SimulationRequest) -> VideoResult<SourceCommand> {
        let candidates = self.candidates();

        for candidate in &candidates {
            if candidate.path().is_file() {
                tracing::info!("Using simulator at {:?}", candidate.path());
                return Ok(candidate.clone().into_command(request.to_args()));
            }
            tracing::debug!("Simulator candidate missing: {:?}", candidate.path());
        }

        let tried: Vec<String> = candidates
            .iter()
            .map(|c| c.path().display().to_string())
            .collect();
        Err(VideoError::SourceNotFound(tried.join(", ")))
    }
}

/// Check that a capture device can be opened before anything is spawned
pub fn validate_device(device_path: &Path) -> VideoResult<PathBuf> {
    let metadata = std::fs::metadata(device_path).map_err(|e| {
        VideoError::DeviceUnavailable(format!("{}: {}", device_path.display(), e))
    })?;

    if metadata.is_dir() {
        return Err(VideoError::DeviceUnavailable(format!(
            "{}: is a directory",
            device_path.display()
        )));
    }

    File::open(device_path).map_err(|e| {
        VideoError::DeviceUnavailable(format!("{}: {}", device_path.display(), e))
    })?;

    Ok(device_path.to_path_buf())
}

/// Transport used for remote inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteTransport {
    Tcp,
}

impl RemoteTransport {
    pub fn as_arg(&self) -> &'static str {
        match self {
            RemoteTransport::Tcp => "tcp",
        }
    }
}

/// A validated remote stream input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSource {
    pub url: Url,
    pub transport: RemoteTransport,
}

/// Parse and check a remote stream URL. Connectivity is not probed; the
/// transcoder reports unreachable hosts through its exit status.
pub fn validate_remote_url(raw: &str) -> VideoResult<RemoteSource> {
    let url = Url::parse(raw.trim()).map_err(|e| VideoError::InvalidUrl(format!("{}: {}", raw, e)))?;

    if !REMOTE_SCHEMES.contains(&url.scheme()) {
        return Err(VideoError::InvalidUrl(format!(
            "{}: unsupported scheme '{}'",
            raw,
            url.scheme()
        )));
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(VideoError::InvalidUrl(format!("{}: missing host", raw)));
    }

    Ok(RemoteSource {
        url,
        transport: RemoteTransport::Tcp,
    })
}
