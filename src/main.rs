//! Command-line runner for the video pipeline
//!
//! Starts a single pipeline, prints the WebSocket URL viewers connect to
//! and keeps it running until Ctrl-C or until the pipeline fails.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use robot_studio_video_lib::init_tracing;
use robot_studio_video_lib::video::{
    PipelineEvent, ProcessRole, SimulationRequest, SimulationStart, SimulatorLocator,
    SourceCommand, StartOutcome, VideoConfig, VideoManager,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "robot-studio-video", version, about = "Stream and record robot video")]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = "ROBOT_STUDIO_VIDEO_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket port viewers connect to
    #[arg(long, short)]
    port: Option<u16>,

    /// Interface to bind the WebSocket server to
    #[arg(long)]
    bind: Option<String>,

    /// FFmpeg executable
    #[arg(long, env = "ROBOT_STUDIO_FFMPEG")]
    ffmpeg: Option<PathBuf>,

    /// Archival recording written by the transcoder
    #[arg(long, short, default_value = "recording.mp4")]
    recording: PathBuf,

    #[command(subcommand)]
    source: Source,
}

#[derive(Subcommand, Debug)]
enum Source {
    /// Run the robot simulator
    Simulate {
        #[arg(long)]
        repo_id: Option<String>,
        #[arg(long)]
        policy_type: Option<String>,
        #[arg(long)]
        episodes: Option<u32>,
        #[arg(long)]
        fps: Option<u32>,
        /// Configuration file handed to the simulator
        #[arg(long)]
        sim_config: Option<PathBuf>,
        /// Run this program instead of looking up the simulator
        #[arg(long)]
        program: Option<PathBuf>,
        /// Extra arguments passed through to the simulator
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Stream a local capture device
    Camera { device: PathBuf },
    /// Stream a remote camera (rtsp, rtmp, http, srt, udp)
    Remote { url: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => VideoConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => VideoConfig::default(),
    };
    if let Some(ffmpeg) = cli.ffmpeg {
        config.ffmpeg_path = Some(ffmpeg);
    }
    if let Some(bind) = cli.bind {
        config.bind_host = bind;
    }
    let grace = config.stop_grace_period();

    let manager = VideoManager::new(config)?;
    let mut events = manager.subscribe();

    let outcome = match cli.source {
        Source::Simulate {
            repo_id,
            policy_type,
            episodes,
            fps,
            sim_config,
            program,
            args,
        } => {
            let request = SimulationRequest {
                repo_id,
                policy_type,
                episodes,
                fps,
                config_path: sim_config,
                extra_args: args,
            };
            let command = match program {
                Some(program) => SourceCommand::new(program, request.to_args()),
                None => SimulatorLocator::from_config(manager.config()).resolve(&request)?,
            };
            manager
                .start_simulation(SimulationStart {
                    command,
                    recording_path: cli.recording.clone(),
                    port: cli.port,
                })
                .await?
        }
        Source::Camera { device } => {
            manager
                .start_camera(&device, cli.recording.clone(), cli.port)
                .await?
        }
        Source::Remote { url } => {
            manager
                .start_remote_stream(&url, cli.recording.clone(), cli.port)
                .await?
        }
    };

    println!("{}", outcome.ws_url());
    let session_id = outcome.session_id();

    let failure = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping pipeline");
                break None;
            }
            event = events.recv() => match event {
                Ok(PipelineEvent::Failed { message, .. }) => break Some(message),
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} events", skipped);
                }
                Err(RecvError::Closed) => break None,
            },
        }
    };

    manager.shutdown().await;
    if let Some(message) = failure {
        bail!("Pipeline {} failed: {}", session_id, message);
    }
    wait_for_transcoder(&mut events, &outcome, grace).await;
    tracing::info!("Recording saved to {}", cli.recording.display());
    Ok(())
}

fn log_event(event: &PipelineEvent) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::info!("{}", json),
        Err(e) => tracing::warn!("Failed to serialize event: {}", e),
    }
}

/// Give the transcoder time to finalize the recording before the runtime
/// drops its process
async fn wait_for_transcoder(
    events: &mut tokio::sync::broadcast::Receiver<PipelineEvent>,
    outcome: &StartOutcome,
    grace: Option<Duration>,
) {
    let session_id = outcome.session_id();
    let limit = grace.unwrap_or(Duration::from_secs(10)) + Duration::from_secs(1);

    let wait = async {
        loop {
            match events.recv().await {
                Ok(PipelineEvent::ProcessExited {
                    session_id: id,
                    role: ProcessRole::Transcoder,
                    ..
                }) if id == session_id => return,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            }
        }
    };

    if tokio::time::timeout(limit, wait).await.is_err() {
        tracing::warn!("Transcoder did not exit within {:?}", limit);
    }
}
