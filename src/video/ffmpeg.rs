//! FFmpeg transcoder command line
//!
//! The transcoder splits one input into an archival H.264 recording and an
//! MPEG-1 transport stream on stdout. The argument template is fixed so
//! existing viewers keep decoding it.

use super::config::VideoConfig;
use super::source::RemoteSource;
use std::path::{Path, PathBuf};

/// What the transcoder reads from
#[derive(Debug, Clone)]
pub enum TranscoderInput {
    /// Raw frames on stdin from the simulator
    Pipe,
    /// V4L2 capture device
    Device(PathBuf),
    /// Network stream
    Remote(RemoteSource),
}

/// Directory name of the bundled binaries for this platform
fn platform_dir() -> &'static str {
    if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else {
        "linux"
    }
}

/// Locate the FFmpeg executable
///
/// An explicit `ffmpegPath` wins. Otherwise the bundled binary of a packaged
/// install or a development checkout is used, then `ffmpeg` from PATH.
pub fn resolve_ffmpeg_path(config: &VideoConfig) -> PathBuf {
    if let Some(ref path) = config.ffmpeg_path {
        return path.clone();
    }

    let binary = format!("ffmpeg{}", std::env::consts::EXE_SUFFIX);
    let mut candidates = Vec::with_capacity(2);
    if let Some(ref resources) = config.resources_dir {
        candidates.push(resources.join("bin").join(platform_dir()).join(&binary));
    }
    candidates.push(
        config
            .app_root
            .join("src")
            .join("bin")
            .join(platform_dir())
            .join(&binary),
    );

    for candidate in candidates {
        if candidate.is_file() {
            return candidate;
        }
    }

    tracing::warn!("Bundled ffmpeg not found, falling back to system PATH");
    PathBuf::from(binary)
}

/// Build the full transcoder argument list
pub fn build_transcoder_args(
    input: &TranscoderInput,
    recording_path: &Path,
    config: &VideoConfig,
) -> Vec<String> {
    let frame = &config.frame;

    let mut args: Vec<String> = match input {
        TranscoderInput::Pipe => vec![
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pixel_format".to_string(),
            frame.pixel_format.clone(),
            "-video_size".to_string(),
            frame.video_size(),
            "-framerate".to_string(),
            frame.framerate.to_string(),
            "-i".to_string(),
            "pipe:0".to_string(),
        ],
        TranscoderInput::Device(device) => vec![
            "-f".to_string(),
            "v4l2".to_string(),
            "-framerate".to_string(),
            frame.framerate.to_string(),
            "-video_size".to_string(),
            frame.video_size(),
            "-i".to_string(),
            device.to_string_lossy().to_string(),
        ],
        TranscoderInput::Remote(remote) => vec![
            "-rtsp_transport".to_string(),
            remote.transport.as_arg().to_string(),
            "-i".to_string(),
            remote.url.to_string(),
        ],
    };

    args.extend([
        "-filter_complex".to_string(),
        "[0:v]split=2[rec][stream]".to_string(),
        // Archival output
        "-map".to_string(),
        "[rec]".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "ultrafast".to_string(),
        "-y".to_string(),
        recording_path.to_string_lossy().to_string(),
        // Streaming output, no B-frames
        "-map".to_string(),
        "[stream]".to_string(),
        "-c:v".to_string(),
        "mpeg1video".to_string(),
        "-b:v".to_string(),
        config.stream_bitrate.clone(),
        "-bf".to_string(),
        "0".to_string(),
        "-f".to_string(),
        "mpegts".to_string(),
        "pipe:1".to_string(),
    ]);

    args
}
