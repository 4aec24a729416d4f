//! Video pipeline configuration
//!
//! Plain values handed to the manager by its owner. Nothing here is read
//! from or written to the application database; a caller may load it from a
//! JSON file or build it in code.

use super::types::{VideoError, VideoResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default WebSocket port the viewers connect to
pub const DEFAULT_PORT: u16 = 9999;

/// Raw frame layout produced by the simulator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub pixel_format: String,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            framerate: 30,
            pixel_format: "rgb24".to_string(),
        }
    }
}

impl FrameFormat {
    /// Frame size in FFmpeg's `WxH` notation
    pub fn video_size(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Configuration for the video manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoConfig {
    /// Explicit transcoder executable. When unset the bundled binary is
    /// searched for, then `ffmpeg` on PATH.
    pub ffmpeg_path: Option<PathBuf>,

    /// Resource directory of a packaged install (contains `bin/`)
    pub resources_dir: Option<PathBuf>,

    /// Application root of a development checkout
    pub app_root: PathBuf,

    /// Interpreter used when the simulator is only available as a script
    pub python_path: PathBuf,

    /// Interface the broadcast endpoint binds to
    pub bind_host: String,

    /// Broadcast port used when a start call does not name one
    pub port: u16,

    /// Raw frame layout for the simulation input
    pub frame: FrameFormat,

    /// Target bitrate of the streaming output
    pub stream_bitrate: String,

    /// Maximum bytes read from the transcoder per chunk
    pub read_chunk_size: usize,

    /// Chunks a client may have in flight before new ones are dropped for it
    pub client_queue_depth: usize,

    /// Time a process gets after its termination signal before it is
    /// force-killed. `None` never escalates.
    pub stop_grace_period_ms: Option<u64>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            resources_dir: None,
            app_root: PathBuf::from("."),
            python_path: PathBuf::from("python3"),
            bind_host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            frame: FrameFormat::default(),
            stream_bitrate: "1000k".to_string(),
            read_chunk_size: 64 * 1024,
            client_queue_depth: 8,
            stop_grace_period_ms: Some(5000),
        }
    }
}

impl VideoConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> VideoResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: VideoConfig = serde_json::from_str(&content)
            .map_err(|e| VideoError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;

        tracing::debug!("Loaded video config from {:?}", path);
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> VideoResult<()> {
        if self.frame.width == 0 || self.frame.height == 0 {
            return Err(VideoError::Config("frame size must be non-zero".to_string()));
        }
        if self.frame.framerate == 0 {
            return Err(VideoError::Config("framerate must be non-zero".to_string()));
        }
        if self.read_chunk_size == 0 {
            return Err(VideoError::Config("readChunkSize must be non-zero".to_string()));
        }
        if self.client_queue_depth == 0 {
            return Err(VideoError::Config(
                "clientQueueDepth must be at least 1".to_string(),
            ));
        }
        if self.bind_host.is_empty() {
            return Err(VideoError::Config("bindHost must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn stop_grace_period(&self) -> Option<Duration> {
        self.stop_grace_period_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_stream_contract() {
        let config = VideoConfig::default();
        assert_eq!(config.port, 9999);
        assert_eq!(config.frame.video_size(), "640x480");
        assert_eq!(config.frame.framerate, 30);
        assert_eq!(config.stream_bitrate, "1000k");
        assert_eq!(config.stop_grace_period(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("video.json");
        fs::write(
            &path,
            r#"{ "port": 8081, "frame": { "width": 320 }, "stopGracePeriodMs": null }"#,
        )
        .unwrap();

        let config = VideoConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.frame.width, 320);
        assert_eq!(config.frame.height, 480);
        assert_eq!(config.stop_grace_period(), None);
        assert_eq!(config.bind_host, "127.0.0.1");
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("video.json");
        fs::write(&path, r#"{ "clientQueueDepth": 0 }"#).unwrap();
        assert!(matches!(
            VideoConfig::from_file(&path),
            Err(VideoError::Config(_))
        ));

        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            VideoConfig::from_file(&path),
            Err(VideoError::Config(_))
        ));
    }
}
