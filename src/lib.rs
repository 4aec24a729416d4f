//! Robot Studio video - simulation and camera streaming for robot training.
//!
//! This is the library crate behind the robot studio's live video view.
//! It runs a frame source through FFmpeg, records the result and streams it
//! to WebSocket viewers.

pub mod commands;
pub mod utils;
pub mod video;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
///
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "robot_studio_video=debug,robot_studio_video_lib=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Robot Studio video v{}", env!("CARGO_PKG_VERSION"));
}
