//! Command handlers
//!
//! This module contains the request handlers an application shell calls
//! to drive the video pipeline.

pub mod video;

pub use video::{StartResponse, VideoState};
