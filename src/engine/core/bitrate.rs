//! Target-size bitrate arithmetic.
//!
//! Rates are kept as fractional kbps; rounding happens only when they are
//! written into an ffmpeg argument.

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

/// Below this the video stream is likely to look bad
pub const LOW_VIDEO_KBPS: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BitrateEstimate {
    pub total_kbps: f64,
    pub video_kbps: f64,
    pub audio_kbps: u64,
    pub maxrate_kbps: f64,
    pub bufsize_kbps: f64,
    pub low_quality_warning: bool,
}

/// Split a size budget into video and audio bitrates.
///
/// `total = target_mb * 8192 / duration`; video gets what audio leaves, never
/// less than zero. Rate control headroom is 1.2x for maxrate and 2x for the
/// VBV buffer.
pub fn estimate(target_mb: f64, duration_s: f64, audio_kbps: u64) -> EngineResult<BitrateEstimate> {
    if !duration_s.is_finite() || duration_s <= 0.0 {
        return Err(EngineError::InvalidDuration(duration_s));
    }
    let target_mb = if target_mb.is_finite() { target_mb.max(0.0) } else { 0.0 };

    let total_kbps = target_mb * 8192.0 / duration_s;
    let video_kbps = (total_kbps - audio_kbps as f64).max(0.0);

    Ok(BitrateEstimate {
        total_kbps,
        video_kbps,
        audio_kbps,
        maxrate_kbps: video_kbps * 1.2,
        bufsize_kbps: video_kbps * 2.0,
        low_quality_warning: video_kbps < LOW_VIDEO_KBPS,
    })
}
