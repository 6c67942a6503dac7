// Input probing using ffprobe

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use tracing::debug;

use super::error::{EngineError, EngineResult};
use super::hardware::apply_gpu_env;

/// What sizing and encoder choice need to know about a source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_s: f64,
    pub video_codec: Option<String>,
    pub video_kbps: Option<u64>,
    pub audio_kbps: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

/// Probe a media file. A missing or non-positive duration is an error since
/// nothing downstream can size an encode without it.
pub fn probe_media(ffprobe: &str, input_path: &Path) -> EngineResult<MediaInfo> {
    let mut cmd = Command::new(ffprobe);
    cmd.args([
        "-v",
        "error",
        "-show_entries",
        "format=duration:stream=index,codec_type,codec_name,bit_rate",
        "-of",
        "json",
    ])
    .arg(input_path);
    apply_gpu_env(&mut cmd);

    let output = cmd.output().map_err(|source| EngineError::Spawn {
        program: ffprobe.to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(EngineError::ProbeFailed(format!(
            "ffprobe failed for {}: {}",
            input_path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let info = parse_probe_json(&String::from_utf8_lossy(&output.stdout))?;
    debug!(path = %input_path.display(), duration = info.duration_s, "probed input");
    Ok(info)
}

/// Parse ffprobe JSON (for testing and for callers holding the output already)
pub fn parse_probe_json(json: &str) -> EngineResult<MediaInfo> {
    let probe: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| EngineError::ProbeFailed(format!("Failed to parse ffprobe JSON: {}", e)))?;

    let duration_s = probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.trim().parse::<f64>().ok())
        .ok_or_else(|| EngineError::ProbeFailed("No duration found in ffprobe output".into()))?;

    if !duration_s.is_finite() || duration_s <= 0.0 {
        return Err(EngineError::ProbeFailed(format!(
            "unusable duration {}",
            duration_s
        )));
    }

    let first = |kind: &str| {
        probe
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(kind))
    };
    let kbps = |s: &FfprobeStream| {
        s.bit_rate
            .as_deref()
            .and_then(|b| b.parse::<u64>().ok())
            .map(|bps| bps / 1000)
    };

    let video = first("video");
    Ok(MediaInfo {
        duration_s,
        video_codec: video.and_then(|s| s.codec_name.clone()),
        video_kbps: video.and_then(kbps),
        audio_kbps: first("audio").and_then(kbps),
    })
}
