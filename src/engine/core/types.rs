use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

use super::trim::TrimWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn can_move_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    #[default]
    Mp4,
    Mkv,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
        }
    }
}

impl FromStr for Container {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "mkv" | "matroska" => Ok(Self::Mkv),
            other => Err(format!("unsupported container '{}' (expected mp4 or mkv)", other)),
        }
    }
}

/// One transcode, as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeRequest {
    pub input_path: PathBuf,
    /// Derived from the input name when absent
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    pub target_size_mb: f64,
    pub video_codec: String,
    /// `none` drops audio
    pub audio_codec: String,
    pub audio_bitrate_kbps: u64,
    pub preset: String,
    pub tune: String,
    #[serde(default)]
    pub container: Container,
    #[serde(default)]
    pub trim: TrimWindow,
    #[serde(default)]
    pub max_width: Option<u32>,
    #[serde(default)]
    pub max_height: Option<u32>,
    #[serde(default)]
    pub force_hw_decode: bool,
}

impl TranscodeRequest {
    pub fn new(input_path: impl Into<PathBuf>, target_size_mb: f64) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: None,
            target_size_mb,
            video_codec: "av1_nvenc".to_string(),
            audio_codec: "libopus".to_string(),
            audio_bitrate_kbps: 128,
            preset: "p6".to_string(),
            tune: "hq".to_string(),
            container: Container::Mp4,
            trim: TrimWindow::default(),
            max_width: None,
            max_height: None,
            force_hw_decode: false,
        }
    }

    pub fn mutes_audio(&self) -> bool {
        self.audio_codec.trim().eq_ignore_ascii_case("none")
    }

    /// Audio bitrate reserved from the size budget; zero when muted.
    pub fn effective_audio_kbps(&self) -> u64 {
        if self.mutes_audio() {
            0
        } else {
            self.audio_bitrate_kbps
        }
    }

    /// Explicit output path, or `<stem>_<N>MB.<ext>` next to the input (or in
    /// `output_dir`).
    pub fn resolved_output_path(&self, output_dir: Option<&Path>) -> PathBuf {
        if let Some(path) = &self.output_path {
            return path.clone();
        }
        let stem = self
            .input_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let name = format!(
            "{}_{}MB.{}",
            stem,
            super::trim::format_seconds(self.target_size_mb),
            self.container.extension()
        );
        let dir = output_dir
            .map(Path::to_path_buf)
            .or_else(|| self.input_path.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        dir.join(name)
    }
}

/// Summary attached to a completed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub duration_s: f64,
    pub target_size_mb: f64,
    pub final_size_mb: f64,
    pub encoder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub request: TranscodeRequest,
    /// Ratio in [0, 1]
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    /// Last status or progress change
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub encoder: Option<String>,
    pub output_path: Option<PathBuf>,
    pub last_error: Option<String>,
    pub stats: Option<JobStats>,
}

impl Job {
    /// Create a new queued job
    pub fn new(request: TranscodeRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Queued,
            request,
            progress: 0.0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            encoder: None,
            output_path: None,
            last_error: None,
            stats: None,
        }
    }

    /// Move to `next` if allowed. A terminal status is final: every later
    /// transition is refused.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_move_to(next) {
            return false;
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        match next {
            JobStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => {
                self.finished_at = Some(now);
                if s == JobStatus::Completed {
                    self.progress = 1.0;
                }
            }
            _ => {}
        }
        true
    }

    /// Progress only moves forward and stays within [0, 1].
    pub fn set_progress(&mut self, ratio: f64) {
        if !ratio.is_finite() {
            return;
        }
        let next = self.progress.max(ratio.clamp(0.0, 1.0));
        if next > self.progress {
            self.progress = next;
            self.updated_at = Utc::now();
        }
    }
}

/// Parser for ffmpeg progress output (key=value format)
#[derive(Debug, Default, Clone)]
pub struct ProgressParser {
    pub out_time_us: u64,
    pub fps: Option<f64>,
    pub speed: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    pub total_size: Option<u64>,
    pub is_complete: bool,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a single line. Returns true when the line advanced `out_time`.
    pub fn parse_line(&mut self, line: &str) -> bool {
        let Some((key, value)) = line.split_once('=') else {
            return false;
        };
        let value = value.trim();
        match key.trim() {
            // ffmpeg reports out_time_ms in microseconds too
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<u64>() {
                    if us > self.out_time_us {
                        self.out_time_us = us;
                        return true;
                    }
                }
            }
            "fps" => {
                if let Ok(f) = value.parse::<f64>() {
                    self.fps = Some(f);
                }
            }
            "speed" => {
                // Speed is in format "1.23x", strip the 'x'
                if let Ok(s) = value.trim_end_matches('x').parse::<f64>() {
                    self.speed = Some(s);
                }
            }
            "bitrate" => {
                if let Ok(b) = value.trim_end_matches("kbits/s").parse::<f64>() {
                    self.bitrate_kbps = Some(b);
                }
            }
            "total_size" => {
                if let Ok(size) = value.parse::<u64>() {
                    self.total_size = Some(size);
                }
            }
            "progress" => {
                if value == "end" {
                    self.is_complete = true;
                }
            }
            _ => {}
        }
        false
    }

    /// Get output time in seconds
    pub fn out_time_s(&self) -> f64 {
        self.out_time_us as f64 / 1_000_000.0
    }

    /// Progress ratio against the encoded duration, clamped to [0, 1]
    pub fn ratio(&self, duration_s: f64) -> f64 {
        if self.is_complete {
            return 1.0;
        }
        if duration_s > 0.0 {
            (self.out_time_s() / duration_s).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}
