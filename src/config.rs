// Global configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::core::{Container, TranscodeRequest};
use crate::engine::hardware::DetectOptions;
use crate::engine::validate::ValidateOptions;
use crate::engine::worker::OrchestratorSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log filter used when `--verbose` is not given (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub probes: ProbesConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,

    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_target_size_mb")]
    pub target_size_mb: f64,

    /// Encoder name (`hevc_nvenc`, `libx264`) or codec family (`av1`)
    #[serde(default = "default_video_codec")]
    pub video_codec: String,

    /// `none` drops the audio track
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,

    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u64,

    /// p1 (fastest) .. p7 (slowest), or extraquality
    #[serde(default = "default_preset")]
    pub preset: String,

    #[serde(default = "default_tune")]
    pub tune: String,

    #[serde(default)]
    pub container: Container,

    /// Directory for derived output names; next to the input when unset
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbesConfig {
    /// Budget for each detection or validation probe
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,

    /// Budget for `ffmpeg -encoders`
    #[serde(default = "default_listing_timeout_secs")]
    pub listing_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Stderr lines kept for failure messages
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,

    /// Events replayed to late subscribers
    #[serde(default = "default_history_len")]
    pub history_len: usize,

    /// Seconds between SIGTERM and a hard kill on cancel
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Finished jobs remembered before the oldest are dropped
    #[serde(default = "default_finished_retention")]
    pub finished_retention: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Persist encoder validation results between runs
    #[serde(default = "default_true_config")]
    pub validation_cache: bool,

    #[serde(default = "default_validation_ttl_hours")]
    pub validation_ttl_hours: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_target_size_mb() -> f64 {
    25.0
}

fn default_video_codec() -> String {
    "av1_nvenc".to_string()
}

fn default_audio_codec() -> String {
    "libopus".to_string()
}

fn default_audio_bitrate_kbps() -> u64 {
    128
}

fn default_preset() -> String {
    "p6".to_string()
}

fn default_tune() -> String {
    "hq".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_listing_timeout_secs() -> u64 {
    3
}

fn default_max_workers() -> usize {
    1
}

fn default_log_tail_lines() -> usize {
    20
}

fn default_history_len() -> usize {
    64
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_finished_retention() -> usize {
    256
}

fn default_true_config() -> bool {
    true
}

fn default_validation_ttl_hours() -> u64 {
    720
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            tools: ToolsConfig::default(),
            defaults: DefaultsConfig::default(),
            probes: ProbesConfig::default(),
            jobs: JobsConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            target_size_mb: default_target_size_mb(),
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            preset: default_preset(),
            tune: default_tune(),
            container: Container::Mp4,
            output_dir: None,
        }
    }
}

impl Default for ProbesConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_probe_timeout_secs(),
            listing_timeout_secs: default_listing_timeout_secs(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            log_tail_lines: default_log_tail_lines(),
            history_len: default_history_len(),
            cancel_grace_secs: default_cancel_grace_secs(),
            finished_retention: default_finished_retention(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            validation_cache: true,
            validation_ttl_hours: default_validation_ttl_hours(),
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = if cfg!(target_os = "macos") {
            dirs::home_dir()
                .context("Could not determine home directory")?
                .join(".config")
                .join("sizepress")
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("sizepress")
        };

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from disk; built-in defaults when the file is missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Check if config file exists
    pub fn exists() -> bool {
        Self::config_path().map(|p| p.exists()).unwrap_or(false)
    }

    /// Create a default config file if it doesn't exist
    pub fn ensure_default() -> Result<()> {
        if !Self::exists() {
            let config = Config::default();
            config.save()?;
        }
        Ok(())
    }

    pub fn detect_options(&self) -> DetectOptions {
        DetectOptions {
            ffmpeg: self.tools.ffmpeg.clone(),
            probe_timeout: Duration::from_secs(self.probes.timeout_secs),
            listing_timeout: Duration::from_secs(self.probes.listing_timeout_secs),
        }
    }

    pub fn validate_options(&self) -> ValidateOptions {
        ValidateOptions {
            ffmpeg: self.tools.ffmpeg.clone(),
            timeout: Duration::from_secs(self.probes.timeout_secs),
            scratch_dir: std::env::temp_dir().join(format!("sizepress-validate-{}", std::process::id())),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            ffmpeg: self.tools.ffmpeg.clone(),
            ffprobe: self.tools.ffprobe.clone(),
            max_workers: self.jobs.max_workers.max(1),
            log_tail_lines: self.jobs.log_tail_lines,
            history_len: self.jobs.history_len,
            cancel_grace: Duration::from_secs(self.jobs.cancel_grace_secs),
            output_dir: self.defaults.output_dir.clone(),
            finished_retention: self.jobs.finished_retention,
        }
    }

    /// A request for `input` pre-filled from `[defaults]`
    pub fn request_for(&self, input: impl Into<PathBuf>) -> TranscodeRequest {
        let d = &self.defaults;
        TranscodeRequest {
            video_codec: d.video_codec.clone(),
            audio_codec: d.audio_codec.clone(),
            audio_bitrate_kbps: d.audio_bitrate_kbps,
            preset: d.preset.clone(),
            tune: d.tune.clone(),
            container: d.container,
            ..TranscodeRequest::new(input, d.target_size_mb)
        }
    }
}
