use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::{Container, TranscodeRequest, TrimWindow};

#[derive(Parser)]
#[command(name = "sizepress")]
#[command(about = "Compress videos to a target file size with hardware encoders", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Use this config file instead of the default location
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check if ffmpeg and ffprobe are installed
    CheckFfmpeg,

    /// Detect GPU hardware and validate encoders, printed as JSON
    HwInfo {
        /// Skip test encodes (shows cached results if any are still fresh)
        #[arg(long)]
        skip_validation: bool,
    },

    /// Probe a video file for duration, codec and bitrates
    Probe {
        /// Path to the video file
        file: PathBuf,
    },

    /// Compute the bitrate budget for a target size
    Estimate {
        /// Target output size in megabytes
        #[arg(long)]
        target_mb: f64,

        /// Output duration in seconds
        #[arg(long, required_unless_present = "input", conflicts_with = "input")]
        duration: Option<f64>,

        /// Probe this file for the duration instead
        #[arg(long)]
        input: Option<PathBuf>,

        /// Audio bitrate reserved out of the budget
        #[arg(long, default_value_t = 128)]
        audio_kbps: u64,
    },

    /// Compress one file, streaming progress events as JSON lines
    Compress(CompressArgs),

    /// Show config status and location, or create default config if missing
    InitConfig,
}

/// Options for `compress`. Anything left unset comes from `[defaults]`.
#[derive(clap::Args, Debug, Clone)]
pub struct CompressArgs {
    /// Source video
    pub input: PathBuf,

    /// Output file (defaults to `<stem>_<N>MB.<ext>` next to the input)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Target output size in megabytes
    #[arg(long)]
    pub target_mb: Option<f64>,

    /// Requested video encoder (e.g. av1_nvenc, hevc_vaapi, libx264)
    #[arg(long)]
    pub codec: Option<String>,

    /// Audio codec, or `none` to drop audio
    #[arg(long)]
    pub audio_codec: Option<String>,

    #[arg(long)]
    pub audio_kbps: Option<u64>,

    #[arg(long)]
    pub preset: Option<String>,

    #[arg(long)]
    pub tune: Option<String>,

    /// Output container (mp4 or mkv)
    #[arg(long)]
    pub container: Option<Container>,

    /// Trim start (seconds, MM:SS or HH:MM:SS)
    #[arg(long)]
    pub start: Option<String>,

    /// Trim end (seconds, MM:SS or HH:MM:SS)
    #[arg(long)]
    pub end: Option<String>,

    #[arg(long)]
    pub max_width: Option<u32>,

    #[arg(long)]
    pub max_height: Option<u32>,

    /// Decode on the GPU as well (only if the decode check passed)
    #[arg(long)]
    pub force_hw_decode: bool,

    /// Skip encoder test encodes and trust the detected profile
    #[arg(long)]
    pub skip_validation: bool,

    /// Print the ffmpeg command without running it
    #[arg(long)]
    pub dry_run: bool,
}

impl CompressArgs {
    /// Overlay the flags given on the command line onto `base`.
    pub fn apply(&self, base: TranscodeRequest) -> TranscodeRequest {
        TranscodeRequest {
            input_path: self.input.clone(),
            output_path: self.output.clone().or(base.output_path),
            target_size_mb: self.target_mb.unwrap_or(base.target_size_mb),
            video_codec: self.codec.clone().unwrap_or(base.video_codec),
            audio_codec: self.audio_codec.clone().unwrap_or(base.audio_codec),
            audio_bitrate_kbps: self.audio_kbps.unwrap_or(base.audio_bitrate_kbps),
            preset: self.preset.clone().unwrap_or(base.preset),
            tune: self.tune.clone().unwrap_or(base.tune),
            container: self.container.unwrap_or(base.container),
            trim: TrimWindow::new(self.start.as_deref(), self.end.as_deref()),
            max_width: self.max_width.or(base.max_width),
            max_height: self.max_height.or(base.max_height),
            force_hw_decode: self.force_hw_decode || base.force_hw_decode,
        }
    }
}
