// Transcode planning: codecs, sizing, trimming and command assembly

mod bitrate;
mod codec;
mod ffmpeg_cmd;
mod ffmpeg_info;
mod trim;
mod types;

pub use bitrate::{BitrateEstimate, LOW_VIDEO_KBPS, estimate};
pub use codec::{
    CodecFamily, DEFAULT_RENDER_NODE, Encoder, EncoderFamily, EncoderPlan, resolve,
    usable_encoders,
};
pub use ffmpeg_cmd::{
    CommandInputs, TranscodeCommand, build_transcode_cmd, resolve_audio_codec, scale_filter,
};
pub use ffmpeg_info::tool_version;
pub use trim::{TrimPlan, TrimWindow, format_seconds, parse_time};
pub use types::{Container, Job, JobStats, JobStatus, ProgressParser, TranscodeRequest};
