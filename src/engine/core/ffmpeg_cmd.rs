//! ffmpeg command assembly for a transcode job.

use std::path::Path;
use std::process::Command;

use super::bitrate::BitrateEstimate;
use super::codec::EncoderPlan;
use super::types::{Container, TranscodeRequest};
use crate::engine::hardware::apply_gpu_env;
use crate::engine::probe::MediaInfo;

/// A fully assembled ffmpeg invocation plus anything worth telling the user
/// about how it was assembled.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeCommand {
    pub program: String,
    pub args: Vec<String>,
    pub notices: Vec<String>,
}

impl TranscodeCommand {
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        apply_gpu_env(&mut cmd);
        cmd
    }

    /// Shell-quoted rendering for logs and dry runs
    pub fn display(&self) -> String {
        let parts = std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str));
        shlex::try_join(parts).unwrap_or_else(|_| {
            // Only fails on interior NUL bytes
            format!("{} {}", self.program, self.args.join(" "))
        })
    }
}

/// Everything the builder needs, already resolved.
pub struct CommandInputs<'a> {
    pub request: &'a TranscodeRequest,
    pub output_path: &'a Path,
    pub plan: &'a EncoderPlan,
    pub bitrate: &'a BitrateEstimate,
    pub media: &'a MediaInfo,
    /// Hardware decode flags, only when forced and validated
    pub decode_flags: Vec<String>,
}

/// Audio codec actually used for a container. MP4 cannot carry Opus
/// reliably, so it is swapped for AAC.
pub fn resolve_audio_codec(container: Container, requested: &str) -> (String, Option<String>) {
    let requested = requested.trim();
    if container == Container::Mp4 && requested.eq_ignore_ascii_case("libopus") {
        return (
            "aac".to_string(),
            Some("mp4 container selected; switching audio codec from libopus to aac".to_string()),
        );
    }
    (requested.to_string(), None)
}

/// Downscale-only filter; aspect ratio is kept and dimensions stay even.
pub fn scale_filter(max_width: Option<u32>, max_height: Option<u32>) -> Option<String> {
    match (max_width, max_height) {
        (Some(w), Some(h)) => Some(format!(
            "scale='min(iw,{})':'min(ih,{})':force_original_aspect_ratio=decrease",
            w, h
        )),
        (Some(w), None) => Some(format!("scale='min(iw,{})':-2", w)),
        (None, Some(h)) => Some(format!("scale=-2:'min(ih,{})'", h)),
        (None, None) => None,
    }
}

/// Merge scaling into the encoder's video flags. An existing `-vf` (the
/// VAAPI upload chain) gets the scale prepended; otherwise a new `-vf` is
/// appended.
fn merge_video_flags(video_flags: &[String], scale: Option<String>) -> Vec<String> {
    let mut flags = video_flags.to_vec();
    let Some(scale) = scale else {
        return flags;
    };
    match flags.iter().position(|f| f == "-vf") {
        Some(i) if i + 1 < flags.len() => {
            flags[i + 1] = format!("{},{}", scale, flags[i + 1]);
        }
        _ => flags.extend(["-vf".to_string(), scale]),
    }
    flags
}

/// Rates are fractional until here; ffmpeg gets whole kbps.
fn kbps(v: f64) -> String {
    format!("{}k", v.round() as u64)
}

/// Build the transcode command:
///
/// `ffmpeg -hide_banner -y [init] [hwdecode] [-ss] [-c:v libdav1d] -i IN
/// [-t|-to] -c:v ENC [video flags/-vf] -b:v -maxrate -bufsize [preset] [tune]
/// (-c:a -b:a | -an) [-movflags] -progress pipe:1 -nostats OUT`
///
/// Progress goes to stdout, diagnostics to stderr.
pub fn build_transcode_cmd(ffmpeg: &str, inputs: &CommandInputs) -> TranscodeCommand {
    let req = inputs.request;
    let plan = inputs.plan;
    let mut notices = Vec::new();
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into()];

    args.extend(plan.init_flags.iter().cloned());
    args.extend(inputs.decode_flags.iter().cloned());

    let trim = req.trim.plan();
    notices.extend(trim.notices);
    args.extend(trim.input_args);

    // AV1 sources decode through dav1d when a software encoder is in play
    if !plan.encoder.is_hardware()
        && inputs.decode_flags.is_empty()
        && inputs.media.video_codec.as_deref() == Some("av1")
    {
        args.extend(["-c:v".into(), "libdav1d".into()]);
        notices.push("AV1 source: decoding with libdav1d".to_string());
    }

    args.extend(["-i".into(), req.input_path.to_string_lossy().to_string()]);
    args.extend(trim.output_args);

    args.extend(["-c:v".into(), plan.encoder.ffmpeg_name().into()]);
    args.extend(merge_video_flags(
        &plan.video_flags,
        scale_filter(req.max_width, req.max_height),
    ));

    let br = inputs.bitrate;
    args.extend([
        "-b:v".into(),
        kbps(br.video_kbps),
        "-maxrate".into(),
        kbps(br.maxrate_kbps),
        "-bufsize".into(),
        kbps(br.bufsize_kbps),
    ]);

    let family = plan.encoder.family();
    args.extend(family.preset_args(&req.preset));
    args.extend(family.tune_args(&req.tune));

    if req.mutes_audio() {
        args.push("-an".into());
    } else {
        let (codec, notice) = resolve_audio_codec(req.container, &req.audio_codec);
        notices.extend(notice);
        args.extend(["-c:a".into(), codec, "-b:a".into(), kbps(br.audio_kbps as f64)]);
    }

    if req.container == Container::Mp4 {
        args.extend(["-movflags".into(), "+faststart".into()]);
    }

    args.extend(["-progress".into(), "pipe:1".into(), "-nostats".into()]);
    args.push(inputs.output_path.to_string_lossy().to_string());

    TranscodeCommand {
        program: ffmpeg.to_string(),
        args,
        notices,
    }
}
