//! Encoder catalogue and the codec-to-hardware fallback resolver.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::engine::hardware::{HardwareProfile, HardwareType};
use crate::engine::validate::{ValidationCache, cache_key};

/// Coarse codec type, independent of the vendor-specific encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecFamily {
    H264,
    Hevc,
    Av1,
}

impl CodecFamily {
    pub const ALL: [CodecFamily; 3] = [Self::H264, Self::Hevc, Self::Av1];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Av1 => "av1",
        }
    }

    /// Guaranteed fallback encoder for this family.
    pub fn software_encoder(&self) -> Encoder {
        match self {
            Self::H264 => Encoder::Libx264,
            Self::Hevc => Encoder::Libx265,
            Self::Av1 => Encoder::LibaomAv1,
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "h264" | "avc" => Some(Self::H264),
            "hevc" | "h265" => Some(Self::Hevc),
            "av1" => Some(Self::Av1),
            _ => None,
        }
    }
}

impl fmt::Display for CodecFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every encoder the transcoder knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoder {
    H264Nvenc,
    HevcNvenc,
    Av1Nvenc,
    H264Qsv,
    HevcQsv,
    Av1Qsv,
    H264Amf,
    HevcAmf,
    Av1Amf,
    H264Vaapi,
    HevcVaapi,
    Av1Vaapi,
    Libx264,
    Libx265,
    LibaomAv1,
    LibsvtAv1,
}

impl Encoder {
    pub const ALL: [Encoder; 16] = [
        Self::H264Nvenc,
        Self::HevcNvenc,
        Self::Av1Nvenc,
        Self::H264Qsv,
        Self::HevcQsv,
        Self::Av1Qsv,
        Self::H264Amf,
        Self::HevcAmf,
        Self::Av1Amf,
        Self::H264Vaapi,
        Self::HevcVaapi,
        Self::Av1Vaapi,
        Self::Libx264,
        Self::Libx265,
        Self::LibaomAv1,
        Self::LibsvtAv1,
    ];

    /// Get the FFmpeg encoder name
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            Self::H264Nvenc => "h264_nvenc",
            Self::HevcNvenc => "hevc_nvenc",
            Self::Av1Nvenc => "av1_nvenc",
            Self::H264Qsv => "h264_qsv",
            Self::HevcQsv => "hevc_qsv",
            Self::Av1Qsv => "av1_qsv",
            Self::H264Amf => "h264_amf",
            Self::HevcAmf => "hevc_amf",
            Self::Av1Amf => "av1_amf",
            Self::H264Vaapi => "h264_vaapi",
            Self::HevcVaapi => "hevc_vaapi",
            Self::Av1Vaapi => "av1_vaapi",
            Self::Libx264 => "libx264",
            Self::Libx265 => "libx265",
            Self::LibaomAv1 => "libaom-av1",
            Self::LibsvtAv1 => "libsvtav1",
        }
    }

    pub fn codec(&self) -> CodecFamily {
        match self {
            Self::H264Nvenc | Self::H264Qsv | Self::H264Amf | Self::H264Vaapi | Self::Libx264 => {
                CodecFamily::H264
            }
            Self::HevcNvenc | Self::HevcQsv | Self::HevcAmf | Self::HevcVaapi | Self::Libx265 => {
                CodecFamily::Hevc
            }
            Self::Av1Nvenc
            | Self::Av1Qsv
            | Self::Av1Amf
            | Self::Av1Vaapi
            | Self::LibaomAv1
            | Self::LibsvtAv1 => CodecFamily::Av1,
        }
    }

    pub fn family(&self) -> EncoderFamily {
        match self {
            Self::H264Nvenc | Self::HevcNvenc | Self::Av1Nvenc => EncoderFamily::Nvenc,
            Self::H264Qsv | Self::HevcQsv | Self::Av1Qsv => EncoderFamily::Qsv,
            Self::H264Amf | Self::HevcAmf | Self::Av1Amf => EncoderFamily::Amf,
            Self::H264Vaapi | Self::HevcVaapi | Self::Av1Vaapi => EncoderFamily::Vaapi,
            Self::Libx264 => EncoderFamily::X264,
            Self::Libx265 => EncoderFamily::X265,
            Self::LibaomAv1 => EncoderFamily::Aom,
            Self::LibsvtAv1 => EncoderFamily::SvtAv1,
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.family().is_hardware()
    }

    /// Device setup flags placed before the input.
    pub fn init_flags(&self, profile: &HardwareProfile) -> Vec<String> {
        match self.family() {
            EncoderFamily::Qsv => args(&["-init_hw_device", "qsv=hw", "-filter_hw_device", "hw"]),
            EncoderFamily::Vaapi => {
                let device = profile.device.as_deref().unwrap_or(DEFAULT_RENDER_NODE);
                args(&["-vaapi_device", device])
            }
            _ => Vec::new(),
        }
    }

    /// Encoder-specific output flags. VAAPI carries its upload chain here so
    /// scaling has to be merged into it.
    pub fn video_flags(&self) -> Vec<String> {
        match self {
            Self::Libx264 => args(&["-pix_fmt", "yuv420p", "-profile:v", "high"]),
            Self::Libx265 => args(&["-pix_fmt", "yuv420p"]),
            Self::LibsvtAv1 => args(&["-pix_fmt", "yuv420p"]),
            Self::H264Qsv | Self::HevcQsv | Self::Av1Qsv => args(&["-pix_fmt", "nv12"]),
            Self::H264Vaapi | Self::HevcVaapi | Self::Av1Vaapi => {
                args(&["-vf", "format=nv12,hwupload"])
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_name())
    }
}

impl FromStr for Encoder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Encoder::ALL
            .into_iter()
            .find(|e| e.ffmpeg_name() == lower)
            .ok_or_else(|| format!("unknown encoder '{}'", s))
    }
}

pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Encoder families, each with its own preset vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFamily {
    Nvenc,
    Qsv,
    Amf,
    Vaapi,
    X264,
    X265,
    Aom,
    SvtAv1,
}

impl EncoderFamily {
    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Nvenc | Self::Qsv | Self::Amf | Self::Vaapi)
    }

    /// Whether this family can run on the detected accelerator.
    pub fn runs_on(&self, hw: HardwareType) -> bool {
        match self {
            Self::Nvenc => hw == HardwareType::Nvidia,
            Self::Qsv => hw == HardwareType::Intel,
            Self::Amf => hw == HardwareType::Amd,
            Self::Vaapi => matches!(hw, HardwareType::Intel | HardwareType::Amd),
            _ => true,
        }
    }

    /// Map a p1..p7 preset (plus `extraquality`) into this family's flags.
    /// Anything unmapped lands on the family's medium equivalent.
    pub fn preset_args(&self, preset: &str) -> Vec<String> {
        let preset = preset.trim().to_ascii_lowercase();
        let (flag, table, medium): (&str, &[(&str, &str)], &str) = match self {
            Self::Nvenc => ("-preset", NVENC_PRESETS, "p4"),
            Self::Qsv => ("-preset", QSV_PRESETS, "medium"),
            Self::Amf => ("-quality", AMF_PRESETS, "balanced"),
            Self::Vaapi => ("-compression_level", VAAPI_PRESETS, "4"),
            Self::X264 | Self::X265 => ("-preset", X26X_PRESETS, "medium"),
            Self::SvtAv1 => ("-preset", SVT_PRESETS, "8"),
            Self::Aom => ("-cpu-used", AOM_PRESETS, "4"),
        };
        let value = lookup(table, &preset).unwrap_or(medium);

        let mut out = args(&[flag, value]);
        if *self == Self::Aom {
            out.extend(args(&["-row-mt", "1"]));
        }
        out
    }

    /// Tune flags. Only NVENC and x264 accept a tune here.
    pub fn tune_args(&self, tune: &str) -> Vec<String> {
        match self {
            Self::Nvenc => {
                let tune = tune.trim().to_ascii_lowercase();
                let value = match tune.as_str() {
                    "hq" | "ll" | "ull" | "lossless" => tune.as_str(),
                    _ => "hq",
                };
                args(&["-tune", value])
            }
            Self::X264 => args(&["-tune", "film"]),
            _ => Vec::new(),
        }
    }
}

fn lookup<'a>(table: &'a [(&str, &'a str)], key: &str) -> Option<&'a str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

const NVENC_PRESETS: &[(&str, &str)] = &[
    ("p1", "p1"),
    ("p2", "p2"),
    ("p3", "p3"),
    ("p4", "p4"),
    ("p5", "p5"),
    ("p6", "p6"),
    ("p7", "p7"),
    ("extraquality", "p7"),
];

const QSV_PRESETS: &[(&str, &str)] = &[
    ("p1", "veryfast"),
    ("p2", "faster"),
    ("p3", "fast"),
    ("p4", "medium"),
    ("p5", "slow"),
    ("p6", "slower"),
    ("p7", "veryslow"),
    ("extraquality", "veryslow"),
];

const AMF_PRESETS: &[(&str, &str)] = &[
    ("p1", "speed"),
    ("p2", "speed"),
    ("p3", "balanced"),
    ("p4", "balanced"),
    ("p5", "quality"),
    ("p6", "quality"),
    ("p7", "quality"),
    ("extraquality", "quality"),
];

// Lower level = more effort on VAAPI drivers.
const VAAPI_PRESETS: &[(&str, &str)] = &[
    ("p1", "7"),
    ("p2", "6"),
    ("p3", "5"),
    ("p4", "4"),
    ("p5", "3"),
    ("p6", "2"),
    ("p7", "1"),
    ("extraquality", "1"),
];

const X26X_PRESETS: &[(&str, &str)] = &[
    ("p1", "ultrafast"),
    ("p2", "superfast"),
    ("p3", "veryfast"),
    ("p4", "faster"),
    ("p5", "fast"),
    ("p6", "medium"),
    ("p7", "slow"),
    ("extraquality", "slower"),
];

const SVT_PRESETS: &[(&str, &str)] = &[
    ("p1", "12"),
    ("p2", "11"),
    ("p3", "10"),
    ("p4", "8"),
    ("p5", "7"),
    ("p6", "6"),
    ("p7", "5"),
    ("extraquality", "4"),
];

const AOM_PRESETS: &[(&str, &str)] = &[
    ("p1", "8"),
    ("p2", "7"),
    ("p3", "6"),
    ("p4", "5"),
    ("p5", "4"),
    ("p6", "3"),
    ("p7", "2"),
    ("extraquality", "1"),
];

/// Concrete, runnable encoder chosen for a job.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderPlan {
    pub requested: String,
    pub encoder: Encoder,
    pub video_flags: Vec<String>,
    pub init_flags: Vec<String>,
    /// Why the requested encoder was substituted, if it was.
    pub fallback: Option<String>,
}

impl EncoderPlan {
    fn direct(requested: &str, encoder: Encoder, profile: &HardwareProfile) -> Self {
        Self {
            requested: requested.to_string(),
            encoder,
            video_flags: encoder.video_flags(),
            init_flags: encoder.init_flags(profile),
            fallback: None,
        }
    }

    fn software(requested: &str, codec: CodecFamily, reason: String) -> Self {
        let encoder = codec.software_encoder();
        Self {
            requested: requested.to_string(),
            encoder,
            video_flags: encoder.video_flags(),
            init_flags: Vec::new(),
            fallback: Some(reason),
        }
    }
}

/// Resolve a requested codec token to an encoder that will launch.
///
/// Accepts encoder names (`hevc_nvenc`, `libx265`) or bare families (`hevc`).
/// A hardware encoder survives only if it runs on the detected vendor, is the
/// encoder the profile lists for its family, and has not failed validation.
/// Everything else falls back to the family's software encoder. Never fails.
pub fn resolve(
    requested: &str,
    profile: &HardwareProfile,
    validation: Option<&ValidationCache>,
) -> EncoderPlan {
    let token = requested.trim().to_ascii_lowercase();

    let candidate = match token.parse::<Encoder>() {
        Ok(encoder) => encoder,
        Err(_) => match CodecFamily::from_token(&token) {
            Some(codec) => profile.encoder_for(codec),
            None => {
                let plan = EncoderPlan::software(
                    requested,
                    CodecFamily::H264,
                    format!("unknown codec '{}'", requested),
                );
                warn!(requested, encoder = %plan.encoder, "unknown codec, using software encoder");
                return plan;
            }
        },
    };

    if !candidate.is_hardware() {
        return EncoderPlan::direct(requested, candidate, profile);
    }

    let reason = if !candidate.family().runs_on(profile.hw_type) {
        Some(format!(
            "{} is not supported on {} hardware",
            candidate,
            profile.hw_type.as_str()
        ))
    } else if profile.available_encoders.get(&candidate.codec()).map(String::as_str)
        != Some(candidate.ffmpeg_name())
    {
        Some(format!("{} is not in the ffmpeg encoder list", candidate))
    } else if let Some(cache) = validation {
        let key = cache_key(candidate.ffmpeg_name(), &candidate.init_flags(profile));
        match cache.get(&key).map(|r| r.failure()) {
            Some(None) => None,
            Some(Some(why)) => Some(format!("{} failed validation: {}", candidate, why)),
            None => Some(format!("{} was not validated", candidate)),
        }
    } else {
        None
    };

    match reason {
        None => {
            debug!(requested, encoder = %candidate, "using hardware encoder");
            EncoderPlan::direct(requested, candidate, profile)
        }
        Some(reason) => {
            let plan = EncoderPlan::software(requested, candidate.codec(), reason);
            warn!(
                requested,
                encoder = %plan.encoder,
                reason = plan.fallback.as_deref().unwrap_or_default(),
                "falling back to software encoder"
            );
            plan
        }
    }
}

/// Encoders a UI may offer, per family: the resolved hardware encoder when it
/// survives resolution, followed by the software encoders.
pub fn usable_encoders(
    profile: &HardwareProfile,
    validation: Option<&ValidationCache>,
) -> BTreeMap<CodecFamily, Vec<Encoder>> {
    let mut out = BTreeMap::new();
    for codec in CodecFamily::ALL {
        let mut list = Vec::new();
        let plan = resolve(codec.as_str(), profile, validation);
        if plan.encoder.is_hardware() {
            list.push(plan.encoder);
        }
        list.extend(
            Encoder::ALL
                .into_iter()
                .filter(|e| !e.is_hardware() && e.codec() == codec),
        );
        out.insert(codec, list);
    }
    out
}
