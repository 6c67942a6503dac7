//! Encoder validation: a tiny real encode (and decode) per candidate encoder
//! so the resolver never picks something that will fail at launch.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::engine::core::{CodecFamily, Encoder, EncoderFamily};
use crate::engine::error::EngineError;
use crate::engine::exec::{CommandRunner, ProbeOutput};
use crate::engine::hardware::{HardwareProfile, HardwareType};

/// Outcome of the hardware decode check for one encoder's codec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodeCheck {
    pub passed: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderTestResult {
    pub encoder: String,
    pub init_flags: Vec<String>,
    pub passed: bool,
    pub message: String,
    #[serde(default)]
    pub decode: Option<DecodeCheck>,
}

impl EncoderTestResult {
    pub fn new(encoder: &str, init_flags: &[String], passed: bool, message: &str) -> Self {
        Self {
            encoder: encoder.to_string(),
            init_flags: init_flags.to_vec(),
            passed,
            message: message.to_string(),
            decode: None,
        }
    }

    /// Why the encoder cannot be selected: the encode check message, or the
    /// decode check message when only that failed.
    pub fn failure(&self) -> Option<&str> {
        if !self.passed {
            return Some(self.message.as_str());
        }
        self.decode
            .as_ref()
            .filter(|d| !d.passed)
            .map(|d| d.message.as_str())
    }

    /// The encoder can be selected for jobs. A hardware entry needs both its
    /// encode and decode checks to pass.
    pub fn usable(&self) -> bool {
        self.failure().is_none()
    }

    /// Hardware decode may be combined with this encoder.
    pub fn decode_ok(&self) -> bool {
        self.decode.as_ref().is_some_and(|d| d.passed)
    }

    pub fn key(&self) -> String {
        cache_key(&self.encoder, &self.init_flags)
    }
}

/// Cache key: encoder name plus its sorted initialization flags.
pub fn cache_key(encoder: &str, init_flags: &[String]) -> String {
    let mut flags = init_flags.to_vec();
    flags.sort();
    if flags.is_empty() {
        encoder.to_string()
    } else {
        format!("{}:{}", encoder, flags.join(":"))
    }
}

/// Validation results keyed by [`cache_key`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationCache {
    pub saved_at: Option<DateTime<Utc>>,
    pub results: BTreeMap<String, EncoderTestResult>,
}

impl ValidationCache {
    pub fn insert(&mut self, result: EncoderTestResult) {
        self.results.insert(result.key(), result);
    }

    pub fn get(&self, key: &str) -> Option<&EncoderTestResult> {
        self.results.get(key)
    }

    pub fn for_encoder(&self, encoder: Encoder, profile: &HardwareProfile) -> Option<&EncoderTestResult> {
        self.get(&cache_key(encoder.ffmpeg_name(), &encoder.init_flags(profile)))
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn passed(&self) -> usize {
        self.results.values().filter(|r| r.usable()).count()
    }

    /// Default on-disk location under the user cache directory
    pub fn cache_path() -> Result<PathBuf> {
        Ok(dirs::cache_dir()
            .context("Could not determine cache directory")?
            .join("sizepress")
            .join("encoder-validation.json"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory: {}", parent.display()))?;
        }
        let mut stamped = self.clone();
        stamped.saved_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(&stamped).context("Failed to serialize validation cache")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write validation cache: {}", path.display()))?;
        Ok(())
    }

    /// Load a persisted cache if it is younger than `ttl_hours`. A stale or
    /// unreadable file yields `None`; persisted results are a hint only.
    pub fn load_fresh(path: &Path, ttl_hours: u64) -> Option<Self> {
        let contents = fs::read_to_string(path).ok()?;
        let cache: Self = match serde_json::from_str(&contents) {
            Ok(cache) => cache,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable validation cache");
                return None;
            }
        };
        let saved_at = cache.saved_at?;
        let ttl = ChronoDuration::hours(ttl_hours.min(MAX_TTL_HOURS) as i64);
        if Utc::now() - saved_at > ttl {
            debug!(path = %path.display(), "validation cache is stale");
            return None;
        }
        Some(cache)
    }
}

const MAX_TTL_HOURS: u64 = 24 * 365 * 10;

static VALIDATION: OnceLock<ValidationCache> = OnceLock::new();

/// Install the process-wide validation results. Only the first call wins.
pub fn init_validation(cache: ValidationCache) -> &'static ValidationCache {
    VALIDATION.get_or_init(|| cache)
}

/// Validation results for this process, if validation has run.
pub fn validation_cache() -> Option<&'static ValidationCache> {
    VALIDATION.get()
}

#[derive(Debug, Clone)]
pub struct ValidateOptions {
    pub ffmpeg: String,
    pub timeout: Duration,
    pub scratch_dir: PathBuf,
}

/// Candidates: the profile's hardware encoders plus the software fallbacks.
pub fn candidates(profile: &HardwareProfile) -> Vec<Encoder> {
    let mut list = profile.hardware_encoders();
    list.extend(CodecFamily::ALL.map(|c| c.software_encoder()));
    list
}

/// Validate every candidate encoder for `profile`. Never fails: a probe that
/// cannot run is recorded as a failed result.
pub fn validate_with(
    profile: &HardwareProfile,
    runner: &dyn CommandRunner,
    opts: &ValidateOptions,
) -> ValidationCache {
    let mut cache = ValidationCache::default();

    for encoder in candidates(profile) {
        let init_flags = encoder.init_flags(profile);
        let (passed, message) = test_encode(encoder, &init_flags, runner, opts);
        let mut result = EncoderTestResult::new(encoder.ffmpeg_name(), &init_flags, passed, &message);

        // Decode is checked on its own so each failure is reported separately
        if encoder.is_hardware() && profile.hw_type != HardwareType::Cpu {
            result.decode = Some(test_decode(encoder, profile, runner, opts));
        }

        match result.failure() {
            None => info!(encoder = %encoder, "{}", message),
            Some(reason) => warn!(encoder = %encoder, "{}", reason),
        }
        cache.insert(result);
    }

    info!(
        passed = cache.passed(),
        total = cache.results.len(),
        "encoder validation finished"
    );
    cache
}

fn encode_args(encoder: Encoder, init_flags: &[String]) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into()];
    args.extend(init_flags.iter().cloned());
    args.extend(
        ["-f", "lavfi", "-i", "color=black:s=256x256:d=0.1", "-c:v", encoder.ffmpeg_name()]
            .map(String::from),
    );
    args.extend(encoder.video_flags());
    args.extend(["-frames:v", "3", "-f", "null", "-"].map(String::from));
    args
}

fn test_encode(
    encoder: Encoder,
    init_flags: &[String],
    runner: &dyn CommandRunner,
    opts: &ValidateOptions,
) -> (bool, String) {
    match runner.run(&opts.ffmpeg, &encode_args(encoder, init_flags), opts.timeout) {
        Ok(output) => classify_encode(encoder, &output),
        Err(EngineError::Timeout(_, secs)) => (false, format!("Encode timeout (>{}s)", secs)),
        Err(e) => (false, format!("ffmpeg not runnable: {}", e)),
    }
}

/// Classify an encode probe. Sandboxes that deny a syscall to a software
/// encoder count as a pass since the encoder itself is present.
pub fn classify_encode(encoder: Encoder, output: &ProbeOutput) -> (bool, String) {
    if output.success {
        return (true, "OK".to_string());
    }
    let err = output.stderr.to_lowercase();

    if !encoder.is_hardware()
        && (err.contains("operation not permitted") || err.contains("permission denied"))
    {
        return (true, "OK (sandbox permission bypass)".to_string());
    }

    let message = if err.contains("unknown encoder") {
        "Encoder not compiled into ffmpeg"
    } else if err.contains("no nvenc capable devices found") {
        "No NVENC capable device"
    } else if err.contains("driver does not support") {
        "Driver too old for this encoder"
    } else if err.contains("no device found") || err.contains("no va display found") {
        "No hardware device found"
    } else if err.contains("cannot load") && err.contains(".so") {
        "Missing driver library"
    } else if err.contains("could not open") || (err.contains("failed to") && err.contains("encoder")) {
        "Encoder failed to initialize"
    } else {
        return (
            false,
            format!("Encode failed (code {})", output.code.unwrap_or(-1)),
        );
    };
    (false, message.to_string())
}

/// Decode flags for the validator: explicit hardware decoders where the vendor
/// has them, so a pass means the decode path itself works.
fn decode_check_flags(encoder: Encoder, profile: &HardwareProfile) -> Vec<String> {
    let codec = encoder.codec().as_str();
    match profile.hw_type {
        HardwareType::Nvidia => vec![
            "-hwaccel".into(),
            "cuda".into(),
            "-c:v".into(),
            format!("{}_cuvid", codec),
        ],
        HardwareType::Intel if encoder.family() == EncoderFamily::Qsv => vec![
            "-hwaccel".into(),
            "qsv".into(),
            "-c:v".into(),
            format!("{}_qsv", codec),
        ],
        _ => {
            let device = profile
                .device
                .clone()
                .unwrap_or_else(|| crate::engine::core::DEFAULT_RENDER_NODE.to_string());
            vec![
                "-hwaccel".into(),
                "vaapi".into(),
                "-hwaccel_device".into(),
                device,
                "-hwaccel_output_format".into(),
                "vaapi".into(),
            ]
        }
    }
}

fn test_decode(
    encoder: Encoder,
    profile: &HardwareProfile,
    runner: &dyn CommandRunner,
    opts: &ValidateOptions,
) -> DecodeCheck {
    let codec = encoder.codec();
    let sample = opts.scratch_dir.join(format!("decode_sample_{}.mkv", codec));

    if let Err(e) = fs::create_dir_all(&opts.scratch_dir) {
        return DecodeCheck {
            passed: false,
            message: format!("Scratch directory unavailable: {}", e),
        };
    }

    // Sample clip produced with the software encoder of the same codec
    let software = codec.software_encoder();
    let mut make: Vec<String> = ["-hide_banner", "-y", "-f", "lavfi", "-i", "color=black:s=256x256:d=0.1", "-c:v"]
        .map(String::from)
        .to_vec();
    make.push(software.ffmpeg_name().to_string());
    make.extend(software.video_flags());
    make.extend(software.family().preset_args("p1"));
    make.extend(["-frames:v".to_string(), "3".to_string()]);
    make.push(sample.to_string_lossy().to_string());

    match runner.run(&opts.ffmpeg, &make, opts.timeout) {
        Ok(out) if out.success => {}
        Ok(out) => {
            return DecodeCheck {
                passed: false,
                message: format!("Could not create {} sample (code {})", codec, out.code.unwrap_or(-1)),
            };
        }
        Err(e) => {
            return DecodeCheck {
                passed: false,
                message: format!("Could not create {} sample: {}", codec, e),
            };
        }
    }

    let mut args: Vec<String> = vec!["-hide_banner".into()];
    args.extend(decode_check_flags(encoder, profile));
    args.extend(["-i".to_string(), sample.to_string_lossy().to_string()]);
    args.extend(["-f", "null", "-"].map(String::from));

    let check = match runner.run(&opts.ffmpeg, &args, opts.timeout) {
        Ok(output) => classify_decode(&output),
        Err(EngineError::Timeout(_, secs)) => DecodeCheck {
            passed: false,
            message: format!("Decode timeout (>{}s)", secs),
        },
        Err(e) => DecodeCheck {
            passed: false,
            message: format!("ffmpeg not runnable: {}", e),
        },
    };
    let _ = fs::remove_file(&sample);
    check
}

pub fn classify_decode(output: &ProbeOutput) -> DecodeCheck {
    if output.success {
        return DecodeCheck {
            passed: true,
            message: "OK".to_string(),
        };
    }
    let err = output.stderr.to_lowercase();
    let message = if err.contains("no device found") || err.contains("cannot load") {
        "Hardware decode failed".to_string()
    } else if err.contains("not supported") || err.contains("invalid") {
        "Codec not supported by hardware decoder".to_string()
    } else {
        format!("Decode failed (code {})", output.code.unwrap_or(-1))
    };
    DecodeCheck {
        passed: false,
        message,
    }
}
