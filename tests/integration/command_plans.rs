// Planning a job end to end (probe, size, resolve, build) without running ffmpeg

use crate::common::{FFMPEG_OK, FakeTools};
use sizepress::engine::validate::{DecodeCheck, EncoderTestResult};
use sizepress::engine::{
    Capabilities, CodecFamily, Container, DecodeMethod, Encoder, HardwareProfile, HardwareType,
    Orchestrator, TranscodeRequest, TrimWindow, ValidationCache,
};
use std::sync::Arc;

fn amd_profile() -> HardwareProfile {
    let mut profile = HardwareProfile::cpu();
    profile.hw_type = HardwareType::Amd;
    profile.decode_method = DecodeMethod::Vaapi;
    profile.device = Some("/dev/dri/renderD128".to_string());
    profile
        .available_encoders
        .insert(CodecFamily::Hevc, "hevc_vaapi".to_string());
    profile
}

/// `decode`: outcome of the decode check, `None` if it never ran
fn validated(profile: &HardwareProfile, decode: Option<bool>) -> ValidationCache {
    let mut cache = ValidationCache::default();
    let encoder = Encoder::HevcVaapi;
    let mut result = EncoderTestResult::new(
        encoder.ffmpeg_name(),
        &encoder.init_flags(profile),
        true,
        "OK",
    );
    result.decode = decode.map(|passed| DecodeCheck {
        passed,
        message: if passed { "OK" } else { "Hardware decode failed" }.to_string(),
    });
    cache.insert(result);
    cache
}

fn orchestrator(tools: &FakeTools, caps: Capabilities) -> Orchestrator {
    Orchestrator::new(Arc::new(caps), tools.settings())
}

fn position(args: &[String], flag: &str) -> usize {
    args.iter()
        .position(|a| a == flag)
        .unwrap_or_else(|| panic!("missing {} in {:?}", flag, args))
}

#[test]
fn test_default_output_name_and_budget() {
    let tools = FakeTools::new(FFMPEG_OK);
    let orch = orchestrator(&tools, Capabilities::new(HardwareProfile::cpu(), None));
    let mut req = TranscodeRequest::new(&tools.input, 8.0);
    req.video_codec = "libx264".to_string();

    let prepared = orch.prepare(&req).unwrap();
    assert_eq!(prepared.output_path, tools.dir.path().join("clip_8MB.mp4"));
    assert_eq!(prepared.duration_s, 10.0);
    // 8 MB over 10 s with 128k audio
    assert!((prepared.bitrate.total_kbps - 6553.6).abs() < 1e-6);
    assert!((prepared.bitrate.video_kbps - 6425.6).abs() < 1e-6);
    let args = &prepared.command.args;
    assert_eq!(args[position(args, "-b:v") + 1], "6426k");
    assert_eq!(prepared.media.video_codec.as_deref(), Some("h264"));
    assert!(prepared.plan.fallback.is_none());
}

#[test]
fn test_trim_window_sizes_against_clip_length() {
    let tools = FakeTools::new(FFMPEG_OK);
    let orch = orchestrator(&tools, Capabilities::new(HardwareProfile::cpu(), None));
    let mut req = TranscodeRequest::new(&tools.input, 8.0);
    req.video_codec = "libx265".to_string();
    req.container = Container::Mkv;
    req.trim = TrimWindow::new(Some("2"), Some("7"));

    let prepared = orch.prepare(&req).unwrap();
    assert_eq!(prepared.duration_s, 5.0);
    let args = &prepared.command.args;
    assert_eq!(args[position(args, "-ss") + 1], "2");
    assert_eq!(args[position(args, "-t") + 1], "5");
    assert!(position(args, "-ss") < position(args, "-i"));
    assert!(prepared.output_path.to_string_lossy().ends_with("clip_8MB.mkv"));
    // libopus is fine in mkv
    assert_eq!(args[position(args, "-c:a") + 1], "libopus");
}

#[test]
fn test_qsv_request_on_amd_falls_back_with_notice() {
    let tools = FakeTools::new(FFMPEG_OK);
    let profile = amd_profile();
    let orch = orchestrator(&tools, Capabilities::new(profile, None));
    let mut req = TranscodeRequest::new(&tools.input, 8.0);
    req.video_codec = "hevc_qsv".to_string();

    let prepared = orch.prepare(&req).unwrap();
    assert_eq!(prepared.plan.encoder, Encoder::Libx265);
    assert!(prepared.plan.init_flags.is_empty());
    assert!(
        prepared
            .notices
            .iter()
            .any(|n| n.contains("'hevc_qsv' unavailable, using 'libx265'"))
    );
    assert!(!prepared.command.args.iter().any(|a| a.contains("qsv")));
}

#[test]
fn test_forced_hw_decode_when_validated() {
    let tools = FakeTools::new(FFMPEG_OK);
    let profile = amd_profile();
    let cache = validated(&profile, Some(true));
    let orch = orchestrator(&tools, Capabilities::new(profile, Some(cache)));
    let mut req = TranscodeRequest::new(&tools.input, 8.0);
    req.video_codec = "hevc_vaapi".to_string();
    req.force_hw_decode = true;
    req.max_height = Some(720);

    let prepared = orch.prepare(&req).unwrap();
    assert_eq!(prepared.plan.encoder, Encoder::HevcVaapi);
    let args = &prepared.command.args;
    assert_eq!(args[position(args, "-hwaccel") + 1], "vaapi");
    assert!(position(args, "-vaapi_device") < position(args, "-hwaccel"));
    assert!(position(args, "-hwaccel_device") < position(args, "-i"));
    assert_eq!(
        args[position(args, "-vf") + 1],
        "scale=-2:'min(ih,720)',format=nv12,hwupload"
    );
    assert_eq!(args[position(args, "-compression_level") + 1], "2");
}

#[test]
fn test_failed_decode_check_rules_out_hardware_encoder() {
    let tools = FakeTools::new(FFMPEG_OK);
    let profile = amd_profile();
    let cache = validated(&profile, Some(false));
    let orch = orchestrator(&tools, Capabilities::new(profile, Some(cache)));
    let mut req = TranscodeRequest::new(&tools.input, 8.0);
    req.video_codec = "hevc_vaapi".to_string();
    req.force_hw_decode = true;

    let prepared = orch.prepare(&req).unwrap();
    assert_eq!(prepared.plan.encoder, Encoder::Libx265);
    assert!(
        prepared
            .notices
            .iter()
            .any(|n| n.contains("failed validation: Hardware decode failed"))
    );
    let args = &prepared.command.args;
    assert!(!args.contains(&"-hwaccel".to_string()));
    assert!(!args.contains(&"-vaapi_device".to_string()));
}

#[test]
fn test_forced_hw_decode_skipped_when_never_checked() {
    let tools = FakeTools::new(FFMPEG_OK);
    let profile = amd_profile();
    let cache = validated(&profile, None);
    let orch = orchestrator(&tools, Capabilities::new(profile, Some(cache)));
    let mut req = TranscodeRequest::new(&tools.input, 8.0);
    req.video_codec = "hevc_vaapi".to_string();
    req.force_hw_decode = true;

    let prepared = orch.prepare(&req).unwrap();
    assert_eq!(prepared.plan.encoder, Encoder::HevcVaapi);
    assert!(!prepared.command.args.contains(&"-hwaccel".to_string()));
    assert!(
        prepared
            .notices
            .iter()
            .any(|n| n.starts_with("Hardware decode not validated"))
    );
}

#[test]
fn test_tiny_budget_warns_but_plans() {
    let tools = FakeTools::new(FFMPEG_OK);
    let orch = orchestrator(&tools, Capabilities::new(HardwareProfile::cpu(), None));
    let mut req = TranscodeRequest::new(&tools.input, 0.2);
    req.video_codec = "libx264".to_string();

    let prepared = orch.prepare(&req).unwrap();
    assert!(prepared.bitrate.low_quality_warning);
    assert!((prepared.bitrate.video_kbps - 35.84).abs() < 1e-6);
    assert!(prepared.notices.iter().any(|n| n.contains("very low")));
}
