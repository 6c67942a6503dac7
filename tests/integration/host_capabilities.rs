// Detection, validation and encoder resolution chained together on a scripted host

use sizepress::engine::error::{EngineError, EngineResult};
use sizepress::engine::exec::{CommandRunner, ProbeOutput};
use sizepress::engine::hardware::{DetectOptions, detect_with};
use sizepress::engine::validate::{ValidateOptions, validate_with};
use sizepress::engine::{
    CodecFamily, DecodeMethod, Encoder, HardwareProfile, HardwareType, ValidationCache, resolve,
    usable_encoders,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

const AMD_VAINFO: &str = "vainfo: VA-API version: 1.20 (libva 2.20.0)\n\
vainfo: Driver version: Mesa Gallium driver 24.0.5 for AMD Radeon RX 6600 (radeonsi, navi23)\n";

// A build that ships QSV and VAAPI encoders side by side
const LISTING: &str = "Encoders:\n\
 V....D h264_qsv             H.264 (Intel Quick Sync Video acceleration)\n\
 V....D hevc_qsv             HEVC (Intel Quick Sync Video acceleration)\n\
 V....D h264_vaapi           H.264/AVC (VAAPI)\n\
 V....D hevc_vaapi           H.265/HEVC (VAAPI)\n\
 V....D av1_vaapi            AV1 (VAAPI)\n\
 V....D libx264              libx264 H.264 / AVC\n";

/// An AMD box without NVIDIA tools whose driver cannot encode AV1
struct AmdHost {
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl AmdHost {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl CommandRunner for AmdHost {
    fn run(&self, program: &str, args: &[String], _timeout: Duration) -> EngineResult<ProbeOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        let has = |flag: &str| args.iter().any(|a| a == flag);
        match program {
            "vainfo" => Ok(ProbeOutput::ok(AMD_VAINFO)),
            "ffmpeg" if has("-encoders") => Ok(ProbeOutput::ok(LISTING)),
            "ffmpeg" if has("av1_vaapi") => Ok(ProbeOutput::failed(
                1,
                "[av1_vaapi @ 0x55] Driver does not support some wanted packed headers",
            )),
            "ffmpeg" => Ok(ProbeOutput::ok("")),
            _ => Err(EngineError::Spawn {
                program: program.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            }),
        }
    }
}

fn detect(host: &AmdHost) -> HardwareProfile {
    detect_with(
        host,
        &[PathBuf::from("/dev/dri/renderD128")],
        &DetectOptions::default(),
    )
}

fn validate(host: &AmdHost, profile: &HardwareProfile) -> ValidationCache {
    let scratch = tempfile::tempdir().unwrap();
    validate_with(
        profile,
        host,
        &ValidateOptions {
            ffmpeg: "ffmpeg".to_string(),
            timeout: Duration::from_secs(5),
            scratch_dir: scratch.path().to_path_buf(),
        },
    )
}

#[test]
fn test_amd_host_never_selects_qsv() {
    let host = AmdHost::new();
    let profile = detect(&host);
    assert_eq!(profile.hw_type, HardwareType::Amd);
    assert_eq!(profile.decode_method, DecodeMethod::Vaapi);
    assert_eq!(profile.device.as_deref(), Some("/dev/dri/renderD128"));
    for name in profile.available_encoders.values() {
        assert!(!name.contains("qsv"), "{:?}", profile.available_encoders);
    }

    let cache = validate(&host, &profile);
    for requested in ["h264_qsv", "hevc_qsv", "av1_qsv", "hevc", "h264"] {
        let plan = resolve(requested, &profile, Some(&cache));
        assert!(
            !plan.encoder.ffmpeg_name().contains("qsv"),
            "{} resolved to {}",
            requested,
            plan.encoder
        );
    }
    assert_eq!(resolve("hevc", &profile, Some(&cache)).encoder, Encoder::HevcVaapi);
}

#[test]
fn test_failed_validation_falls_back_to_software() {
    let host = AmdHost::new();
    let profile = detect(&host);
    let cache = validate(&host, &profile);

    let av1 = cache.for_encoder(Encoder::Av1Vaapi, &profile).unwrap();
    assert!(!av1.passed);
    assert_eq!(av1.message, "Driver too old for this encoder");
    // Decoding AV1 works on this box; the encoder alone is the problem
    assert!(av1.decode_ok());
    assert_eq!(av1.failure(), Some("Driver too old for this encoder"));

    let hevc = cache.for_encoder(Encoder::HevcVaapi, &profile).unwrap();
    assert!(hevc.usable());
    assert!(hevc.decode_ok());

    let plan = resolve("av1_vaapi", &profile, Some(&cache));
    assert_eq!(plan.encoder, Encoder::LibaomAv1);
    assert!(plan.init_flags.is_empty());
    assert!(plan.fallback.unwrap().contains("failed validation"));

    let usable = usable_encoders(&profile, Some(&cache));
    assert_eq!(
        usable[&CodecFamily::Av1],
        vec![Encoder::LibaomAv1, Encoder::LibsvtAv1]
    );
    assert_eq!(usable[&CodecFamily::Hevc][0], Encoder::HevcVaapi);
}

#[test]
fn test_encode_probes_use_init_flags_without_decode_flags() {
    let host = AmdHost::new();
    let profile = detect(&host);
    validate(&host, &profile);

    let calls = host.calls.lock().unwrap();
    let encode = calls
        .iter()
        .find(|(_, args)| args.iter().any(|a| a == "hevc_vaapi") && args.iter().any(|a| a == "lavfi"))
        .expect("hevc_vaapi encode probe");
    assert!(encode.1.contains(&"-vaapi_device".to_string()));
    assert!(!encode.1.contains(&"-hwaccel".to_string()));
}

#[test]
fn test_persisted_cache_is_a_hint_with_ttl() {
    let host = AmdHost::new();
    let profile = detect(&host);
    let cache = validate(&host, &profile);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache").join("encoder-validation.json");
    cache.save(&path).unwrap();

    let loaded = ValidationCache::load_fresh(&path, 720).unwrap();
    assert!(loaded.saved_at.is_some());
    assert_eq!(loaded.results, cache.results);

    // Stale file
    let mut old = loaded.clone();
    old.saved_at = Some("2020-01-01T00:00:00Z".parse().unwrap());
    fs::write(&path, serde_json::to_string(&old).unwrap()).unwrap();
    assert!(ValidationCache::load_fresh(&path, 720).is_none());

    // Garbage is ignored rather than fatal
    fs::write(&path, "{ not json").unwrap();
    assert!(ValidationCache::load_fresh(&path, 720).is_none());
}

#[test]
fn test_cpu_profile_json_shape() {
    insta::assert_json_snapshot!(HardwareProfile::cpu(), @r#"
    {
      "type": "cpu",
      "decode_method": "none",
      "device": null,
      "model": null,
      "available_encoders": {
        "h264": "libx264",
        "hevc": "libx265",
        "av1": "libaom-av1"
      }
    }
    "#);
}
