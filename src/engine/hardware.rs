//! GPU vendor detection and the environment handed to ffmpeg subprocesses

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

use crate::engine::core::{CodecFamily, Encoder};
use crate::engine::exec::{CommandRunner, HostRunner};

/// Detected accelerator family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareType {
    Nvidia,
    Intel,
    Amd,
    Cpu,
}

impl HardwareType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nvidia => "nvidia",
            Self::Intel => "intel",
            Self::Amd => "amd",
            Self::Cpu => "cpu",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Nvidia => "NVIDIA",
            Self::Intel => "Intel",
            Self::Amd => "AMD",
            Self::Cpu => "CPU",
        }
    }
}

/// Hardware decode path that pairs with the detected accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMethod {
    Cuda,
    Qsv,
    Vaapi,
    None,
}

impl DecodeMethod {
    /// Decode flags for a real job. VAAPI frames are left in system memory so
    /// the encoder's own upload filter chain still applies.
    pub fn job_flags(&self, device: Option<&str>) -> Vec<String> {
        let flags: Vec<&str> = match self {
            Self::Cuda => vec!["-hwaccel", "cuda"],
            Self::Qsv => vec!["-hwaccel", "qsv"],
            Self::Vaapi => vec![
                "-hwaccel",
                "vaapi",
                "-hwaccel_device",
                device.unwrap_or(crate::engine::core::DEFAULT_RENDER_NODE),
            ],
            Self::None => vec![],
        };
        flags.into_iter().map(String::from).collect()
    }
}

/// What the machine can do, as seen once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    #[serde(rename = "type")]
    pub hw_type: HardwareType,
    pub decode_method: DecodeMethod,
    /// Render node for VAAPI/QSV device setup
    pub device: Option<String>,
    /// GPU model string when the vendor tool reports one
    pub model: Option<String>,
    /// Encoder per family. Hardware entries only for the resolved vendor,
    /// software encoders fill the rest.
    pub available_encoders: BTreeMap<CodecFamily, String>,
}

impl HardwareProfile {
    /// Software-only profile
    pub fn cpu() -> Self {
        let available_encoders = CodecFamily::ALL
            .into_iter()
            .map(|c| (c, c.software_encoder().ffmpeg_name().to_string()))
            .collect();
        Self {
            hw_type: HardwareType::Cpu,
            decode_method: DecodeMethod::None,
            device: None,
            model: None,
            available_encoders,
        }
    }

    /// Encoder the profile lists for a family, falling back to software.
    pub fn encoder_for(&self, codec: CodecFamily) -> Encoder {
        self.available_encoders
            .get(&codec)
            .and_then(|name| name.parse().ok())
            .unwrap_or_else(|| codec.software_encoder())
    }

    pub fn hardware_encoders(&self) -> Vec<Encoder> {
        CodecFamily::ALL
            .into_iter()
            .map(|c| self.encoder_for(c))
            .filter(Encoder::is_hardware)
            .collect()
    }

    pub fn summary(&self) -> String {
        match self.hw_type {
            HardwareType::Cpu => "No GPU detected, using CPU encoding".to_string(),
            hw => match &self.model {
                Some(model) => format!("{} acceleration detected ({})", hw.display_name(), model),
                None => format!("{} acceleration detected", hw.display_name()),
            },
        }
    }
}

/// Tool locations and probe budget for detection
#[derive(Debug, Clone)]
pub struct DetectOptions {
    pub ffmpeg: String,
    pub probe_timeout: Duration,
    pub listing_timeout: Duration,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            probe_timeout: Duration::from_secs(10),
            listing_timeout: Duration::from_secs(3),
        }
    }
}

static HARDWARE_PROFILE: OnceLock<HardwareProfile> = OnceLock::new();

/// Detect once per process; later calls return the memoized profile.
pub fn detect(opts: &DetectOptions) -> &'static HardwareProfile {
    HARDWARE_PROFILE.get_or_init(|| {
        let nodes = find_render_nodes(Path::new("/dev/dri"));
        let profile = detect_with(&HostRunner, &nodes, opts);
        info!(
            hw_type = profile.hw_type.as_str(),
            decode = ?profile.decode_method,
            device = profile.device.as_deref().unwrap_or("-"),
            "{}",
            profile.summary()
        );
        profile
    })
}

/// Detection against an arbitrary runner. Never fails; any probe that errors
/// or times out counts as absent.
///
/// Order: `nvidia-smi`, then render nodes with a vendor string from
/// `vainfo`/`lspci`, then CPU. The vendor string wins over encoder names, so
/// a build listing QSV encoders on an AMD box still resolves to AMD.
pub fn detect_with(
    runner: &dyn CommandRunner,
    render_nodes: &[PathBuf],
    opts: &DetectOptions,
) -> HardwareProfile {
    let listing = || encoder_listing(runner, opts);

    if let Some(model) = nvidia_model(runner, opts.probe_timeout) {
        debug!(model = %model, "nvidia-smi responded");
        return vendor_profile(
            HardwareType::Nvidia,
            DecodeMethod::Cuda,
            None,
            Some(model).filter(|m| !m.is_empty()),
            &listing(),
        );
    }

    let Some(node) = render_nodes.first() else {
        debug!("no render nodes, using CPU");
        return HardwareProfile::cpu();
    };
    let device = Some(node.to_string_lossy().to_string());

    let vendor = probe_text(runner, "vainfo", &[], opts.probe_timeout)
        .and_then(|text| vendor_from_vainfo(&text))
        .or_else(|| {
            probe_text(runner, "lspci", &[], opts.probe_timeout)
                .and_then(|text| vendor_from_lspci(&text))
        });

    match vendor {
        Some(HardwareType::Intel) => vendor_profile(
            HardwareType::Intel,
            DecodeMethod::Qsv,
            device,
            None,
            &listing(),
        ),
        Some(HardwareType::Amd) => vendor_profile(
            HardwareType::Amd,
            DecodeMethod::Vaapi,
            device,
            None,
            &listing(),
        ),
        _ => {
            debug!(node = %node.display(), "render node present but vendor unknown, using CPU");
            HardwareProfile::cpu()
        }
    }
}

fn vendor_profile(
    hw_type: HardwareType,
    decode_method: DecodeMethod,
    device: Option<String>,
    model: Option<String>,
    listed: &BTreeSet<String>,
) -> HardwareProfile {
    // Suffix preference per vendor; first listed wins.
    let suffixes: &[&str] = match hw_type {
        HardwareType::Nvidia => &["_nvenc"],
        HardwareType::Intel => &["_qsv", "_vaapi"],
        HardwareType::Amd => &["_vaapi", "_amf"],
        HardwareType::Cpu => &[],
    };

    let mut available_encoders = BTreeMap::new();
    for codec in CodecFamily::ALL {
        let hardware = suffixes
            .iter()
            .map(|suffix| format!("{}{}", codec.as_str(), suffix))
            .find(|name| listed.contains(name));
        let name =
            hardware.unwrap_or_else(|| codec.software_encoder().ffmpeg_name().to_string());
        available_encoders.insert(codec, name);
    }

    HardwareProfile {
        hw_type,
        decode_method,
        device,
        model,
        available_encoders,
    }
}

fn probe_text(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Option<String> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    match runner.run(program, &args, timeout) {
        Ok(out) if out.success => Some(format!("{}\n{}", out.stdout, out.stderr)),
        Ok(out) => {
            debug!(program, code = ?out.code, "probe exited unsuccessfully");
            None
        }
        Err(e) => {
            debug!(program, error = %e, "probe unavailable");
            None
        }
    }
}

fn nvidia_model(runner: &dyn CommandRunner, timeout: Duration) -> Option<String> {
    let text = probe_text(
        runner,
        "nvidia-smi",
        &["--query-gpu=name", "--format=csv,noheader"],
        timeout,
    )?;
    Some(text.lines().next().unwrap_or_default().trim().to_string())
}

fn encoder_listing(runner: &dyn CommandRunner, opts: &DetectOptions) -> BTreeSet<String> {
    probe_text(
        runner,
        &opts.ffmpeg,
        &["-hide_banner", "-encoders"],
        opts.listing_timeout,
    )
    .map(|text| parse_encoder_listing(&text))
    .unwrap_or_default()
}

/// Encoder names from `ffmpeg -encoders`. Accepts both the real tabular form
/// (` V....D h264_nvenc  NVIDIA ...`) and bare one-name-per-line output.
pub fn parse_encoder_listing(text: &str) -> BTreeSet<String> {
    let is_flags = |tok: &str| {
        tok.len() == 6 && tok.chars().all(|c| "VASFXBD.".contains(c)) && tok.contains('.')
    };

    text.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let first = parts.next()?;
            if is_flags(first) {
                parts.next().map(str::to_string)
            } else if parts.next().is_none() {
                Some(first.to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Vendor from the VA-API driver string
pub fn vendor_from_vainfo(text: &str) -> Option<HardwareType> {
    let lower = text.to_lowercase();
    if lower.contains("radeon") || lower.contains("amdgpu") {
        Some(HardwareType::Amd)
    } else if lower.contains("intel") || lower.contains("ihd") || lower.contains("i965") {
        Some(HardwareType::Intel)
    } else {
        None
    }
}

/// Vendor from the first display controller `lspci` reports
pub fn vendor_from_lspci(text: &str) -> Option<HardwareType> {
    text.lines()
        .map(str::to_lowercase)
        .filter(|l| l.contains("vga") || l.contains("display") || l.contains("3d"))
        .find_map(|l| {
            if l.contains("advanced micro devices") || l.contains("radeon") || l.contains("amd/ati") {
                Some(HardwareType::Amd)
            } else if l.contains("intel") {
                Some(HardwareType::Intel)
            } else {
                None
            }
        })
}

/// `renderD*` nodes under `dir`, sorted so renderD128 comes first.
pub fn find_render_nodes(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut nodes: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|n| n.starts_with("renderD"))
                .unwrap_or(false)
        })
        .map(|e| e.path())
        .collect();
    nodes.sort();
    nodes
}

const NVIDIA_LIB_DIRS: &[&str] = &["/usr/local/nvidia/lib64", "/usr/local/nvidia/lib"];
const EXTRA_LIB_DIRS: &[&str] = &[
    "/usr/local/cuda/targets/x86_64-linux/lib",
    "/usr/lib/wsl/lib",
    "/usr/lib/x86_64-linux-gnu",
];

/// Environment overrides that let GPU libraries resolve inside containers.
/// Existing values are kept; search paths are only appended to.
pub fn gpu_env_overrides(get: impl Fn(&str) -> Option<String>) -> Vec<(&'static str, String)> {
    let cuda_home = get("CUDA_HOME").unwrap_or_else(|| "/usr/local/cuda".to_string());

    let mut lib_dirs: Vec<String> = NVIDIA_LIB_DIRS.iter().map(|s| s.to_string()).collect();
    lib_dirs.push(format!("{}/lib64", cuda_home));
    lib_dirs.push(format!("{}/lib", cuda_home));
    lib_dirs.extend(EXTRA_LIB_DIRS.iter().map(|s| s.to_string()));

    let bin_dirs = vec![format!("{}/bin", cuda_home), "/usr/local/nvidia/bin".to_string()];

    vec![
        (
            "NVIDIA_VISIBLE_DEVICES",
            get("NVIDIA_VISIBLE_DEVICES").unwrap_or_else(|| "all".to_string()),
        ),
        (
            "NVIDIA_DRIVER_CAPABILITIES",
            get("NVIDIA_DRIVER_CAPABILITIES")
                .unwrap_or_else(|| "compute,video,utility".to_string()),
        ),
        ("CUDA_HOME", cuda_home),
        ("LD_LIBRARY_PATH", append_paths(get("LD_LIBRARY_PATH"), &lib_dirs)),
        ("PATH", append_paths(get("PATH"), &bin_dirs)),
    ]
}

fn append_paths(existing: Option<String>, extra: &[String]) -> String {
    let mut parts: Vec<String> = existing
        .unwrap_or_default()
        .split(':')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    for dir in extra {
        if !parts.contains(dir) {
            parts.push(dir.clone());
        }
    }
    parts.join(":")
}

/// Apply [`gpu_env_overrides`] for the current process environment.
pub fn apply_gpu_env(cmd: &mut Command) {
    for (key, value) in gpu_env_overrides(|k| std::env::var(k).ok()) {
        cmd.env(key, value);
    }
}
