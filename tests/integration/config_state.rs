// Config files driving real job settings

use crate::common::{FFMPEG_OK, FakeTools};
use sizepress::config::Config;
use sizepress::engine::{Capabilities, Container, HardwareProfile, JobStatus, Orchestrator};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

fn write_config(tools: &FakeTools, body: &str) -> Config {
    let path = tools.dir.path().join("config.toml");
    let text = format!(
        "[tools]\nffmpeg = {:?}\nffprobe = {:?}\n\n{}",
        tools.ffmpeg.to_string_lossy(),
        tools.ffprobe.to_string_lossy(),
        body
    );
    fs::write(&path, text).unwrap();
    Config::load_from(&path).unwrap()
}

#[test]
fn test_config_defaults_shape_the_job() {
    let tools = FakeTools::new(FFMPEG_OK);
    let out_dir = tools.dir.path().join("encoded");
    let config = write_config(
        &tools,
        &format!(
            "[defaults]\ntarget_size_mb = 4.5\nvideo_codec = \"h264\"\ncontainer = \"mkv\"\noutput_dir = {:?}\n\n[jobs]\ncancel_grace_secs = 1\n",
            out_dir.to_string_lossy()
        ),
    );
    assert_eq!(config.defaults.container, Container::Mkv);
    assert_eq!(config.orchestrator_settings().cancel_grace, Duration::from_secs(1));

    let caps = Arc::new(Capabilities::new(HardwareProfile::cpu(), None));
    let orch = Orchestrator::new(caps, config.orchestrator_settings());
    let id = orch.submit(config.request_for(&tools.input));
    let job = orch.wait(id).unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.last_error);
    let stats = job.stats.unwrap();
    assert_eq!(stats.encoder, "libx264");
    assert_eq!(stats.output_path, out_dir.join("clip_4.5MB.mkv"));
    assert!(stats.output_path.exists());
}

#[test]
fn test_saved_config_reloads_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sizepress").join("config.toml");

    let mut config = Config::default();
    config.log_level = "debug".to_string();
    config.jobs.max_workers = 4;
    config.cache.validation_cache = false;
    config.save_to(&path).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("log_level = \"debug\""));
    assert!(text.contains("[jobs]"));
    assert_eq!(Config::load_from(&path).unwrap(), config);
}
