#![allow(dead_code)]

use sizepress::engine::{
    Capabilities, HardwareProfile, Orchestrator, OrchestratorSettings, ProgressEvent,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// ffprobe stand-in reporting a 10 second h264 + aac file
pub const FAKE_FFPROBE: &str = r#"#!/bin/sh
cat <<'JSON'
{"format":{"duration":"10.000000"},"streams":[
 {"index":0,"codec_type":"video","codec_name":"h264","bit_rate":"4000000"},
 {"index":1,"codec_type":"audio","codec_name":"aac","bit_rate":"128000"}]}
JSON
"#;

/// Emits progress on stdout, chatter on stderr, then writes the output file
pub const FFMPEG_OK: &str = r#"#!/bin/sh
for last; do :; done
echo "Input #0, mov,mp4,m4a,3gp,3g2,mj2, from 'in.mp4':" >&2
echo "Stream mapping: h264 -> libx264" >&2
echo "out_time_us=2500000"
echo "progress=continue"
echo "out_time_us=5000000"
echo "progress=continue"
echo "out_time_us=10000000"
echo "progress=end"
printf 'fake encoded payload' > "$last"
exit 0
"#;

/// Latin-1 metadata on both pipes and enough stderr to fill a pipe buffer,
/// then a normal finish
pub const FFMPEG_LATIN1: &str = r#"#!/bin/sh
for last; do :; done
printf '    title           : caf\351\n' >&2
printf 'encoder=caf\351\n'
i=1
while [ $i -le 3000 ]; do
  echo "frame-$i padding padding padding padding padding" >&2
  i=$((i + 1))
done
echo "out_time_us=5000000"
echo "progress=continue"
echo "out_time_us=10000000"
echo "progress=end"
printf 'caf\351 done\n' >&2
printf 'fake encoded payload' > "$last"
exit 0
"#;

/// Prints thirty numbered diagnostics and fails
pub const FFMPEG_FAIL: &str = r#"#!/bin/sh
i=1
while [ $i -le 30 ]; do
  echo "err-$i" >&2
  i=$((i + 1))
done
exit 1
"#;

/// Runs until terminated
pub const FFMPEG_SLOW: &str = r#"#!/bin/sh
echo "out_time_us=1000000"
echo "progress=continue"
sleep 30 >/dev/null 2>&1 &
pid=$!
trap 'kill $pid 2>/dev/null; exit 255' TERM
wait $pid
"#;

/// A scratch directory holding executable tool scripts and an input file.
pub struct FakeTools {
    pub dir: TempDir,
    pub ffprobe: PathBuf,
    pub ffmpeg: PathBuf,
    pub input: PathBuf,
}

impl FakeTools {
    pub fn new(ffmpeg_script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ffprobe = write_script(dir.path(), "ffprobe", FAKE_FFPROBE);
        let ffmpeg = write_script(dir.path(), "ffmpeg", ffmpeg_script);
        let input = dir.path().join("clip.mp4");
        fs::write(&input, b"not really a video").unwrap();
        Self {
            dir,
            ffprobe,
            ffmpeg,
            input,
        }
    }

    pub fn settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            ffmpeg: self.ffmpeg.to_string_lossy().to_string(),
            ffprobe: self.ffprobe.to_string_lossy().to_string(),
            cancel_grace: Duration::from_secs(2),
            ..OrchestratorSettings::default()
        }
    }

    /// Orchestrator on a CPU-only host without validation results
    pub fn orchestrator(&self, settings: OrchestratorSettings) -> Orchestrator {
        let caps = Arc::new(Capabilities::new(HardwareProfile::cpu(), None));
        Orchestrator::new(caps, settings)
    }

    pub fn output(&self, name: &str) -> PathBuf {
        self.dir.path().join("out").join(name)
    }
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Drain a job's stream, panicking if it does not end within `limit`
pub fn collect_events(rx: Receiver<ProgressEvent>, limit: Duration) -> Vec<ProgressEvent> {
    let deadline = Instant::now() + limit;
    let mut events = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(event) => events.push(event),
            Err(RecvTimeoutError::Disconnected) => return events,
            Err(RecvTimeoutError::Timeout) => {
                panic!("event stream did not end in time; got {:?}", events)
            }
        }
    }
}

/// Wait for the first event matching `pred`
pub fn wait_for(
    rx: &Receiver<ProgressEvent>,
    limit: Duration,
    pred: impl Fn(&ProgressEvent) -> bool,
) -> ProgressEvent {
    let deadline = Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = rx
            .recv_timeout(remaining)
            .expect("expected event never arrived");
        if pred(&event) {
            return event;
        }
    }
}

pub fn log_messages(events: &[ProgressEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Log { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}
