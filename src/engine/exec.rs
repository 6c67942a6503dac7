//! Bounded-time subprocess execution for capability and validation probes.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::error::{EngineError, EngineResult};
use super::hardware::apply_gpu_env;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Captured result of a finished probe command.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProbeOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: &str) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

/// Runs external tools. Probes go through this seam so detection and
/// validation can be exercised without real hardware.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> EngineResult<ProbeOutput>;
}

/// Runs commands on the host with the GPU environment applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> EngineResult<ProbeOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        apply_gpu_env(&mut cmd);
        run_with_timeout(cmd, timeout)
    }
}

/// Run a command to completion, killing it if it exceeds `timeout`.
///
/// Both pipes are drained on their own threads so a chatty child can never
/// block on a full pipe while we poll for exit.
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> EngineResult<ProbeOutput> {
    let program = cmd.get_program().to_string_lossy().to_string();
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
        program: program.clone(),
        source,
    })?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let stdout_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(out) = stdout.as_mut() {
            let _ = out.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(err) = stderr.as_mut() {
            let _ = err.read_to_end(&mut buf);
        }
        buf
    });

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = stdout_handle.join().unwrap_or_default();
                let stderr = stderr_handle.join().unwrap_or_default();
                return Ok(ProbeOutput {
                    success: status.success(),
                    code: status.code(),
                    stdout: String::from_utf8_lossy(&stdout).to_string(),
                    stderr: String::from_utf8_lossy(&stderr).to_string(),
                });
            }
            Ok(None) if started.elapsed() >= timeout => {
                // Grandchildren may still hold the pipes; the reader threads are
                // left to finish on their own rather than joined here.
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::Timeout(program, timeout.as_secs()));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(EngineError::Spawn { program, source });
            }
        }
    }
}
