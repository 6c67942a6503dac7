// Job orchestration: queueing, ffmpeg supervision and cancellation

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::core::{
    BitrateEstimate, CommandInputs, Encoder, EncoderPlan, Job, JobStats, JobStatus,
    ProgressParser, TranscodeCommand, TranscodeRequest, build_transcode_cmd, estimate, resolve,
};
use super::error::{EngineError, EngineResult};
use super::events::{ProgressEvent, ProgressHub};
use super::exec::{HostRunner, ProbeOutput};
use super::hardware::{self, DetectOptions, HardwareProfile};
use super::probe::{MediaInfo, probe_media};
use super::validate::{self, ValidateOptions, ValidationCache};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Hardware profile and validation results shared by every job
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub profile: HardwareProfile,
    /// `None` when validation was skipped
    pub validation: Option<ValidationCache>,
}

impl Capabilities {
    pub fn new(profile: HardwareProfile, validation: Option<ValidationCache>) -> Self {
        Self {
            profile,
            validation,
        }
    }

    /// Detect and (unless `validate` is `None`) validate this host. Both run at
    /// most once per process; later calls reuse the first results.
    pub fn probe_host(detect: &DetectOptions, validate: Option<&ValidateOptions>) -> Self {
        let profile = hardware::detect(detect).clone();
        let validation = validate.map(|opts| {
            validate::validation_cache()
                .cloned()
                .unwrap_or_else(|| {
                    let cache = validate::validate_with(&profile, &HostRunner, opts);
                    let _ = fs::remove_dir_all(&opts.scratch_dir);
                    validate::init_validation(cache).clone()
                })
        });
        Self::new(profile, validation)
    }

    fn decode_ok(&self, encoder: Encoder) -> bool {
        encoder.is_hardware()
            && self
                .validation
                .as_ref()
                .and_then(|v| v.for_encoder(encoder, &self.profile))
                .is_some_and(|r| r.decode_ok())
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub max_workers: usize,
    pub log_tail_lines: usize,
    pub history_len: usize,
    pub cancel_grace: Duration,
    pub output_dir: Option<PathBuf>,
    /// Finished jobs kept for status queries; older ones are dropped
    pub finished_retention: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            max_workers: 1,
            log_tail_lines: 20,
            history_len: 64,
            cancel_grace: Duration::from_secs(5),
            output_dir: None,
            finished_retention: 256,
        }
    }
}

/// Everything decided before ffmpeg is launched
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub media: MediaInfo,
    /// Seconds actually encoded, after trimming
    pub duration_s: f64,
    pub bitrate: BitrateEstimate,
    pub plan: EncoderPlan,
    pub output_path: PathBuf,
    pub command: TranscodeCommand,
    /// Warnings and decisions worth showing the user
    pub notices: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued and is now cancelled
    Cancelled,
    /// The running ffmpeg process has been asked to stop
    Requested,
    /// Nothing to do; the job had already finished
    AlreadyFinished(JobStatus),
}

struct JobHandle {
    job: Mutex<Job>,
    cancel: AtomicBool,
}

impl JobHandle {
    fn lock(&self) -> MutexGuard<'_, Job> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Dispatch {
    pending: VecDeque<Uuid>,
    active: usize,
}

struct Inner {
    caps: Arc<Capabilities>,
    settings: OrchestratorSettings,
    hub: ProgressHub,
    jobs: Mutex<HashMap<Uuid, Arc<JobHandle>>>,
    dispatch: Mutex<Dispatch>,
}

impl Inner {
    fn handle(&self, id: Uuid) -> Option<Arc<JobHandle>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn log(&self, job_id: Uuid, message: impl Into<String>) {
        self.hub.publish(ProgressEvent::log(job_id, message));
    }

    /// Drop the oldest finished jobs, and their event history, beyond
    /// `finished_retention`. Callers must not hold a job lock.
    fn prune_finished(&self) {
        let keep = self.settings.finished_retention;
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut finished: Vec<_> = jobs
            .iter()
            .filter_map(|(id, handle)| {
                let job = handle.lock();
                job.status.is_terminal().then_some((job.updated_at, *id))
            })
            .collect();
        if finished.len() <= keep {
            return;
        }
        finished.sort();
        for (_, id) in &finished[..finished.len() - keep] {
            jobs.remove(id);
            self.hub.remove(*id);
        }
        debug!(dropped = finished.len() - keep, "pruned finished jobs");
    }
}

/// Accepts transcode requests and runs them on worker threads, at most
/// `max_workers` at a time. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(caps: Arc<Capabilities>, settings: OrchestratorSettings) -> Self {
        let hub = ProgressHub::new(settings.history_len);
        Self {
            inner: Arc::new(Inner {
                caps,
                settings,
                hub,
                jobs: Mutex::new(HashMap::new()),
                dispatch: Mutex::new(Dispatch::default()),
            }),
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.inner.caps
    }

    /// Queue a request and return its job id straight away.
    pub fn submit(&self, request: TranscodeRequest) -> Uuid {
        let job = Job::new(request);
        let id = job.id;
        info!(job_id = %id, input = %job.request.input_path.display(), "job queued");

        let handle = Arc::new(JobHandle {
            job: Mutex::new(job),
            cancel: AtomicBool::new(false),
        });
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle);
        self.inner.hub.publish(ProgressEvent::status(id, JobStatus::Queued));

        self.inner
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .push_back(id);
        dispatch(&self.inner);
        id
    }

    /// Snapshot of a job
    pub fn status(&self, id: Uuid) -> Option<Job> {
        self.inner.handle(id).map(|h| h.lock().clone())
    }

    pub fn jobs(&self) -> Vec<Job> {
        let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<Job> = jobs.values().map(|h| h.lock().clone()).collect();
        list.sort_by_key(|j| j.created_at);
        list
    }

    /// Event stream for a job, starting with its recent history
    pub fn subscribe(&self, id: Uuid) -> EngineResult<Receiver<ProgressEvent>> {
        self.inner.handle(id).ok_or(EngineError::UnknownJob(id))?;
        Ok(self.inner.hub.subscribe(id))
    }

    /// Request cancellation. Queued jobs end immediately; running jobs get a
    /// termination signal and end `cancelled` once the process exits. A job
    /// that already finished is left untouched.
    pub fn cancel(&self, id: Uuid) -> EngineResult<CancelOutcome> {
        let handle = self.inner.handle(id).ok_or(EngineError::UnknownJob(id))?;
        let mut job = handle.lock();
        let status = job.status;

        match status {
            s if s.is_terminal() => Ok(CancelOutcome::AlreadyFinished(s)),
            JobStatus::Queued => {
                handle.cancel.store(true, Ordering::SeqCst);
                job.transition(JobStatus::Cancelled);
                self.inner
                    .hub
                    .publish(ProgressEvent::status(id, JobStatus::Cancelled));
                drop(job);
                info!(job_id = %id, "queued job cancelled");
                self.inner.prune_finished();
                Ok(CancelOutcome::Cancelled)
            }
            _ => {
                handle.cancel.store(true, Ordering::SeqCst);
                info!(job_id = %id, "cancellation requested");
                Ok(CancelOutcome::Requested)
            }
        }
    }

    /// Drop a finished job and its event history. Active jobs are refused.
    pub fn forget(&self, id: Uuid) -> EngineResult<Job> {
        let mut jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = jobs.get(&id).ok_or(EngineError::UnknownJob(id))?;
        let job = handle.lock().clone();
        if !job.status.is_terminal() {
            return Err(EngineError::JobActive(id, job.status));
        }
        jobs.remove(&id);
        self.inner.hub.remove(id);
        debug!(job_id = %id, "job forgotten");
        Ok(job)
    }

    /// Block until the job reaches a terminal state and return it.
    pub fn wait(&self, id: Uuid) -> EngineResult<Job> {
        // Hold the handle so the result survives pruning
        let handle = self.inner.handle(id).ok_or(EngineError::UnknownJob(id))?;
        for _ in self.inner.hub.subscribe(id).iter() {}
        let job = handle.lock().clone();
        Ok(job)
    }

    /// Resolve everything up to the ffmpeg command without running it.
    pub fn prepare(&self, request: &TranscodeRequest) -> EngineResult<PreparedJob> {
        prepare(&self.inner.caps, &self.inner.settings, request)
    }
}

fn prepare(
    caps: &Capabilities,
    settings: &OrchestratorSettings,
    request: &TranscodeRequest,
) -> EngineResult<PreparedJob> {
    if !request.target_size_mb.is_finite() || request.target_size_mb <= 0.0 {
        return Err(EngineError::InvalidRequest(format!(
            "target size must be positive, got {} MB",
            request.target_size_mb
        )));
    }

    let mut notices = Vec::new();
    let media = probe_media(&settings.ffprobe, &request.input_path)?;

    // Size against what will actually be encoded
    let duration_s = request.trim.effective_duration(media.duration_s);
    let bitrate = estimate(request.target_size_mb, duration_s, request.effective_audio_kbps())?;
    if bitrate.low_quality_warning {
        notices.push(format!(
            "Warning: video bitrate {:.0} kbps is very low; expect poor quality",
            bitrate.video_kbps
        ));
    }

    let plan = resolve(&request.video_codec, &caps.profile, caps.validation.as_ref());
    if let Some(reason) = &plan.fallback {
        let fallback = EngineError::EncoderUnavailable {
            requested: plan.requested.clone(),
            substitute: plan.encoder.to_string(),
            reason: reason.clone(),
        };
        notices.push(format!("Warning: {}", fallback));
    }

    let decode_flags = if request.force_hw_decode {
        if caps.decode_ok(plan.encoder) {
            caps.profile
                .decode_method
                .job_flags(caps.profile.device.as_deref())
        } else {
            notices.push(format!(
                "Hardware decode not validated for {}; decoding in software",
                plan.encoder
            ));
            Vec::new()
        }
    } else {
        Vec::new()
    };

    let output_path = request.resolved_output_path(settings.output_dir.as_deref());
    let command = build_transcode_cmd(
        &settings.ffmpeg,
        &CommandInputs {
            request,
            output_path: &output_path,
            plan: &plan,
            bitrate: &bitrate,
            media: &media,
            decode_flags,
        },
    );
    notices.extend(command.notices.iter().cloned());

    Ok(PreparedJob {
        media,
        duration_s,
        bitrate,
        plan,
        output_path,
        command,
        notices,
    })
}

fn dispatch(inner: &Arc<Inner>) {
    loop {
        let (id, handle) = {
            let mut queue = inner.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.active >= inner.settings.max_workers.max(1) {
                return;
            }
            let Some(id) = queue.pending.pop_front() else {
                return;
            };
            let Some(handle) = inner.handle(id) else {
                continue;
            };
            // Cancelled while queued
            if handle.lock().status.is_terminal() {
                continue;
            }
            queue.active += 1;
            (id, handle)
        };

        let worker = Arc::clone(inner);
        let job_handle = Arc::clone(&handle);
        let spawned = thread::Builder::new()
            .name(format!("job-{}", id.simple()))
            .spawn(move || {
                run_job(&worker, &job_handle);
                worker
                    .dispatch
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .active -= 1;
                dispatch(&worker);
            });

        if let Err(e) = spawned {
            inner
                .dispatch
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .active -= 1;
            if handle.lock().transition(JobStatus::Running) {
                let message = format!("failed to start worker thread: {}", e);
                let event = ProgressEvent::Error {
                    job_id: id,
                    message: message.clone(),
                };
                finish(inner, &handle, JobStatus::Failed, event, |job| {
                    job.last_error = Some(message)
                });
            }
        }
    }
}

fn run_job(inner: &Arc<Inner>, handle: &Arc<JobHandle>) {
    let (job_id, request) = {
        let mut job = handle.lock();
        if !job.transition(JobStatus::Running) {
            return;
        }
        (job.id, job.request.clone())
    };
    inner.hub.publish(ProgressEvent::status(job_id, JobStatus::Running));
    info!(job_id = %job_id, "job started");

    match execute(inner, handle, job_id, &request) {
        Ok(stats) => {
            info!(job_id = %job_id, size_mb = stats.final_size_mb, "job completed");
            let event = ProgressEvent::Done {
                job_id,
                stats: stats.clone(),
            };
            finish(inner, handle, JobStatus::Completed, event, |job| {
                job.stats = Some(stats)
            });
        }
        Err(e) if !e.is_failure() => {
            info!(job_id = %job_id, "job cancelled");
            let event = ProgressEvent::status(job_id, JobStatus::Cancelled);
            finish(inner, handle, JobStatus::Cancelled, event, |_| {});
        }
        Err(e) => {
            let message = e.to_string();
            warn!(job_id = %job_id, error = %message, "job failed");
            let event = ProgressEvent::Error {
                job_id,
                message: message.clone(),
            };
            finish(inner, handle, JobStatus::Failed, event, |job| {
                job.last_error = Some(message)
            });
        }
    }
}

/// Record a terminal state and publish its event. The first terminal state
/// wins; a later one is discarded.
fn finish(
    inner: &Inner,
    handle: &JobHandle,
    status: JobStatus,
    event: ProgressEvent,
    update: impl FnOnce(&mut Job),
) -> bool {
    {
        let mut job = handle.lock();
        if !job.transition(status) {
            debug!(job_id = %job.id, current = %job.status, discarded = %status, "late terminal state ignored");
            return false;
        }
        update(&mut job);
        inner.hub.publish(event);
    }
    inner.prune_finished();
    true
}

fn execute(
    inner: &Arc<Inner>,
    handle: &Arc<JobHandle>,
    job_id: Uuid,
    request: &TranscodeRequest,
) -> EngineResult<JobStats> {
    inner.log(job_id, inner.caps.profile.summary());

    let prepared = prepare(&inner.caps, &inner.settings, request)?;
    for notice in &prepared.notices {
        inner.log(job_id, notice.clone());
    }
    inner.log(
        job_id,
        format!(
            "Encoding with {} at {:.0} kbps video ({:.1}s)",
            prepared.plan.encoder, prepared.bitrate.video_kbps, prepared.duration_s
        ),
    );
    inner.log(job_id, format!("FFmpeg command: {}", prepared.command.display()));

    {
        let mut job = handle.lock();
        job.encoder = Some(prepared.plan.encoder.to_string());
        job.output_path = Some(prepared.output_path.clone());
    }

    if handle.cancel_requested() {
        return Err(EngineError::CancelledByUser);
    }

    if let Some(parent) = prepared.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            EngineError::Io(format!("cannot create output directory {}", parent.display()), e)
        })?;
    }

    supervise(inner, handle, job_id, &prepared.command, prepared.duration_s)
        .map_err(|e| runtime_init_failure(e, prepared.plan.encoder))?;

    let final_bytes = fs::metadata(&prepared.output_path).map(|m| m.len()).unwrap_or_else(|e| {
        warn!(job_id = %job_id, error = %e, "could not stat output file");
        0
    });

    Ok(JobStats {
        input_path: request.input_path.clone(),
        output_path: prepared.output_path,
        duration_s: prepared.duration_s,
        target_size_mb: request.target_size_mb,
        final_size_mb: final_bytes as f64 / (1024.0 * 1024.0),
        encoder: prepared.plan.encoder.to_string(),
    })
}

/// Run ffmpeg to completion. Progress is read from stdout and stderr is
/// streamed as log lines; the calling thread owns the child and polls it so
/// cancellation can signal it directly.
fn supervise(
    inner: &Arc<Inner>,
    handle: &Arc<JobHandle>,
    job_id: Uuid,
    command: &TranscodeCommand,
    duration_s: f64,
) -> EngineResult<()> {
    let mut cmd = command.to_command();
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| EngineError::Spawn {
        program: command.program.clone(),
        source,
    })?;
    debug!(job_id = %job_id, pid = child.id(), "ffmpeg spawned");

    let progress_thread = child.stdout.take().map(|stdout| {
        let inner = Arc::clone(inner);
        let handle = Arc::clone(handle);
        thread::spawn(move || read_progress(stdout, &inner, &handle, job_id, duration_s))
    });

    let tail: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
    let stderr_thread = child.stderr.take().map(|stderr| {
        let inner = Arc::clone(inner);
        let tail = Arc::clone(&tail);
        let limit = inner.settings.log_tail_lines.max(1);
        thread::spawn(move || {
            drain_lines(stderr, |line| {
                let line = line.trim_end();
                if line.is_empty() {
                    return;
                }
                {
                    let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
                    if tail.len() >= limit {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
                inner.log(job_id, line);
            })
        })
    });

    let grace = inner.settings.cancel_grace;
    let mut terminated_at: Option<Instant> = None;
    let mut killed = false;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {}
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                break Err(EngineError::Spawn {
                    program: command.program.clone(),
                    source,
                });
            }
        }

        if handle.cancel_requested() {
            match terminated_at {
                None => {
                    inner.log(job_id, "Cancellation requested, stopping ffmpeg");
                    terminate(&mut child);
                    terminated_at = Some(Instant::now());
                }
                Some(at) if !killed && at.elapsed() >= grace => {
                    warn!(job_id = %job_id, "ffmpeg ignored termination, killing");
                    let _ = child.kill();
                    killed = true;
                }
                _ => {}
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    if let Some(t) = progress_thread {
        let _ = t.join();
    }
    if let Some(t) = stderr_thread {
        let _ = t.join();
    }
    let status = status?;

    if terminated_at.is_some() {
        return Err(EngineError::CancelledByUser);
    }
    if !status.success() {
        let tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        return Err(EngineError::SubprocessFailed {
            code: status.code().unwrap_or(-1),
            tail: tail.iter().cloned().collect::<Vec<_>>().join("\n"),
        });
    }
    Ok(())
}

/// A hardware encoder that passed validation can still refuse to open at job
/// time; report that distinctly from an ordinary ffmpeg failure.
fn runtime_init_failure(err: EngineError, encoder: Encoder) -> EngineError {
    let EngineError::SubprocessFailed { code, tail } = err else {
        return err;
    };
    if encoder.is_hardware() {
        let (passed, reason) = validate::classify_encode(encoder, &ProbeOutput::failed(code, &tail));
        if !passed && !reason.starts_with("Encode failed") {
            return EngineError::EncoderInitFailed {
                encoder: encoder.to_string(),
                message: format!("{}\nLast stderr output:\n{}", reason, tail),
            };
        }
    }
    EngineError::SubprocessFailed { code, tail }
}

/// Publish progress in steps of at least 1%, plus the final step to ~100%.
fn read_progress(
    stdout: impl Read,
    inner: &Inner,
    handle: &JobHandle,
    job_id: Uuid,
    duration_s: f64,
) {
    let mut parser = ProgressParser::new();
    let mut reported = 0.0_f64;

    drain_lines(stdout, |line| {
        let advanced = parser.parse_line(line);
        if !advanced && !parser.is_complete {
            return;
        }
        let ratio = parser.ratio(duration_s);
        let finishing = ratio >= 0.999 && reported < 0.999;
        if ratio - reported >= 0.01 || finishing {
            reported = ratio;
            handle.lock().set_progress(ratio);
            inner.hub.publish(ProgressEvent::Progress {
                job_id,
                progress: ratio,
            });
        }
    });
}

/// Read `source` to EOF, handing each line to `on_line`. Bytes that are not
/// UTF-8 are replaced rather than ending the read, so the pipe is always
/// drained and ffmpeg never blocks on a full buffer.
fn drain_lines(source: impl Read, mut on_line: impl FnMut(&str)) {
    let mut reader = BufReader::new(source);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                on_line(line.trim_end_matches(['\n', '\r']));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(error = %e, "pipe read failed");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    // SAFETY: kill(2) on the pid of a child we have not reaped yet.
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}
