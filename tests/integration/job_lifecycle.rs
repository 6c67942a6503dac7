// End-to-end job runs against scripted ffmpeg/ffprobe stand-ins

use crate::common::{
    FFMPEG_FAIL, FFMPEG_LATIN1, FFMPEG_OK, FFMPEG_SLOW, FakeTools, collect_events, log_messages,
    wait_for,
};
use sizepress::engine::error::EngineError;
use sizepress::engine::{
    CancelOutcome, JobStatus, OrchestratorSettings, ProgressEvent, TranscodeRequest,
};
use std::thread;
use std::time::{Duration, Instant};

const LIMIT: Duration = Duration::from_secs(20);

fn request(tools: &FakeTools, output: &str) -> TranscodeRequest {
    let mut req = TranscodeRequest::new(&tools.input, 8.0);
    req.video_codec = "libx264".to_string();
    req.output_path = Some(tools.output(output));
    req
}

#[test]
fn test_successful_job_event_order() {
    let tools = FakeTools::new(FFMPEG_OK);
    let orch = tools.orchestrator(tools.settings());
    let id = orch.submit(request(&tools, "done.mp4"));
    let events = collect_events(orch.subscribe(id).unwrap(), LIMIT);

    assert_eq!(events[0], ProgressEvent::status(id, JobStatus::Queued));
    let running = events
        .iter()
        .position(|e| *e == ProgressEvent::status(id, JobStatus::Running))
        .expect("running status");
    let first_progress = events
        .iter()
        .position(|e| matches!(e, ProgressEvent::Progress { .. }))
        .expect("progress events");
    assert!(running < first_progress);

    let ratios: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert!(ratios.windows(2).all(|w| w[0] <= w[1]), "{:?}", ratios);
    assert!((ratios.last().unwrap() - 1.0).abs() < 1e-9);

    // Exactly one terminal event, and it is last
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    let ProgressEvent::Done { stats, .. } = events.last().unwrap() else {
        panic!("expected done, got {:?}", events.last());
    };
    assert_eq!(stats.encoder, "libx264");
    assert_eq!(stats.output_path, tools.output("done.mp4"));
    assert!(stats.final_size_mb > 0.0);
    assert_eq!(stats.duration_s, 10.0);

    let logs = log_messages(&events);
    assert!(logs.iter().any(|l| l.starts_with("FFmpeg command:")));
    assert!(logs.iter().any(|l| l.contains("libopus to aac")));
    assert!(logs.iter().any(|l| l == "Stream mapping: h264 -> libx264"));

    let job = orch.status(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 1.0);
    assert!(job.finished_at.is_some());
}

#[test]
fn test_failed_job_carries_stderr_tail() {
    let tools = FakeTools::new(FFMPEG_FAIL);
    let settings = OrchestratorSettings {
        log_tail_lines: 5,
        ..tools.settings()
    };
    let orch = tools.orchestrator(settings);
    let id = orch.submit(request(&tools, "fail.mp4"));
    let events = collect_events(orch.subscribe(id).unwrap(), LIMIT);

    let ProgressEvent::Error { message, .. } = events.last().unwrap() else {
        panic!("expected error, got {:?}", events.last());
    };
    assert!(message.starts_with("ffmpeg exited with code 1"));
    assert!(message.contains("err-26"));
    assert!(message.contains("err-30"));
    assert!(!message.contains("err-25"));

    // Every stderr line was still streamed live
    assert_eq!(
        log_messages(&events)
            .iter()
            .filter(|l| l.starts_with("err-"))
            .count(),
        30
    );

    let job = orch.wait(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some(message.as_str()));
}

#[test]
fn test_non_utf8_output_keeps_pipes_drained() {
    let tools = FakeTools::new(FFMPEG_LATIN1);
    // Keep every line in the replay so the check does not race the job
    let settings = OrchestratorSettings {
        history_len: 10_000,
        ..tools.settings()
    };
    let orch = tools.orchestrator(settings);
    let id = orch.submit(request(&tools, "latin1.mp4"));
    let rx = orch.subscribe(id).unwrap();

    let events = collect_events(rx, LIMIT);
    assert!(
        matches!(events.last(), Some(ProgressEvent::Done { .. })),
        "{:?}",
        events.last()
    );
    let logs = log_messages(&events);
    assert!(logs.iter().any(|l| l.ends_with("caf\u{FFFD}")));
    assert!(logs.iter().any(|l| l.starts_with("frame-3000 ")));
    assert_eq!(logs.last().map(String::as_str), Some("caf\u{FFFD} done"));

    let job = orch.status(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 1.0);
}

#[test]
fn test_non_utf8_stderr_lands_in_failure_tail() {
    let tools = FakeTools::new("#!/bin/sh\nprintf 'bad input: caf\\351\\n' >&2\nexit 1\n");
    let orch = tools.orchestrator(tools.settings());
    let id = orch.submit(request(&tools, "tail.mp4"));

    let job = orch.wait(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.last_error.as_deref().unwrap().ends_with("bad input: caf\u{FFFD}"),
        "{:?}",
        job.last_error
    );
}

#[test]
fn test_cancel_running_job() {
    let tools = FakeTools::new(FFMPEG_SLOW);
    let orch = tools.orchestrator(tools.settings());
    let id = orch.submit(request(&tools, "slow.mp4"));
    let rx = orch.subscribe(id).unwrap();

    wait_for(&rx, LIMIT, |e| matches!(e, ProgressEvent::Progress { .. }));
    assert_eq!(orch.cancel(id).unwrap(), CancelOutcome::Requested);

    let rest = collect_events(rx, LIMIT);
    assert_eq!(
        rest.last(),
        Some(&ProgressEvent::status(id, JobStatus::Cancelled))
    );
    assert!(!rest.iter().any(|e| matches!(e, ProgressEvent::Error { .. })));
    assert_eq!(orch.status(id).unwrap().status, JobStatus::Cancelled);
}

#[test]
fn test_cancel_queued_job_never_launches() {
    let tools = FakeTools::new(FFMPEG_SLOW);
    let orch = tools.orchestrator(tools.settings());

    let first = orch.submit(request(&tools, "first.mp4"));
    let second = orch.submit(request(&tools, "second.mp4"));
    assert_eq!(orch.status(second).unwrap().status, JobStatus::Queued);

    assert_eq!(orch.cancel(second).unwrap(), CancelOutcome::Cancelled);
    let events = collect_events(orch.subscribe(second).unwrap(), LIMIT);
    assert_eq!(
        events,
        vec![
            ProgressEvent::status(second, JobStatus::Queued),
            ProgressEvent::status(second, JobStatus::Cancelled),
        ]
    );
    assert!(orch.status(second).unwrap().started_at.is_none());

    orch.cancel(first).unwrap();
    assert_eq!(orch.wait(first).unwrap().status, JobStatus::Cancelled);
}

#[test]
fn test_queue_drains_with_one_worker() {
    let tools = FakeTools::new(FFMPEG_OK);
    let orch = tools.orchestrator(tools.settings());

    let ids: Vec<_> = (0..3)
        .map(|i| orch.submit(request(&tools, &format!("batch-{}.mp4", i))))
        .collect();
    for id in &ids {
        assert_eq!(orch.wait(*id).unwrap().status, JobStatus::Completed);
    }
    assert_eq!(orch.jobs().len(), 3);
}

#[test]
fn test_forget_refuses_active_jobs() {
    let tools = FakeTools::new(FFMPEG_SLOW);
    let orch = tools.orchestrator(tools.settings());
    let running = orch.submit(request(&tools, "running.mp4"));
    let queued = orch.submit(request(&tools, "queued.mp4"));

    assert!(matches!(
        orch.forget(queued),
        Err(EngineError::JobActive(_, JobStatus::Queued))
    ));

    orch.cancel(queued).unwrap();
    let forgotten = orch.forget(queued).unwrap();
    assert_eq!(forgotten.status, JobStatus::Cancelled);
    assert!(orch.status(queued).is_none());
    assert!(matches!(orch.subscribe(queued), Err(EngineError::UnknownJob(_))));
    assert!(matches!(orch.forget(queued), Err(EngineError::UnknownJob(_))));

    orch.cancel(running).unwrap();
    assert_eq!(orch.wait(running).unwrap().status, JobStatus::Cancelled);
    assert_eq!(orch.forget(running).unwrap().status, JobStatus::Cancelled);
    assert!(orch.jobs().is_empty());
}

#[test]
fn test_finished_jobs_beyond_retention_are_dropped() {
    let tools = FakeTools::new(FFMPEG_OK);
    let settings = OrchestratorSettings {
        finished_retention: 2,
        ..tools.settings()
    };
    let orch = tools.orchestrator(settings);

    let ids: Vec<_> = (0..4)
        .map(|i| orch.submit(request(&tools, &format!("kept-{}.mp4", i))))
        .collect();
    // One worker runs them in order, so the last one finishes last
    assert_eq!(orch.wait(ids[3]).unwrap().status, JobStatus::Completed);

    // Pruning runs right after the terminal event goes out
    let deadline = Instant::now() + LIMIT;
    while orch.jobs().len() > 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let mut kept: Vec<_> = orch.jobs().iter().map(|j| j.id).collect();
    kept.sort();
    let mut newest = ids[2..].to_vec();
    newest.sort();
    assert_eq!(kept, newest);
    assert!(orch.status(ids[0]).is_none());
    assert!(matches!(orch.subscribe(ids[1]), Err(EngineError::UnknownJob(_))));
}

#[test]
fn test_cancel_after_completion_keeps_completed() {
    let tools = FakeTools::new(FFMPEG_OK);
    let orch = tools.orchestrator(tools.settings());
    let id = orch.submit(request(&tools, "race.mp4"));
    assert_eq!(orch.wait(id).unwrap().status, JobStatus::Completed);

    assert_eq!(
        orch.cancel(id).unwrap(),
        CancelOutcome::AlreadyFinished(JobStatus::Completed)
    );
    assert_eq!(orch.status(id).unwrap().status, JobStatus::Completed);

    // Late subscribers get the replay ending with the single done event
    let events = collect_events(orch.subscribe(id).unwrap(), LIMIT);
    assert!(matches!(events.last(), Some(ProgressEvent::Done { .. })));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[test]
fn test_unreadable_duration_fails_before_launch() {
    let tools = FakeTools::new(FFMPEG_OK);
    crate::common::write_script(
        tools.dir.path(),
        "ffprobe",
        "#!/bin/sh\necho '{\"format\":{\"duration\":\"0\"},\"streams\":[]}'\n",
    );
    let orch = tools.orchestrator(tools.settings());
    let id = orch.submit(request(&tools, "never.mp4"));

    let job = orch.wait(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("unusable duration"));
    assert!(!tools.output("never.mp4").exists());
}
