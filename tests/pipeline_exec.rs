//! End-to-end tests for the pipeline executor.
//!
//! These spawn common Unix utilities (`printf`, `grep`, `awk`, `sort`, `seq`,
//! `wc`, `sh`, `sleep`).

#![cfg(unix)]

use std::thread;
use std::time::{Duration, Instant};

use pipex::exec::{CancelToken, Executor, Pipeline, PipelineError, ProcessSpec, StageStatus};

fn stage(program: &str, args: &[&str]) -> ProcessSpec {
    ProcessSpec::new(program).args(args.iter().copied())
}

fn sh(script: &str) -> ProcessSpec {
    stage("sh", &["-c", script])
}

#[test]
fn printf_into_grep() {
    let pipeline = Pipeline::single(stage("printf", &["a\nb\nc\n"])).pipe(stage("grep", &["b"]));

    let result = Executor::new().run(&pipeline).unwrap();

    assert!(result.success(), "stderr: {}", result.stderr_text());
    assert_eq!(result.stdout, b"b\n");
    assert_eq!(result.stages.len(), 2);
    assert!(result.stages.iter().all(|s| !s.terminated));
}

#[test]
fn single_stage_passes_output_and_status_through() {
    let ok = Executor::new()
        .run(&Pipeline::single(stage("printf", &["one\ntwo"])))
        .unwrap();
    assert!(ok.success());
    assert_eq!(ok.stdout, b"one\ntwo");

    let failed = Executor::new()
        .run(&Pipeline::single(sh("printf partial; exit 3")))
        .unwrap();
    assert!(!failed.success());
    assert_eq!(failed.stdout, b"partial");
    assert_eq!(failed.stages[0].status, StageStatus::Exited { code: 3 });
}

#[test]
fn three_stage_chain_matches_shell() {
    let pipeline = Pipeline::single(stage("printf", &["x 1\ny 2\nz 3\n"]))
        .pipe(stage("grep", &["y"]))
        .pipe(stage("awk", &["{print $1}"]));

    let result = Executor::new().run_checked(&pipeline).unwrap();

    assert_eq!(result.stdout_text(), "y\n");
}

#[test]
fn five_buffering_stages_do_not_deadlock() {
    // Far more than one pipe buffer flows through every link.
    let pipeline = Pipeline::single(stage("seq", &["1", "50000"]))
        .pipe(stage("sort", &[]))
        .pipe(stage("sort", &["-n"]))
        .pipe(stage("sort", &["-rn"]))
        .pipe(stage("wc", &["-l"]));

    let result = Executor::new()
        .timeout(Some(Duration::from_secs(30)))
        .run_checked(&pipeline)
        .unwrap();

    assert_eq!(result.stdout_text().trim(), "50000");
}

#[test]
fn middle_stage_failure_fails_the_run() {
    let pipeline = Pipeline::single(stage("printf", &["a\n"]))
        .pipe(sh("cat >/dev/null; echo middle broke >&2; exit 2"))
        .pipe(stage("cat", &[]));

    let result = Executor::new().run(&pipeline).unwrap();

    assert!(!result.success());
    assert_eq!(result.stages[0].status, StageStatus::Exited { code: 0 });
    assert_eq!(result.stages[1].status, StageStatus::Exited { code: 2 });

    let err = result.check().unwrap_err();
    assert!(matches!(err, PipelineError::Exit { stage: 1, .. }), "got: {err:?}");
    assert_eq!(err.stderr(), Some(&b"middle broke\n"[..]));
}

#[test]
fn missing_first_program_writes_nothing() {
    let pipeline = Pipeline::single(stage("pipex-definitely-not-installed", &[]))
        .pipe(stage("cat", &[]));
    let mut sink = Vec::new();

    let err = Executor::new().run_into(&pipeline, &mut sink).unwrap_err();

    match err {
        PipelineError::Start { stage, program, .. } => {
            assert_eq!(stage, 0);
            assert_eq!(program, "pipex-definitely-not-installed");
        }
        other => panic!("expected Start, got: {other:?}"),
    }
    assert!(sink.is_empty());
}

#[test]
fn missing_later_program_stops_earlier_stages() {
    let pipeline = Pipeline::single(stage("sleep", &["5"]))
        .pipe(stage("pipex-definitely-not-installed", &[]));
    let started = Instant::now();

    let err = Executor::new()
        .term_grace(Duration::from_millis(100))
        .run(&pipeline)
        .unwrap_err();

    assert!(matches!(err, PipelineError::Start { stage: 1, .. }), "got: {err:?}");
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn repeated_runs_give_identical_output() {
    let pipeline = Pipeline::single(stage("printf", &["3\n1\n2\n"])).pipe(stage("sort", &[]));
    let executor = Executor::new();

    let first = executor.run_checked(&pipeline).unwrap();
    let second = executor.run_checked(&pipeline).unwrap();

    assert_eq!(first.stdout, b"1\n2\n3\n");
    assert_eq!(first.stdout, second.stdout);
}

#[test]
fn stderr_is_combined_across_stages() {
    let pipeline = Pipeline::single(sh("echo first >&2; echo payload"))
        .pipe(sh("cat; echo second >&2"));

    let result = Executor::new().run_checked(&pipeline).unwrap();

    assert_eq!(result.stdout_text(), "payload\n");
    let stderr = result.stderr_text();
    assert!(stderr.contains("first\n"), "stderr: {stderr}");
    assert!(stderr.contains("second\n"), "stderr: {stderr}");
}

#[test]
fn run_into_streams_to_the_sink() {
    let pipeline = Pipeline::single(stage("seq", &["1", "3"])).pipe(stage("awk", &["{print $1 * 10}"]));
    let mut sink = Vec::new();

    let result = Executor::new().run_into(&pipeline, &mut sink).unwrap();

    assert!(result.success());
    assert!(result.stdout.is_empty());
    assert_eq!(sink, b"10\n20\n30\n");
}

#[test]
fn deadline_stops_a_hung_pipeline() {
    let pipeline = Pipeline::single(stage("sleep", &["10"])).pipe(stage("cat", &[]));
    let started = Instant::now();

    let result = Executor::new()
        .timeout(Some(Duration::from_millis(200)))
        .term_grace(Duration::from_millis(200))
        .run(&pipeline)
        .unwrap();

    assert!(result.timed_out);
    assert!(!result.success());
    assert!(result.stages[0].terminated);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(result.check(), Err(PipelineError::TimedOut { .. })));
}

#[test]
fn cancel_token_stops_the_run() {
    let cancel = CancelToken::new();
    let executor = Executor::new().cancel_token(cancel.clone()).timeout(None);
    let pipeline = Pipeline::single(stage("sleep", &["10"]));

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        cancel.cancel();
    });
    let started = Instant::now();
    let result = executor.run(&pipeline).unwrap();
    canceller.join().unwrap();

    assert!(result.cancelled);
    assert!(result.stages[0].terminated);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(result.check(), Err(PipelineError::Cancelled { .. })));
}

#[test]
fn fail_fast_stops_stages_outliving_a_failure() {
    let pipeline = Pipeline::single(sh("exit 1")).pipe(stage("sleep", &["10"]));
    let started = Instant::now();

    let result = Executor::new()
        .term_grace(Duration::from_millis(100))
        .run(&pipeline)
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.stages[0].status, StageStatus::Exited { code: 1 });
    assert!(result.stages[1].terminated);
    assert!(!result.timed_out);
}

#[test]
fn without_fail_fast_downstream_still_finishes() {
    let pipeline = Pipeline::single(sh("echo kept; exit 1")).pipe(stage("cat", &[]));

    let result = Executor::new().fail_fast(false).run(&pipeline).unwrap();

    assert_eq!(result.stdout_text(), "kept\n");
    assert_eq!(result.stages[1].status, StageStatus::Exited { code: 0 });
    assert!(!result.stages[1].terminated);
    assert!(matches!(result.check(), Err(PipelineError::Exit { stage: 0, .. })));
}

#[test]
fn stage_ignoring_sigterm_is_killed_after_the_grace_period() {
    let pipeline = Pipeline::single(sh("trap '' TERM; sleep 10"));
    let started = Instant::now();

    let result = Executor::new()
        .timeout(Some(Duration::from_millis(200)))
        .term_grace(Duration::from_millis(200))
        .run(&pipeline)
        .unwrap();

    assert!(result.timed_out);
    assert!(result.stages[0].terminated);
    assert_eq!(result.stages[0].status, StageStatus::Signaled { signal: libc::SIGKILL });
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn deadline_covers_output_held_by_a_background_child() {
    // The stage exits at once, but the backgrounded sleep keeps its stdout
    // and stderr open.
    let pipeline = Pipeline::single(sh("sleep 6 &"));
    let started = Instant::now();

    let result = Executor::new()
        .timeout(Some(Duration::from_millis(500)))
        .run(&pipeline)
        .unwrap();

    assert!(result.timed_out);
    assert!(!result.success());
    assert_eq!(result.stages[0].status, StageStatus::Exited { code: 0 });
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(matches!(result.check(), Err(PipelineError::TimedOut { .. })));
}

#[test]
fn cancel_covers_output_held_by_a_background_child() {
    let cancel = CancelToken::new();
    let executor = Executor::new().cancel_token(cancel.clone()).timeout(None);
    let pipeline = Pipeline::single(sh("echo early; sleep 6 &"));

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        cancel.cancel();
    });
    let started = Instant::now();
    let result = executor.run(&pipeline).unwrap();
    canceller.join().unwrap();

    assert!(result.cancelled);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(result.stages[0].status, StageStatus::Exited { code: 0 });
    assert_eq!(result.stdout_text(), "early\n");
}
