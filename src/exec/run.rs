use std::io::{self, Read, Write};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::error::PipelineError;
use super::types::{CancelToken, ExecutionResult, Pipeline, StageReport, StageStatus};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_TERM_GRACE: Duration = Duration::from_millis(500);

const DRAIN_CHUNK: usize = 8 * 1024;

/// Runs pipelines without a shell.
///
/// Every stage is an OS process; all of them run at once, connected by
/// anonymous pipes, while the calling thread supervises them. A run ends
/// when every stage has exited, or when the deadline, the cancel token or
/// a failing stage (with fail-fast on) makes the executor stop the rest.
/// The deadline and the cancel token also cover the time spent collecting
/// output after the last stage exited, since a forked grandchild may still
/// hold a stage's stdout or stderr open.
///
/// On Unix all stages of a run share one process group led by the first
/// stage, so stopping the run reaches anything the stages forked. That group
/// is not the terminal's foreground group: a stage that opens `/dev/tty`
/// (an `ssh` or `sudo` password prompt) is stopped by SIGTTIN/SIGTTOU and
/// stays stopped until the deadline or the cancel token ends the run.
#[derive(Debug, Clone)]
pub struct Executor {
    timeout: Option<Duration>,
    poll_interval: Duration,
    term_grace: Duration,
    fail_fast: bool,
    cancel: CancelToken,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            timeout: Some(DEFAULT_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
            term_grace: DEFAULT_TERM_GRACE,
            fail_fast: true,
            cancel: CancelToken::new(),
        }
    }

    /// Overall deadline for a run. `None` waits forever.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long stopped stages get between SIGTERM and SIGKILL.
    pub fn term_grace(mut self, grace: Duration) -> Self {
        self.term_grace = grace;
        self
    }

    /// Stop the remaining stages as soon as one exits unsuccessfully.
    pub fn fail_fast(mut self, enabled: bool) -> Self {
        self.fail_fast = enabled;
        self
    }

    /// Use `cancel` for every run of this executor. A cancelled token stays
    /// cancelled, so later runs stop immediately.
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run `pipeline`, capturing the last stage's output in the result.
    ///
    /// Stage failures are reported in the result, not as `Err`; use
    /// [`ExecutionResult::check`] or [`Executor::run_checked`] to treat them
    /// as errors.
    pub fn run(&self, pipeline: &Pipeline) -> Result<ExecutionResult, PipelineError> {
        let mut stdout = Vec::new();
        let mut result = self.run_into(pipeline, &mut stdout)?;
        result.stdout = stdout;
        Ok(result)
    }

    /// Like [`Executor::run`], but any unsuccessful run is an `Err`.
    pub fn run_checked(&self, pipeline: &Pipeline) -> Result<ExecutionResult, PipelineError> {
        self.run(pipeline)?.check()
    }

    /// Run `pipeline`, streaming the last stage's output into `sink` while
    /// it is produced. The returned result has an empty `stdout`.
    pub fn run_into<W: Write + Send>(
        &self,
        pipeline: &Pipeline,
        sink: &mut W,
    ) -> Result<ExecutionResult, PipelineError> {
        let started_at = Instant::now();
        let stderr = Mutex::new(Vec::new());
        debug!(%pipeline, stages = pipeline.len(), "starting pipeline");

        let (stages, interrupt) = thread::scope(|scope| {
            let mut stages: Vec<Stage> = Vec::with_capacity(pipeline.len());
            let mut sink = Some(sink);
            let mut output = None;
            let mut drains = Vec::with_capacity(pipeline.len());
            let mut upstream: Option<io::PipeReader> = None;
            // Previous stage's command. It owns our copy of the write end of
            // the link into the stage being started.
            let mut holder: Option<Command> = None;
            let last = pipeline.len() - 1;

            for (index, spec) in pipeline.stages().iter().enumerate() {
                let mut cmd = spec.command();
                cmd.stdin(upstream.take().map_or_else(Stdio::null, Stdio::from))
                    .stderr(Stdio::piped());

                let downstream = if index == last {
                    cmd.stdout(Stdio::piped());
                    None
                } else {
                    match io::pipe() {
                        Ok((reader, writer)) => {
                            cmd.stdout(writer);
                            Some(reader)
                        }
                        Err(source) => {
                            drop(holder.take());
                            self.shutdown(&mut stages);
                            return Err(PipelineError::Link {
                                stage: index,
                                source,
                            });
                        }
                    }
                };

                #[cfg(unix)]
                join_group(&mut cmd, stages.first());

                let mut child = match cmd.spawn() {
                    Ok(child) => child,
                    Err(source) => {
                        warn!(stage = index, program = spec.program(), error = %source, "stage failed to start");
                        drop(holder.take());
                        self.shutdown(&mut stages);
                        return Err(PipelineError::Start {
                            stage: index,
                            program: spec.program().to_string(),
                            source,
                        });
                    }
                };
                debug!(stage = index, program = spec.program(), pid = child.id(), "stage started");

                // This stage is running, so the predecessor's link may close:
                // once the predecessor exits, this stage reads end-of-input.
                drop(holder.replace(cmd));

                if let Some(pipe) = child.stderr.take() {
                    let stderr = &stderr;
                    drains.push(scope.spawn(move || drain_stderr(index, pipe, stderr)));
                }
                if index == last
                    && let (Some(mut out), Some(sink)) = (child.stdout.take(), sink.take())
                {
                    output = Some(scope.spawn(move || io::copy(&mut out, sink)));
                }

                stages.push(Stage {
                    index,
                    program: spec.program().to_string(),
                    child,
                    status: None,
                    terminated: false,
                });
                upstream = downstream;
            }
            drop(holder);

            let interrupt = match self.supervise(&mut stages, started_at) {
                None => self.await_readers(
                    || {
                        drains.iter().all(|h| h.is_finished())
                            && output.as_ref().is_none_or(|h| h.is_finished())
                    },
                    stages.first().map(|s| s.child.id()),
                    started_at,
                ),
                interrupted => interrupted,
            };

            if let Some(handle) = output {
                let copied = handle
                    .join()
                    .unwrap_or_else(|_| Err(io::Error::other("output reader panicked")));
                match copied {
                    Ok(bytes) => debug!(bytes, "final stage output collected"),
                    Err(source) => return Err(PipelineError::Io { source }),
                }
            }
            Ok((stages, interrupt))
        })?;

        let result = ExecutionResult {
            stdout: Vec::new(),
            stderr: stderr.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()),
            stages: stages.into_iter().map(Stage::into_report).collect(),
            elapsed: started_at.elapsed(),
            timed_out: matches!(interrupt, Some(Interrupt::TimedOut)),
            cancelled: matches!(interrupt, Some(Interrupt::Cancelled)),
        };
        if result.success() {
            debug!(elapsed = ?result.elapsed, "pipeline finished");
        } else {
            debug!(
                elapsed = ?result.elapsed,
                stderr = %result.stderr_text().trim_end(),
                "pipeline failed"
            );
        }
        Ok(result)
    }

    /// Poll every stage until all have exited or the run is interrupted.
    fn supervise(&self, stages: &mut [Stage], started_at: Instant) -> Option<Interrupt> {
        let deadline = self.timeout.map(|timeout| started_at + timeout);
        loop {
            let mut running = 0;
            let mut failed = false;
            for stage in stages.iter_mut().filter(|s| s.status.is_none()) {
                match stage.child.try_wait() {
                    Ok(Some(status)) => {
                        let status = StageStatus::from(status);
                        debug!(stage = stage.index, program = %stage.program, %status, "stage exited");
                        failed |= !status.success();
                        stage.status = Some(status);
                    }
                    Ok(None) => running += 1,
                    Err(e) => {
                        warn!(stage = stage.index, error = %e, "cannot poll stage, killing it");
                        let _ = stage.child.kill();
                        let _ = stage.child.wait();
                        stage.status = Some(StageStatus::Unknown);
                        stage.terminated = true;
                        failed = true;
                    }
                }
            }

            if running == 0 {
                return None;
            }
            if self.cancel.is_cancelled() {
                info!(running, "pipeline cancelled, stopping stages");
                self.shutdown(stages);
                return Some(Interrupt::Cancelled);
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                warn!(running, timeout = ?self.timeout, "pipeline deadline expired, stopping stages");
                self.shutdown(stages);
                return Some(Interrupt::TimedOut);
            }
            if failed && self.fail_fast {
                debug!(running, "stage failed, stopping the rest");
                self.shutdown(stages);
                return None;
            }

            thread::sleep(self.poll_interval);
        }
    }

    /// Wait until the readers have seen end-of-file on every stage pipe.
    ///
    /// All stages have exited at this point; only something they forked can
    /// keep a pipe open. On deadline or cancellation the whole process group
    /// is killed so the readers finish.
    fn await_readers(
        &self,
        finished: impl Fn() -> bool,
        leader: Option<u32>,
        started_at: Instant,
    ) -> Option<Interrupt> {
        let deadline = self.timeout.map(|timeout| started_at + timeout);
        loop {
            if finished() {
                return None;
            }
            let interrupt = if self.cancel.is_cancelled() {
                Interrupt::Cancelled
            } else if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                Interrupt::TimedOut
            } else {
                thread::sleep(self.poll_interval);
                continue;
            };
            warn!("stage output still held open after every stage exited, killing the process group");
            #[cfg(unix)]
            if let Some(leader) = leader {
                signal_group(leader, libc::SIGKILL);
            }
            #[cfg(not(unix))]
            let _ = leader;
            return Some(interrupt);
        }
    }

    /// Stop every stage that is still running, then reap it.
    fn shutdown(&self, stages: &mut [Stage]) {
        if stages.iter().all(|s| s.status.is_some()) {
            return;
        }

        #[cfg(unix)]
        if let Some(leader) = stages.first().map(|s| s.child.id()) {
            signal_group(leader, libc::SIGTERM);
            let grace_end = Instant::now() + self.term_grace;
            while reap_exited(stages) && Instant::now() < grace_end {
                thread::sleep(self.poll_interval);
            }
            signal_group(leader, libc::SIGKILL);
        }

        for stage in stages.iter_mut().filter(|s| s.status.is_none()) {
            let _ = stage.child.kill();
            let status = match stage.child.wait() {
                Ok(status) => StageStatus::from(status),
                Err(e) => {
                    warn!(stage = stage.index, error = %e, "failed to reap stage");
                    StageStatus::Unknown
                }
            };
            debug!(stage = stage.index, program = %stage.program, %status, "stage stopped");
            stage.status = Some(status);
            stage.terminated = true;
        }
    }
}

struct Stage {
    index: usize,
    program: String,
    child: Child,
    status: Option<StageStatus>,
    terminated: bool,
}

impl Stage {
    fn into_report(self) -> StageReport {
        StageReport {
            index: self.index,
            program: self.program,
            status: self.status.unwrap_or(StageStatus::Unknown),
            terminated: self.terminated,
        }
    }
}

enum Interrupt {
    TimedOut,
    Cancelled,
}

/// Append everything a stage writes to stderr to the shared buffer.
fn drain_stderr(stage: usize, mut pipe: ChildStderr, combined: &Mutex<Vec<u8>>) {
    let mut chunk = [0u8; DRAIN_CHUNK];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if let Ok(mut buf) = combined.lock() {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(stage, error = %e, "stopped reading stage stderr");
                break;
            }
        }
    }
}

/// Put every stage in one process group led by the first stage, so a
/// single signal reaches the whole pipeline and anything it forked.
#[cfg(unix)]
fn join_group(cmd: &mut Command, leader: Option<&Stage>) {
    use std::os::unix::process::CommandExt;

    cmd.process_group(leader.map_or(0, |stage| stage.child.id() as i32));
}

#[cfg(unix)]
fn signal_group(leader: u32, signal: libc::c_int) {
    // SAFETY: kill(2) only delivers a signal; a negative pid addresses the
    // process group and touches no memory of ours.
    let rc = unsafe { libc::kill(-(leader as libc::pid_t), signal) };
    if rc != 0 {
        debug!(group = leader, signal, error = %io::Error::last_os_error(), "group signal not delivered");
    }
}

/// Record stages that have exited since the last poll. Returns whether any
/// stage is still running.
#[cfg(unix)]
fn reap_exited(stages: &mut [Stage]) -> bool {
    let mut running = false;
    for stage in stages.iter_mut().filter(|s| s.status.is_none()) {
        match stage.child.try_wait() {
            Ok(Some(status)) => {
                stage.status = Some(StageStatus::from(status));
                stage.terminated = true;
            }
            _ => running = true,
        }
    }
    running
}
