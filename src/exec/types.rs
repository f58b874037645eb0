use std::fmt;
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::PipelineError;

/// Cooperative cancellation token backed by an `AtomicBool`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One external program and its arguments.
///
/// The engine passes `args` to the program verbatim; nothing is globbed,
/// expanded or redirected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    program: String,
    args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Split a command line into program and arguments using POSIX shell
    /// word rules (quotes and backslashes only).
    pub fn parse(line: &str) -> Result<Self, PipelineError> {
        let mut words = shell_words::split(line)
            .map_err(|e| PipelineError::Parse {
                input: line.to_string(),
                reason: e.to_string(),
            })?
            .into_iter();
        let program = words.next().ok_or_else(|| PipelineError::Parse {
            input: line.to_string(),
            reason: "no program given".into(),
        })?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words = std::iter::once(&self.program).chain(self.args.iter());
        f.write_str(&shell_words::join(words))
    }
}

/// An ordered, non-empty chain of stages. Stage `i`'s stdout feeds stage
/// `i + 1`'s stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pipeline {
    stages: Vec<ProcessSpec>,
}

impl Pipeline {
    pub fn new(stages: Vec<ProcessSpec>) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        Ok(Self { stages })
    }

    /// A pipeline of exactly one stage.
    pub fn single(spec: ProcessSpec) -> Self {
        Self { stages: vec![spec] }
    }

    /// Append a stage that reads the current last stage's output.
    pub fn pipe(mut self, spec: ProcessSpec) -> Self {
        self.stages.push(spec);
        self
    }

    /// Build a pipeline from one command line per stage.
    pub fn parse<I, S>(lines: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let stages = lines
            .into_iter()
            .map(|line| ProcessSpec::parse(line.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(stages)
    }

    pub fn stages(&self) -> &[ProcessSpec] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{stage}")?;
        }
        Ok(())
    }
}

/// How a stage ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StageStatus {
    Exited { code: i32 },
    Signaled { signal: i32 },
    Unknown,
}

impl StageStatus {
    pub fn success(self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }

    pub fn code(self) -> Option<i32> {
        match self {
            Self::Exited { code } => Some(code),
            _ => None,
        }
    }
}

impl From<ExitStatus> for StageStatus {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited { code };
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled { signal };
            }
        }
        Self::Unknown
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with code {code}"),
            Self::Signaled { signal } => write!(f, "killed by signal {signal}"),
            Self::Unknown => f.write_str("ended with unknown status"),
        }
    }
}

/// Final state of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub index: usize,
    pub program: String,
    pub status: StageStatus,
    /// The executor stopped this stage (deadline, cancellation or fail-fast).
    pub terminated: bool,
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionResult {
    /// Final stage output. Empty when the run wrote to a caller sink.
    #[serde(serialize_with = "lossy_text")]
    pub stdout: Vec<u8>,
    /// Combined stderr of every stage, interleaved at chunk granularity.
    #[serde(serialize_with = "lossy_text")]
    pub stderr: Vec<u8>,
    pub stages: Vec<StageReport>,
    #[serde(serialize_with = "millis")]
    pub elapsed: Duration,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.stages.iter().all(|s| s.status.success())
    }

    pub fn stage(&self, index: usize) -> Option<&StageReport> {
        self.stages.get(index)
    }

    /// Lowest-index stage that did not exit cleanly.
    pub fn first_failure(&self) -> Option<&StageReport> {
        self.stages.iter().find(|s| !s.status.success())
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Turn an unsuccessful run into the matching error, keeping the
    /// result attached to it.
    pub fn check(self) -> Result<Self, PipelineError> {
        if self.timed_out {
            return Err(PipelineError::TimedOut {
                elapsed: self.elapsed,
                result: Box::new(self),
            });
        }
        if self.cancelled {
            return Err(PipelineError::Cancelled {
                result: Box::new(self),
            });
        }
        match self.first_failure() {
            Some(failed) => Err(PipelineError::Exit {
                stage: failed.index,
                program: failed.program.clone(),
                status: failed.status,
                result: Box::new(self),
            }),
            None => Ok(self),
        }
    }
}

fn lossy_text<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

fn millis<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(elapsed.as_millis() as u64)
}
