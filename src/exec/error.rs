use std::io;
use std::time::Duration;

use thiserror::Error;

use super::types::{ExecutionResult, StageStatus};

/// Everything that can go wrong building or running a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    Empty,

    #[error("cannot parse stage `{input}`: {reason}")]
    Parse { input: String, reason: String },

    #[error("failed to create pipe after stage {stage}: {source}")]
    Link {
        stage: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to start stage {stage} (`{program}`): {source}")]
    Start {
        stage: usize,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("stage {stage} (`{program}`) {status}")]
    Exit {
        stage: usize,
        program: String,
        status: StageStatus,
        result: Box<ExecutionResult>,
    },

    #[error("pipeline timed out after {elapsed:?}")]
    TimedOut {
        elapsed: Duration,
        result: Box<ExecutionResult>,
    },

    #[error("pipeline cancelled")]
    Cancelled { result: Box<ExecutionResult> },

    #[error("failed to collect pipeline output: {source}")]
    Io {
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    /// The run that produced this error, when stages got to run at all.
    pub fn partial(&self) -> Option<&ExecutionResult> {
        match self {
            Self::Exit { result, .. } | Self::TimedOut { result, .. } | Self::Cancelled { result } => {
                Some(result.as_ref())
            }
            _ => None,
        }
    }

    /// Combined stderr of the stages, if any was captured.
    pub fn stderr(&self) -> Option<&[u8]> {
        self.partial()
            .map(|r| r.stderr.as_slice())
            .filter(|s| !s.is_empty())
    }

    /// Process exit code a front end should use for this error, following
    /// the usual shell conventions.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exit { status, .. } => match status.code() {
                Some(code) if code != 0 => code,
                _ => 1,
            },
            Self::TimedOut { .. } => 124,
            Self::Cancelled { .. } => 130,
            Self::Start { source, .. } if source.kind() == io::ErrorKind::NotFound => 127,
            Self::Start { .. } => 126,
            Self::Empty | Self::Parse { .. } => 2,
            Self::Link { .. } | Self::Io { .. } => 1,
        }
    }
}
