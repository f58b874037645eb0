//! Status probes built on shell-less pipelines.
//!
//! Each probe runs one small pipeline and reduces its output to a single
//! value. A `grep` stage that matches nothing exits with code 1; the probes
//! read that as "not found" rather than as a failure. Any other failure is
//! returned to the caller.

mod commands;

pub use commands::{ip_address_pipeline, kill_pipeline, process_lookup_pipeline, which_pipeline};

use crate::exec::{ExecutionResult, Executor, Pipeline, PipelineError, StageStatus};

/// Flatten captured output to one line: every newline is removed, then
/// surrounding whitespace is trimmed.
pub fn tidy_output(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).replace('\n', "").trim().to_string()
}

/// Address of `interface`, or `None` if it has none.
pub fn current_ip(executor: &Executor, interface: &str) -> Result<Option<String>, PipelineError> {
    lookup(executor, &ip_address_pipeline(interface))
}

/// Pid of the first process whose command name is `name`.
pub fn find_process(executor: &Executor, name: &str) -> Result<Option<u32>, PipelineError> {
    match lookup(executor, &process_lookup_pipeline(name))? {
        Some(text) => text.parse().map(Some).map_err(|_| PipelineError::Parse {
            input: text,
            reason: "process lookup did not print a pid".into(),
        }),
        None => Ok(None),
    }
}

pub fn is_process_running(executor: &Executor, name: &str) -> Result<bool, PipelineError> {
    Ok(find_process(executor, name)?.is_some())
}

/// Send SIGTERM to the first process named `name`. Returns `false` when no
/// such process exists.
pub fn kill_process(executor: &Executor, name: &str) -> Result<bool, PipelineError> {
    let Some(pid) = find_process(executor, name)? else {
        return Ok(false);
    };
    executor.run_checked(&kill_pipeline(pid))?;
    tracing::info!(name, pid, "sent SIGTERM");
    Ok(true)
}

/// Whether `program` resolves on `PATH`.
pub fn is_installed(executor: &Executor, program: &str) -> Result<bool, PipelineError> {
    let result = executor.run(&which_pipeline(program))?;
    if result.success() {
        return Ok(!tidy_output(&result.stdout).is_empty());
    }
    if exited_with_one(&result) {
        return Ok(false);
    }
    result.check().map(|_| false)
}

/// Run `pipeline` and return its tidied output, or `None` when the output
/// is empty or a `grep` stage matched nothing.
pub(crate) fn lookup(executor: &Executor, pipeline: &Pipeline) -> Result<Option<String>, PipelineError> {
    let result = executor.run(pipeline)?;
    if result.success() {
        let text = tidy_output(&result.stdout);
        return Ok((!text.is_empty()).then_some(text));
    }
    if exited_with_one(&result) && result.first_failure().is_some_and(|s| s.program == "grep") {
        return Ok(None);
    }
    result.check().map(|_| None)
}

/// The first failing stage simply exited with code 1, and nothing was
/// interrupted.
fn exited_with_one(result: &ExecutionResult) -> bool {
    !result.timed_out
        && !result.cancelled
        && result
            .first_failure()
            .is_some_and(|s| s.status == StageStatus::Exited { code: 1 })
}
