//! Shell-less process pipelines.
//!
//! ```no_run
//! use pipex::exec::{Executor, Pipeline, ProcessSpec};
//!
//! let pipeline = Pipeline::single(ProcessSpec::new("printf").arg("a\nb\nc\n"))
//!     .pipe(ProcessSpec::new("grep").arg("b"));
//! let result = Executor::new().run_checked(&pipeline)?;
//! assert_eq!(result.stdout, b"b\n");
//! # Ok::<(), pipex::exec::PipelineError>(())
//! ```

pub mod config;
pub mod exec;
pub mod logging;
pub mod probe;
