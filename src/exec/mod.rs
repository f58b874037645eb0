// Pipeline execution: stage wiring, supervision, deadlines and cancellation.

mod error;
pub mod run;
mod types;

pub use error::PipelineError;
pub use run::Executor;
pub use types::{
    CancelToken, ExecutionResult, Pipeline, ProcessSpec, StageReport, StageStatus,
};
