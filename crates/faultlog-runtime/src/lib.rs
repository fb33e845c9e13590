//! Fault-log streaming runtime.
//!
//! A run snapshots the matching count and max id, then pages the source
//! newest to oldest in fixed-width id windows on a worker thread. Pages pass
//! through a bounded relay buffer; a periodic drain loop on the tokio runtime
//! forwards them to the sink and reports completion exactly once.

pub mod config;
pub mod controller;
pub mod coordinator;
pub mod cursor;
pub mod drain;
pub mod error;
pub mod relay;
pub mod run;
pub mod source;

pub use config::{PipelineConfig, RetryConfig};
pub use controller::{PipelineController, RunHandle};
pub use coordinator::{ProducerExit, ProducerState};
pub use cursor::{CursorStep, DoneReason, IdRangeCursor};
pub use drain::{DrainLoop, DrainStep};
pub use error::PipelineError;
pub use relay::{PushOutcome, RelayBuffer};
pub use run::{RunId, RunOutcome, RunProgress, RunState};

pub use faultlog_kernel as kernel;
