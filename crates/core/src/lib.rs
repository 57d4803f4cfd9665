pub mod config;
pub mod decision;
mod error;
pub mod gatekeeper;
pub mod journal;
pub mod layout;
pub mod logging;
pub mod manifest;
pub mod materialize;
pub mod mirror;
pub mod pipeline;
pub mod privilege;
pub mod remote;
pub mod session;

pub const APP_NAME: &str = "backupfs";

pub use error::{Error, Result};
pub use pipeline::{PipelineRunner, PipelineStatus, ProcessPipeline, SystemRunner};
pub use remote::{SessionId, SourceSpec};
pub use session::{
    CaptureConfig, CaptureReport, SessionConfig, SessionReport, run_capture, run_local,
    run_remote,
};
