pub mod config;
pub mod error;
pub mod pipeline;

pub use config::{PipelineSettings, StageDurationPriors, StageTimeouts};
pub use error::{PipelineError, RemoteError, StageError};

pub use pipeline::{
    BoundingRegion, ContourPoint, ItemOutcome, ItemReport, PipelineScheduler, ProgressSnapshot,
    RemoteStageClient, RestoredPhoto, RunHandle, RunReport, RunStatus, ScanItem, StageKind,
    TimeoutClient, VerificationNote,
};
