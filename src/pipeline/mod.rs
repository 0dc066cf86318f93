pub mod geometry;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub(crate) mod sequencer;
pub mod types;
pub(crate) mod verification;

pub use progress::ProgressSnapshot;
pub use remote::{
    DetectRequest, OutpaintRequest, RasterPayload, RemoteStageClient, RestorePayload,
    RestoreRequest, TimeoutClient, VerifyRequest,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{PipelineScheduler, RunHandle};
pub use types::{
    BoundingRegion, ContourPoint, ItemOutcome, ItemReport, RestoredPhoto, RunReport, RunStatus,
    ScanItem, StageKind, VerificationNote, NORMALIZED_SPAN,
};
