//! Boundary to the remote AI endpoints. One call per (stage, item)
//! attempt; a call resolves with a typed payload or fails with a typed
//! error and never retries internally — retry policy belongs to the
//! sequencer. The transport behind an implementation (HTTP, IPC) is
//! irrelevant here.

use crate::config::StageTimeouts;
use crate::error::RemoteError;
use crate::pipeline::types::{BoundingRegion, StageKind, VerificationNote};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct DetectRequest<'a> {
    pub scan: &'a [u8],
    pub mime: &'a str,
}

#[derive(Debug, Clone)]
pub struct OutpaintRequest<'a> {
    pub crop: &'a [u8],
    pub mime: &'a str,
    /// Photo contour in crop-pixel coordinates; everything outside it
    /// is to be synthesized.
    pub contour: &'a [(u32, u32)],
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest<'a> {
    pub raster: &'a [u8],
    pub mime: &'a str,
}

/// Verification payloads own their rasters: they cross the
/// fire-and-forget channel and outlive the stage that produced them.
#[derive(Debug, Clone)]
pub enum VerifyRequest {
    Detection {
        scan: Arc<Vec<u8>>,
        mime: String,
        regions: Vec<BoundingRegion>,
    },
    Crop {
        crop: Vec<u8>,
        mime: String,
        index: usize,
    },
    Restoration {
        original: Vec<u8>,
        restored: Vec<u8>,
        mime: String,
        index: usize,
    },
}

impl VerifyRequest {
    /// The primary stage this QA call refers to.
    pub fn stage(&self) -> StageKind {
        match self {
            VerifyRequest::Detection { .. } => StageKind::Detect,
            VerifyRequest::Crop { .. } => StageKind::Crop,
            VerifyRequest::Restoration { .. } => StageKind::Restore,
        }
    }

    pub fn crop_index(&self) -> Option<usize> {
        match self {
            VerifyRequest::Detection { .. } => None,
            VerifyRequest::Crop { index, .. } | VerifyRequest::Restoration { index, .. } => {
                Some(*index)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RasterPayload {
    pub bytes: Vec<u8>,
    pub mime: String,
}

#[derive(Debug, Clone)]
pub struct RestorePayload {
    pub raster: RasterPayload,
    pub improvements: Vec<String>,
    pub provider: String,
    /// Extra provider-specific fields passed through to the report.
    pub provider_metadata: Option<serde_json::Value>,
}

#[async_trait]
pub trait RemoteStageClient: Send + Sync {
    async fn detect(
        &self,
        request: DetectRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Vec<BoundingRegion>, RemoteError>;

    async fn outpaint(
        &self,
        request: OutpaintRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<RasterPayload, RemoteError>;

    async fn restore(
        &self,
        request: RestoreRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<RestorePayload, RemoteError>;

    async fn verify(
        &self,
        request: VerifyRequest,
        cancel: CancellationToken,
    ) -> Result<VerificationNote, RemoteError>;
}

/// Decorator enforcing operation-specific deadlines on an inner
/// client, so a hung transport surfaces as a transient failure the
/// retry policy can act on.
pub struct TimeoutClient<C> {
    inner: C,
    timeouts: StageTimeouts,
}

impl<C> TimeoutClient<C> {
    pub fn new(inner: C, timeouts: StageTimeouts) -> Self {
        Self { inner, timeouts }
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    async fn bounded<T>(
        &self,
        stage: StageKind,
        call: impl Future<Output = Result<T, RemoteError>> + Send,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(self.timeouts.for_stage(stage), call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transient(format!(
                "{stage} call exceeded its {}s deadline",
                self.timeouts.for_stage(stage).as_secs()
            ))),
        }
    }
}

#[async_trait]
impl<C> RemoteStageClient for TimeoutClient<C>
where
    C: RemoteStageClient,
{
    async fn detect(
        &self,
        request: DetectRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Vec<BoundingRegion>, RemoteError> {
        self.bounded(StageKind::Detect, self.inner.detect(request, cancel))
            .await
    }

    async fn outpaint(
        &self,
        request: OutpaintRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<RasterPayload, RemoteError> {
        self.bounded(StageKind::Outpaint, self.inner.outpaint(request, cancel))
            .await
    }

    async fn restore(
        &self,
        request: RestoreRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<RestorePayload, RemoteError> {
        self.bounded(StageKind::Restore, self.inner.restore(request, cancel))
            .await
    }

    async fn verify(
        &self,
        request: VerifyRequest,
        cancel: CancellationToken,
    ) -> Result<VerificationNote, RemoteError> {
        self.bounded(StageKind::Verify, self.inner.verify(request, cancel))
            .await
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::pipeline::types::VerificationStatus;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted in-memory stand-in for the remote endpoints. Failure
    /// programs are consumed per call; counters record how many
    /// attempts each stage actually saw.
    #[derive(Default)]
    pub struct MockStageClient {
        state: Mutex<MockState>,
    }

    #[derive(Default)]
    struct MockState {
        regions: Vec<BoundingRegion>,
        programs: indexmap::IndexMap<StageKind, VecDeque<Option<RemoteError>>>,
        always_fail: indexmap::IndexMap<StageKind, RemoteError>,
        delays: indexmap::IndexMap<StageKind, Duration>,
        calls: indexmap::IndexMap<StageKind, u32>,
    }

    impl MockStageClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_regions(self, regions: Vec<BoundingRegion>) -> Self {
            self.state.lock().unwrap().regions = regions;
            self
        }

        /// Queue per-call outcomes for a stage; `Some(err)` fails that
        /// call, `None` lets it succeed. Calls past the end of the
        /// program succeed.
        pub fn program(self, stage: StageKind, outcomes: Vec<Option<RemoteError>>) -> Self {
            self.state
                .lock()
                .unwrap()
                .programs
                .insert(stage, outcomes.into());
            self
        }

        pub fn always_fail(self, stage: StageKind, error: RemoteError) -> Self {
            self.state.lock().unwrap().always_fail.insert(stage, error);
            self
        }

        pub fn with_delay(self, stage: StageKind, delay: Duration) -> Self {
            self.state.lock().unwrap().delays.insert(stage, delay);
            self
        }

        pub fn calls(&self, stage: StageKind) -> u32 {
            self.state
                .lock()
                .unwrap()
                .calls
                .get(&stage)
                .copied()
                .unwrap_or(0)
        }

        /// Record the call, wait out any configured delay (honoring
        /// cancellation) and pop the next scripted outcome.
        async fn enter(
            &self,
            stage: StageKind,
            cancel: &CancellationToken,
        ) -> Result<(), RemoteError> {
            let (delay, outcome) = {
                let mut state = self.state.lock().unwrap();
                *state.calls.entry(stage).or_insert(0) += 1;
                let scripted = state
                    .programs
                    .get_mut(&stage)
                    .and_then(|p| p.pop_front())
                    .flatten();
                let outcome = scripted.or_else(|| state.always_fail.get(&stage).cloned());
                (state.delays.get(&stage).copied(), outcome)
            };
            if let Some(delay) = delay {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RemoteError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(RemoteError::Cancelled);
            }
            match outcome {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl RemoteStageClient for MockStageClient {
        async fn detect(
            &self,
            _request: DetectRequest<'_>,
            cancel: CancellationToken,
        ) -> Result<Vec<BoundingRegion>, RemoteError> {
            self.enter(StageKind::Detect, &cancel).await?;
            Ok(self.state.lock().unwrap().regions.clone())
        }

        async fn outpaint(
            &self,
            request: OutpaintRequest<'_>,
            cancel: CancellationToken,
        ) -> Result<RasterPayload, RemoteError> {
            self.enter(StageKind::Outpaint, &cancel).await?;
            Ok(RasterPayload {
                bytes: request.crop.to_vec(),
                mime: request.mime.to_string(),
            })
        }

        async fn restore(
            &self,
            request: RestoreRequest<'_>,
            cancel: CancellationToken,
        ) -> Result<RestorePayload, RemoteError> {
            self.enter(StageKind::Restore, &cancel).await?;
            Ok(RestorePayload {
                raster: RasterPayload {
                    bytes: request.raster.to_vec(),
                    mime: request.mime.to_string(),
                },
                improvements: vec![
                    "Noise and grain removed".to_string(),
                    "Color restoration applied".to_string(),
                ],
                provider: "mock".to_string(),
                provider_metadata: None,
            })
        }

        async fn verify(
            &self,
            request: VerifyRequest,
            cancel: CancellationToken,
        ) -> Result<VerificationNote, RemoteError> {
            self.enter(StageKind::Verify, &cancel).await?;
            let mut note =
                VerificationNote::new(request.stage(), VerificationStatus::Pass, 95);
            note.crop_index = request.crop_index();
            Ok(note)
        }
    }

    #[tokio::test]
    async fn test_timeout_client_maps_deadline_to_transient() {
        let slow = MockStageClient::new().with_delay(StageKind::Detect, Duration::from_secs(60));
        let timeouts = StageTimeouts {
            detect_secs: 0,
            ..StageTimeouts::default()
        };
        let client = TimeoutClient::new(slow, timeouts);
        let err = client
            .detect(
                DetectRequest {
                    scan: &[],
                    mime: "image/png",
                },
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Transient(_)));
    }

    #[tokio::test]
    async fn test_mock_program_consumed_per_call() {
        let client = MockStageClient::new().program(
            StageKind::Restore,
            vec![Some(RemoteError::Transient("flaky".to_string())), None],
        );
        let request = RestoreRequest {
            raster: &[1, 2, 3],
            mime: "image/png",
        };
        assert!(client
            .restore(request.clone(), CancellationToken::new())
            .await
            .is_err());
        assert!(client
            .restore(request, CancellationToken::new())
            .await
            .is_ok());
        assert_eq!(client.calls(StageKind::Restore), 2);
    }
}
