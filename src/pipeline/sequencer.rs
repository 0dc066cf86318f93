//! Per-item state machine: drives one scan through its ordered stage
//! list, applying the retry policy and dispatching fire-and-forget
//! verification. Each sequencer exclusively owns its item for the
//! run's lifetime; a failure here never touches sibling items.

use crate::config::PipelineSettings;
use crate::error::{RemoteError, StageError};
use crate::pipeline::geometry;
use crate::pipeline::progress::RunTracker;
use crate::pipeline::remote::{
    DetectRequest, OutpaintRequest, RemoteStageClient, RestoreRequest, VerifyRequest,
};
use crate::pipeline::retry::{RetryDecision, RetryPolicy};
use crate::pipeline::types::{
    BoundingRegion, ItemOutcome, ItemReport, RestoredPhoto, ScanItem, StageKind,
};
use crate::pipeline::verification::VerificationHandle;
use image::GenericImageView;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pause gate and cancellation token shared by every sequencer of a
/// run. Pausing blocks the next stage start; cancellation also aborts
/// whatever is in flight.
#[derive(Clone)]
pub(crate) struct RunControls {
    pub pause: watch::Receiver<bool>,
    pub cancel: CancellationToken,
}

impl RunControls {
    /// Wait until the run is neither paused nor cancelled. A dropped
    /// pause gate (abandoned handle) counts as active: nobody is left
    /// to resume, so the run finishes on its own.
    pub async fn wait_until_active(&mut self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            return Err(RemoteError::Cancelled.into());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RemoteError::Cancelled.into()),
            res = self.pause.wait_for(|paused| !*paused) => {
                let _ = res;
                Ok(())
            }
        }
    }
}

/// One cropped sub-photo moving through outpaint and restore.
struct CropWork {
    region: BoundingRegion,
    bytes: Vec<u8>,
    width: u32,
    height: u32,
    contour_px: Option<Vec<(u32, u32)>>,
    filled: bool,
    restored: Option<RestoredPhoto>,
}

#[derive(Default)]
struct ItemWork {
    regions: Vec<BoundingRegion>,
    crops: Vec<CropWork>,
}

pub(crate) struct StageSequencer {
    index: usize,
    item: ScanItem,
    client: Arc<dyn RemoteStageClient>,
    settings: PipelineSettings,
    retry: RetryPolicy,
    tracker: Arc<RunTracker>,
    verification: VerificationHandle,
    controls: RunControls,
}

impl StageSequencer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        item: ScanItem,
        client: Arc<dyn RemoteStageClient>,
        settings: PipelineSettings,
        retry: RetryPolicy,
        tracker: Arc<RunTracker>,
        verification: VerificationHandle,
        controls: RunControls,
    ) -> Self {
        Self {
            index,
            item,
            client,
            settings,
            retry,
            tracker,
            verification,
            controls,
        }
    }

    /// Stage plan before detection has revealed whether outpainting
    /// participates.
    pub fn default_plan() -> Vec<StageKind> {
        vec![StageKind::Detect, StageKind::Crop, StageKind::Restore]
    }

    pub async fn run(mut self) -> ItemReport {
        let started = Instant::now();
        info!(item = %self.item.id, index = self.index, "item entering pipeline");

        let mut work = ItemWork::default();
        let mut plan = Self::default_plan();
        let mut pos = 0;
        while pos < plan.len() {
            let stage = plan[pos];
            if self.controls.wait_until_active().await.is_err() {
                return self.finish(started, ItemOutcome::Cancelled, work);
            }
            match self.run_stage(stage, &mut work).await {
                Ok(()) => {
                    if stage == StageKind::Detect && self.outpaint_applies(&work) {
                        plan.insert(2, StageKind::Outpaint);
                        self.tracker.set_stage_plan(self.index, plan.clone());
                    }
                    pos += 1;
                }
                Err(err) if err.is_cancelled() => {
                    return self.finish(started, ItemOutcome::Cancelled, work);
                }
                Err(err) => {
                    warn!(item = %self.item.id, %stage, %err, "item failed");
                    let outcome = ItemOutcome::Failed {
                        stage,
                        reason: err.to_string(),
                    };
                    return self.finish(started, outcome, work);
                }
            }
        }
        info!(item = %self.item.id, photos = work.crops.len(), "item done");
        self.finish(started, ItemOutcome::Done, work)
    }

    fn finish(&self, started: Instant, outcome: ItemOutcome, work: ItemWork) -> ItemReport {
        self.tracker.item_finished(self.index, &outcome);
        let photos = work.crops.into_iter().filter_map(|c| c.restored).collect();
        ItemReport {
            index: self.index,
            item_id: self.item.id,
            file_name: self.item.file_name.clone(),
            outcome,
            photos,
            // Merged from the note store once the run seals its report.
            verification_notes: Vec::new(),
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Execute one stage with its retry loop. The attempt counter
    /// resets on entry and is discarded on exit.
    async fn run_stage(&mut self, stage: StageKind, work: &mut ItemWork) -> Result<(), StageError> {
        self.tracker.stage_started(self.index, stage);
        let entered = Instant::now();
        let mut attempt: u32 = 1;
        loop {
            match self.execute(stage, work).await {
                Ok(()) => {
                    self.tracker
                        .stage_completed(self.index, stage, entered.elapsed());
                    self.dispatch_verification(stage, work);
                    return Ok(());
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => match self.retry.evaluate(stage, attempt) {
                    RetryDecision::RetryAfter(delay) => {
                        warn!(
                            item = %self.item.id, %stage, attempt, ?delay, %err,
                            "stage attempt failed, backing off"
                        );
                        tokio::select! {
                            _ = self.controls.cancel.cancelled() => {
                                return Err(RemoteError::Cancelled.into());
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt += 1;
                    }
                    RetryDecision::GiveUp => return Err(err),
                },
            }
        }
    }

    async fn execute(&mut self, stage: StageKind, work: &mut ItemWork) -> Result<(), StageError> {
        match stage {
            StageKind::Detect => self.detect(work).await,
            StageKind::Crop => self.crop(work),
            StageKind::Outpaint => self.outpaint(work).await,
            StageKind::Restore => self.restore(work).await,
            // Verification runs on its own channel, never as a
            // primary stage.
            StageKind::Verify => Ok(()),
        }
    }

    async fn detect(&mut self, work: &mut ItemWork) -> Result<(), StageError> {
        let request = DetectRequest {
            scan: &self.item.bytes,
            mime: &self.item.mime,
        };
        let mut regions = self
            .client
            .detect(request, self.controls.cancel.clone())
            .await?;

        if regions.is_empty() {
            info!(item = %self.item.id, "detector returned no regions, assuming one photo fills the scan");
            regions.push(BoundingRegion::full_scan());
        }
        for region in &regions {
            region.validate().map_err(|reason| {
                StageError::Remote(RemoteError::Malformed(format!("detector region: {reason}")))
            })?;
        }
        debug!(item = %self.item.id, count = regions.len(), "photos detected");
        self.item.regions = regions.clone();
        work.regions = regions;
        Ok(())
    }

    /// The only local stage: pure geometry, synchronous, cheap enough
    /// to redo wholesale on the rare retry after a raster hiccup.
    fn crop(&mut self, work: &mut ItemWork) -> Result<(), StageError> {
        let scan = geometry::decode_scan(&self.item.bytes)?;
        let regions = geometry::resolve_overlaps(work.regions.clone());
        work.crops.clear();
        for (index, region) in regions.iter().enumerate() {
            let geometry::CropOutput {
                image,
                width,
                height,
                contour_px,
            } = geometry::crop(&scan, region, self.settings.padding_fraction)?;
            // Contoured crops keep their exact frame so the fill
            // polygon stays aligned; everything else loses leftover
            // scanner-bed margins.
            let (image, width, height) = if contour_px.is_some() {
                (image, width, height)
            } else {
                let trimmed = geometry::auto_trim_dark_edges(&image);
                let (w, h) = trimmed.dimensions();
                (trimmed, w, h)
            };
            let bytes = geometry::encode_raster(&image, &self.item.mime)?;
            debug!(item = %self.item.id, index, width, height, "cropped photo");
            work.crops.push(CropWork {
                region: region.clone(),
                bytes,
                width,
                height,
                contour_px,
                filled: false,
                restored: None,
            });
        }
        Ok(())
    }

    async fn outpaint(&mut self, work: &mut ItemWork) -> Result<(), StageError> {
        let pending: Vec<usize> = work
            .crops
            .iter()
            .enumerate()
            .filter(|(_, c)| c.region.wants_outpaint() && !c.filled)
            .map(|(i, _)| i)
            .collect();
        let total = pending.len().max(1);
        for (done, idx) in pending.into_iter().enumerate() {
            let crop = &work.crops[idx];
            let request = OutpaintRequest {
                crop: &crop.bytes,
                mime: &self.item.mime,
                contour: crop.contour_px.as_deref().unwrap_or(&[]),
                width: crop.width,
                height: crop.height,
            };
            let payload = self
                .client
                .outpaint(request, self.controls.cancel.clone())
                .await?;
            let crop = &mut work.crops[idx];
            crop.bytes = payload.bytes;
            crop.filled = true;
            self.tracker
                .set_sub_progress(self.index, (done + 1) as f64 / total as f64);
        }
        Ok(())
    }

    async fn restore(&mut self, work: &mut ItemWork) -> Result<(), StageError> {
        let total = work.crops.len().max(1);
        for idx in 0..work.crops.len() {
            if work.crops[idx].restored.is_some() {
                // A retried stage keeps the photos it already finished.
                continue;
            }
            let request = RestoreRequest {
                raster: &work.crops[idx].bytes,
                mime: &self.item.mime,
            };
            let payload = self
                .client
                .restore(request, self.controls.cancel.clone())
                .await?;
            // A raster the provider sent back but we cannot decode is a
            // malformed response, not a transient failure.
            let decoded = image::load_from_memory(&payload.raster.bytes).map_err(|e| {
                StageError::Remote(RemoteError::Malformed(format!("restored raster: {e}")))
            })?;
            let (width, height) = decoded.dimensions();
            let crop = &mut work.crops[idx];
            crop.restored = Some(RestoredPhoto {
                id: Uuid::new_v4(),
                index: idx,
                bytes: payload.raster.bytes,
                mime: payload.raster.mime,
                width,
                height,
                improvements: payload.improvements,
                provider: payload.provider,
                source_region: crop.region.clone(),
            });
            self.tracker
                .set_sub_progress(self.index, (idx + 1) as f64 / total as f64);
        }
        Ok(())
    }

    fn outpaint_applies(&self, work: &ItemWork) -> bool {
        self.settings.enable_outpaint && work.regions.iter().any(|r| r.wants_outpaint())
    }

    /// Queue QA side-calls for a just-succeeded stage. Never awaited;
    /// the notes land in the run's note store whenever they land.
    fn dispatch_verification(&self, stage: StageKind, work: &ItemWork) {
        match stage {
            StageKind::Detect => {
                self.verification.dispatch(
                    self.item.id,
                    VerifyRequest::Detection {
                        scan: Arc::clone(&self.item.bytes),
                        mime: self.item.mime.clone(),
                        regions: work.regions.clone(),
                    },
                );
            }
            StageKind::Crop => {
                for (index, crop) in work.crops.iter().enumerate() {
                    self.verification.dispatch(
                        self.item.id,
                        VerifyRequest::Crop {
                            crop: crop.bytes.clone(),
                            mime: self.item.mime.clone(),
                            index,
                        },
                    );
                }
            }
            StageKind::Restore => {
                for (index, crop) in work.crops.iter().enumerate() {
                    if let Some(photo) = &crop.restored {
                        self.verification.dispatch(
                            self.item.id,
                            VerifyRequest::Restoration {
                                original: crop.bytes.clone(),
                                restored: photo.bytes.clone(),
                                mime: self.item.mime.clone(),
                                index,
                            },
                        );
                    }
                }
            }
            StageKind::Outpaint | StageKind::Verify => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::remote::mock::MockStageClient;
    use crate::pipeline::types::ContourPoint;
    use crate::pipeline::verification::{NoteStore, VerificationChannel};
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn png_scan() -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(200, 160, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 120, 255])
        }));
        geometry::encode_raster(&img, "image/png").expect("encode fixture")
    }

    fn plain_region() -> BoundingRegion {
        BoundingRegion {
            x: 100,
            y: 100,
            width: 300,
            height: 300,
            confidence: 0.9,
            rotation_deg: 0.0,
            contour: None,
            needs_fill: false,
            label: Some("photo 1".to_string()),
        }
    }

    fn fill_region() -> BoundingRegion {
        BoundingRegion {
            needs_fill: true,
            contour: Some(vec![
                ContourPoint { x: 100, y: 100 },
                ContourPoint { x: 400, y: 120 },
                ContourPoint { x: 380, y: 400 },
                ContourPoint { x: 110, y: 390 },
            ]),
            ..plain_region()
        }
    }

    fn fast_settings() -> PipelineSettings {
        PipelineSettings {
            base_delay_ms: 1,
            max_delay_ms: 2,
            ..PipelineSettings::default()
        }
    }

    struct Harness {
        client: Arc<MockStageClient>,
        tracker: Arc<RunTracker>,
        notes: NoteStore,
        verification: VerificationHandle,
        worker: JoinHandle<()>,
        cancel: CancellationToken,
        pause_tx: watch::Sender<bool>,
    }

    impl Harness {
        fn new(client: MockStageClient, settings: &PipelineSettings) -> Self {
            let client = Arc::new(client);
            let tracker = Arc::new(RunTracker::new(
                1,
                settings.duration_priors.clone(),
                StageSequencer::default_plan(),
            ));
            let notes = NoteStore::new();
            let cancel = CancellationToken::new();
            let (verification, worker) = VerificationChannel::spawn(
                client.clone(),
                notes.clone(),
                cancel.clone(),
                settings.enable_verification,
            );
            let (pause_tx, _) = watch::channel(false);
            Self {
                client,
                tracker,
                notes,
                verification,
                worker,
                cancel,
                pause_tx,
            }
        }

        fn sequencer(&self, settings: PipelineSettings) -> StageSequencer {
            let item = ScanItem::new(png_scan(), "image/png");
            StageSequencer::new(
                0,
                item,
                self.client.clone(),
                settings.clone(),
                RetryPolicy::from_settings(&settings),
                self.tracker.clone(),
                self.verification.clone(),
                RunControls {
                    pause: self.pause_tx.subscribe(),
                    cancel: self.cancel.clone(),
                },
            )
        }

        /// Drop our dispatch handle and wait for the worker to drain
        /// whatever QA calls are still queued.
        async fn drain_verification(self) -> NoteStore {
            drop(self.verification);
            let _ = self.worker.await;
            self.notes
        }
    }

    #[tokio::test]
    async fn test_happy_path_restores_each_detected_photo() {
        let settings = fast_settings();
        let client =
            MockStageClient::new().with_regions(vec![plain_region(), plain_region()]);
        let harness = Harness::new(client, &settings);
        let report = harness.sequencer(settings).run().await;

        assert_eq!(report.outcome, ItemOutcome::Done);
        assert_eq!(report.photos.len(), 2);
        assert!(report.photos.iter().all(|p| !p.improvements.is_empty()));
        assert_eq!(harness.client.calls(StageKind::Restore), 2);
        assert_eq!(harness.client.calls(StageKind::Outpaint), 0);
    }

    #[tokio::test]
    async fn test_always_failing_restore_exhausts_exact_budget() {
        let settings = fast_settings();
        let client = MockStageClient::new()
            .with_regions(vec![plain_region()])
            .always_fail(
                StageKind::Restore,
                RemoteError::Transient("provider unavailable".to_string()),
            );
        let harness = Harness::new(client, &settings);
        let report = harness.sequencer(settings.clone()).run().await;

        assert!(matches!(
            report.outcome,
            ItemOutcome::Failed {
                stage: StageKind::Restore,
                ..
            }
        ));
        // Max attempts, no more, no fewer.
        assert_eq!(harness.client.calls(StageKind::Restore), settings.max_attempts);
        assert!(report.photos.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_detection_fails_without_retry() {
        let settings = fast_settings();
        let client = MockStageClient::new().always_fail(
            StageKind::Detect,
            RemoteError::Malformed("not json".to_string()),
        );
        let harness = Harness::new(client, &settings);
        let report = harness.sequencer(settings).run().await;

        assert!(matches!(
            report.outcome,
            ItemOutcome::Failed {
                stage: StageKind::Detect,
                ..
            }
        ));
        assert_eq!(harness.client.calls(StageKind::Detect), 1);
    }

    #[tokio::test]
    async fn test_empty_detection_falls_back_to_full_scan() {
        let settings = fast_settings();
        let harness = Harness::new(MockStageClient::new(), &settings);
        let report = harness.sequencer(settings).run().await;

        assert_eq!(report.outcome, ItemOutcome::Done);
        assert_eq!(report.photos.len(), 1);
        assert_eq!(report.photos[0].source_region, BoundingRegion::full_scan());
    }

    #[tokio::test]
    async fn test_outpaint_runs_only_for_flagged_regions() {
        let settings = fast_settings();
        let client =
            MockStageClient::new().with_regions(vec![plain_region(), fill_region()]);
        let harness = Harness::new(client, &settings);
        let report = harness.sequencer(settings).run().await;

        assert_eq!(report.outcome, ItemOutcome::Done);
        assert_eq!(harness.client.calls(StageKind::Outpaint), 1);
    }

    #[tokio::test]
    async fn test_outpaint_disabled_in_settings_is_skipped() {
        let settings = PipelineSettings {
            enable_outpaint: false,
            ..fast_settings()
        };
        let client = MockStageClient::new().with_regions(vec![fill_region()]);
        let harness = Harness::new(client, &settings);
        let report = harness.sequencer(settings).run().await;

        assert_eq!(report.outcome, ItemOutcome::Done);
        assert_eq!(harness.client.calls(StageKind::Outpaint), 0);
    }

    #[tokio::test]
    async fn test_retried_restore_keeps_already_finished_photos() {
        let settings = fast_settings();
        let client = MockStageClient::new()
            .with_regions(vec![plain_region(), plain_region()])
            .program(
                StageKind::Restore,
                vec![
                    None,
                    Some(RemoteError::Transient("blip".to_string())),
                    None,
                ],
            );
        let harness = Harness::new(client, &settings);
        let report = harness.sequencer(settings).run().await;

        assert_eq!(report.outcome, ItemOutcome::Done);
        assert_eq!(report.photos.len(), 2);
        // First photo restored once, second took the retry: three
        // calls, not four.
        assert_eq!(harness.client.calls(StageKind::Restore), 3);
    }

    #[tokio::test]
    async fn test_failed_verification_leaves_item_done_with_no_note() {
        let settings = fast_settings();
        let client = MockStageClient::new()
            .with_regions(vec![plain_region()])
            .always_fail(
                StageKind::Verify,
                RemoteError::Transient("qa offline".to_string()),
            );
        let harness = Harness::new(client, &settings);
        let report = harness.sequencer(settings).run().await;

        assert_eq!(report.outcome, ItemOutcome::Done);
        let item_id = report.item_id;
        let notes = harness.drain_verification().await;
        assert!(notes.notes_for(item_id).is_empty());
    }

    #[tokio::test]
    async fn test_successful_stages_each_dispatch_verification() {
        let settings = fast_settings();
        let client = MockStageClient::new().with_regions(vec![plain_region()]);
        let harness = Harness::new(client, &settings);
        let report = harness.sequencer(settings).run().await;

        assert_eq!(report.outcome, ItemOutcome::Done);
        let item_id = report.item_id;
        let client = harness.client.clone();
        let notes = harness.drain_verification().await;
        // Detection, one crop, one restoration.
        assert_eq!(client.calls(StageKind::Verify), 3);
        assert_eq!(notes.notes_for(item_id).len(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_mid_stage_yields_cancelled_outcome() {
        let settings = fast_settings();
        let client = MockStageClient::new()
            .with_regions(vec![plain_region()])
            .with_delay(StageKind::Restore, Duration::from_secs(30));
        let harness = Harness::new(client, &settings);
        let sequencer = harness.sequencer(settings);
        let cancel = harness.cancel.clone();

        let task = tokio::spawn(sequencer.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("cancellation must unblock the sequencer")
            .expect("task join");
        assert_eq!(report.outcome, ItemOutcome::Cancelled);
    }
}
