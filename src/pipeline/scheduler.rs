//! Run orchestration: owns a batch of sequencers, enforces the
//! concurrency bound, aggregates progress and hands the caller a
//! handle for pause/resume/cancel and the final report.

use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::pipeline::progress::{ProgressSnapshot, RunTracker};
use crate::pipeline::remote::RemoteStageClient;
use crate::pipeline::retry::RetryPolicy;
use crate::pipeline::sequencer::{RunControls, StageSequencer};
use crate::pipeline::types::{ItemReport, RunReport, RunStatus, ScanItem, VerificationNote};
use crate::pipeline::verification::{NoteStore, VerificationChannel};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub struct PipelineScheduler {
    settings: PipelineSettings,
    client: Arc<dyn RemoteStageClient>,
}

impl std::fmt::Debug for PipelineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineScheduler")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PipelineScheduler {
    /// Settings are validated here, before any item can start — a bad
    /// configuration is the only run-level failure.
    pub fn new(
        settings: PipelineSettings,
        client: Arc<dyn RemoteStageClient>,
    ) -> Result<Self, PipelineError> {
        settings.validate()?;
        Ok(Self { settings, client })
    }

    /// Launch a run over `items`. Items start in submission order as
    /// concurrency slots free up; the returned handle controls the run
    /// and yields the final report.
    pub fn start(&self, items: Vec<ScanItem>) -> RunHandle {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let tracker = Arc::new(RunTracker::new(
            items.len(),
            self.settings.duration_priors.clone(),
            StageSequencer::default_plan(),
        ));
        let progress = tracker.subscribe();
        let (pause_tx, pause_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let notes = NoteStore::new();
        let (verification, verification_worker) = VerificationChannel::spawn(
            self.client.clone(),
            notes.clone(),
            cancel.clone(),
            self.settings.enable_verification,
        );

        let retry = RetryPolicy::from_settings(&self.settings);
        let sequencers: Vec<StageSequencer> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                StageSequencer::new(
                    index,
                    item,
                    self.client.clone(),
                    self.settings.clone(),
                    retry.clone(),
                    tracker.clone(),
                    verification.clone(),
                    RunControls {
                        pause: pause_rx.clone(),
                        cancel: cancel.clone(),
                    },
                )
            })
            .collect();

        let concurrency = self.settings.concurrency;
        let run_tracker = tracker.clone();
        let run_cancel = cancel.clone();
        let run_notes = notes.clone();
        let join = tokio::spawn(async move {
            if run_tracker.status() == RunStatus::Idle {
                run_tracker.set_status(RunStatus::Running);
            }
            info!(%run_id, concurrency, "restoration run started");

            let mut reports: Vec<ItemReport> =
                stream::iter(sequencers.into_iter().map(|s| s.run()))
                    .buffer_unordered(concurrency)
                    .collect()
                    .await;
            reports.sort_by_key(|r| r.index);

            // Give queued QA calls a chance to land before the report
            // is sealed; a cancelled run aborts them instead.
            drop(verification);
            let _ = verification_worker.await;

            let mut gathered = run_notes.take();
            for report in &mut reports {
                if let Some(item_notes) = gathered.swap_remove(&report.item_id) {
                    report.verification_notes = item_notes;
                }
            }

            let status = if run_cancel.is_cancelled() {
                RunStatus::Cancelled
            } else {
                RunStatus::Completed
            };
            run_tracker.set_status(status);
            let report = RunReport::tally(run_id, status, started_at, reports);
            info!(
                %run_id,
                completed = report.completed,
                failed = report.failed,
                cancelled = report.cancelled,
                "restoration run finished"
            );
            report
        });

        RunHandle {
            run_id,
            pause: pause_tx,
            cancel,
            progress,
            tracker,
            notes,
            join,
        }
    }
}

/// Caller-facing handle for one run. State lives behind this handle,
/// not in globals, so concurrent runs never interfere.
pub struct RunHandle {
    run_id: Uuid,
    pause: watch::Sender<bool>,
    cancel: CancellationToken,
    progress: watch::Receiver<ProgressSnapshot>,
    tracker: Arc<RunTracker>,
    notes: NoteStore,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Stop asking sequencers for new stages. Whatever is in flight
    /// finishes naturally, so partially-received results stay intact.
    pub fn pause(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.pause.send_replace(true);
        self.tracker.set_status(RunStatus::Paused);
        info!(run = %self.run_id, "run paused");
    }

    pub fn resume(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.pause.send_replace(false);
        self.tracker.set_status(RunStatus::Running);
        info!(run = %self.run_id, "run resumed");
    }

    /// Irreversible: aborts in-flight remote calls and marks every
    /// non-terminal item cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
        // Unblock sequencers parked on the pause gate.
        self.pause.send_replace(false);
        self.tracker.set_status(RunStatus::Cancelled);
        info!(run = %self.run_id, "run cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Latest progress event, for pollers.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.borrow().clone()
    }

    /// Progress as a stream, for subscribers.
    pub fn progress_stream(&self) -> WatchStream<ProgressSnapshot> {
        WatchStream::new(self.progress.clone())
    }

    /// QA notes gathered so far for one item; late notes keep showing
    /// up here after the item's stages have already advanced.
    pub fn verification_notes(&self, item_id: Uuid) -> Vec<VerificationNote> {
        self.notes.notes_for(item_id)
    }

    /// Wait for the run to finish and take the final report.
    pub async fn wait(self) -> Result<RunReport, PipelineError> {
        self.join
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))
    }
}
