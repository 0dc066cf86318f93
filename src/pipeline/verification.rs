//! Fire-and-forget QA side-channel. Sequencers drop a job in the
//! queue right after a stage succeeds and move on; a dedicated worker
//! performs the verify calls outside the run's concurrency bound.
//! Outcomes are advisory: failures are logged and swallowed, never
//! surfaced as item failures.

use crate::error::RemoteError;
use crate::pipeline::remote::{RemoteStageClient, VerifyRequest};
use crate::pipeline::types::VerificationNote;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) struct VerificationJob {
    pub item_id: Uuid,
    pub request: VerifyRequest,
}

/// Notes gathered so far, keyed by item. Late notes keep attaching
/// here after the pipeline has moved past the stage they describe.
#[derive(Clone, Default)]
pub(crate) struct NoteStore {
    notes: Arc<Mutex<IndexMap<Uuid, Vec<VerificationNote>>>>,
}

impl NoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, item_id: Uuid, note: VerificationNote) {
        self.notes
            .lock()
            .unwrap()
            .entry(item_id)
            .or_default()
            .push(note);
    }

    pub fn notes_for(&self, item_id: Uuid) -> Vec<VerificationNote> {
        self.notes
            .lock()
            .unwrap()
            .get(&item_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn take(&self) -> IndexMap<Uuid, Vec<VerificationNote>> {
        std::mem::take(&mut *self.notes.lock().unwrap())
    }
}

/// Cheap handle sequencers use to dispatch jobs. Disabled handles
/// drop jobs on the floor without touching the queue.
#[derive(Clone)]
pub(crate) struct VerificationHandle {
    enabled: bool,
    tx: mpsc::UnboundedSender<VerificationJob>,
}

impl VerificationHandle {
    pub fn dispatch(&self, item_id: Uuid, request: VerifyRequest) {
        if !self.enabled {
            return;
        }
        let stage = request.stage();
        if self.tx.send(VerificationJob { item_id, request }).is_err() {
            debug!(%item_id, %stage, "verification worker gone, dropping job");
        }
    }
}

pub(crate) struct VerificationChannel;

impl VerificationChannel {
    /// Spawn the worker and hand back the dispatch handle plus the
    /// worker's join handle so the run can drain outstanding jobs
    /// before sealing its report.
    pub fn spawn(
        client: Arc<dyn RemoteStageClient>,
        notes: NoteStore,
        cancel: CancellationToken,
        enabled: bool,
    ) -> (VerificationHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<VerificationJob>();
        let worker = tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let VerificationJob { item_id, request } = job;
                let stage = request.stage();
                match client.verify(request, cancel.clone()).await {
                    Ok(note) => {
                        debug!(item = %item_id, %stage, status = ?note.status, "verification note attached");
                        notes.attach(item_id, note);
                    }
                    Err(RemoteError::Cancelled) => break,
                    Err(err) => {
                        // Advisory only: a failed QA call never fails
                        // the item it was checking.
                        warn!(item = %item_id, %stage, %err, "verification failed, ignoring");
                    }
                }
            }
        });
        (VerificationHandle { enabled, tx }, worker)
    }
}
