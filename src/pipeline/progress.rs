//! Weighted progress aggregation and the advisory ETA model for a
//! running batch. All bookkeeping here is synchronous; sequencers call
//! in at stage transitions and observers read the published snapshot.

use crate::config::StageDurationPriors;
use crate::pipeline::types::{ItemOutcome, RunStatus, StageKind};
use indexmap::IndexMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// EWMA smoothing for observed stage durations.
const DURATION_ALPHA: f64 = 0.3;

/// Relative cost of each stage kind. An item's effective weights are
/// these values normalized over its applicable stage list, so they sum
/// to 1 whether or not outpainting participates.
fn base_weight(stage: StageKind) -> f64 {
    match stage {
        StageKind::Detect => 0.1,
        StageKind::Crop => 0.05,
        StageKind::Outpaint => 0.25,
        StageKind::Restore => 0.6,
        StageKind::Verify => 0.0,
    }
}

pub(crate) fn normalized_weights(stages: &[StageKind]) -> Vec<f64> {
    let total: f64 = stages.iter().map(|s| base_weight(*s)).sum();
    if total <= 0.0 {
        return vec![0.0; stages.len()];
    }
    stages.iter().map(|s| base_weight(*s) / total).collect()
}

/// Completed stage weights plus the current stage scaled by its own
/// sub-progress.
pub(crate) fn item_fraction(weights: &[f64], completed: usize, sub_progress: f64) -> f64 {
    let done: f64 = weights.iter().take(completed).sum();
    let current = weights.get(completed).copied().unwrap_or(0.0);
    (done + current * sub_progress.clamp(0.0, 1.0)).clamp(0.0, 1.0)
}

/// Live progress event published to observers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressSnapshot {
    pub total_items: usize,
    pub current_item_index: usize,
    pub overall_progress_percent: f64,
    pub eta_millis: u64,
    pub message: String,
    pub status: RunStatus,
}

impl ProgressSnapshot {
    fn idle(total_items: usize) -> Self {
        Self {
            total_items,
            current_item_index: 0,
            overall_progress_percent: 0.0,
            eta_millis: 0,
            message: "Waiting to start".to_string(),
            status: RunStatus::Idle,
        }
    }
}

struct ItemProgress {
    stages: Vec<StageKind>,
    weights: Vec<f64>,
    completed: usize,
    sub_progress: f64,
    /// High-water mark so a mid-run stage-plan change (outpaint joining
    /// the plan after detection) can never move overall progress
    /// backwards.
    watermark: f64,
    terminal: bool,
}

impl ItemProgress {
    fn new(stages: Vec<StageKind>) -> Self {
        let weights = normalized_weights(&stages);
        Self {
            stages,
            weights,
            completed: 0,
            sub_progress: 0.0,
            watermark: 0.0,
            terminal: false,
        }
    }

    fn fraction(&mut self) -> f64 {
        let raw = item_fraction(&self.weights, self.completed, self.sub_progress);
        self.watermark = self.watermark.max(raw);
        self.watermark
    }
}

/// Expected stage durations: configured priors refined by an
/// exponentially-weighted average of durations observed in this run.
struct DurationModel {
    priors: StageDurationPriors,
    observed: IndexMap<StageKind, f64>,
}

impl DurationModel {
    fn new(priors: StageDurationPriors) -> Self {
        Self {
            priors,
            observed: IndexMap::new(),
        }
    }

    fn observe(&mut self, stage: StageKind, duration: Duration) {
        let ms = duration.as_millis() as f64;
        let entry = self
            .observed
            .entry(stage)
            .or_insert(self.priors.for_stage(stage) as f64);
        *entry = DURATION_ALPHA * ms + (1.0 - DURATION_ALPHA) * *entry;
    }

    fn expected_ms(&self, stage: StageKind) -> f64 {
        self.observed
            .get(&stage)
            .copied()
            .unwrap_or(self.priors.for_stage(stage) as f64)
    }
}

struct TrackerState {
    items: Vec<ItemProgress>,
    durations: DurationModel,
    status: RunStatus,
    current_item: usize,
    message: String,
}

/// Shared run-state ledger. Mutated only through these methods, read
/// by observers through the watch channel — no ambient globals, so
/// concurrent runs cannot interfere.
pub(crate) struct RunTracker {
    state: Mutex<TrackerState>,
    progress: watch::Sender<ProgressSnapshot>,
}

impl RunTracker {
    pub fn new(total_items: usize, priors: StageDurationPriors, default_plan: Vec<StageKind>) -> Self {
        let items = (0..total_items)
            .map(|_| ItemProgress::new(default_plan.clone()))
            .collect();
        let (progress, _) = watch::channel(ProgressSnapshot::idle(total_items));
        Self {
            state: Mutex::new(TrackerState {
                items,
                durations: DurationModel::new(priors),
                status: RunStatus::Idle,
                current_item: 0,
                message: "Waiting to start".to_string(),
            }),
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    pub fn status(&self) -> RunStatus {
        self.state.lock().unwrap().status
    }

    pub fn set_status(&self, status: RunStatus) {
        {
            let mut state = self.state.lock().unwrap();
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
            if status == RunStatus::Paused {
                state.message = "Paused".to_string();
            }
        }
        self.publish();
    }

    /// Swap in the stage plan decided after detection (outpainting may
    /// join). Already-completed stages keep their credit.
    pub fn set_stage_plan(&self, index: usize, stages: Vec<StageKind>) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(item) = state.items.get_mut(index) {
                item.completed = item.completed.min(stages.len());
                item.weights = normalized_weights(&stages);
                item.stages = stages;
                item.sub_progress = 0.0;
            }
        }
        self.publish();
    }

    pub fn stage_started(&self, index: usize, stage: StageKind) {
        {
            let mut state = self.state.lock().unwrap();
            state.current_item = index;
            let total = state.items.len();
            state.message = match stage {
                StageKind::Detect => format!("Detecting photos in scan {}/{}", index + 1, total),
                StageKind::Crop => format!("Cropping scan {}/{}", index + 1, total),
                StageKind::Outpaint => format!("Filling photo edges in scan {}/{}", index + 1, total),
                StageKind::Restore => format!("Restoring scan {}/{}", index + 1, total),
                StageKind::Verify => format!("Verifying scan {}/{}", index + 1, total),
            };
        }
        self.publish();
    }

    pub fn set_sub_progress(&self, index: usize, fraction: f64) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(item) = state.items.get_mut(index) {
                if !item.terminal {
                    item.sub_progress = fraction.clamp(0.0, 1.0);
                }
            }
        }
        self.publish();
    }

    pub fn stage_completed(&self, index: usize, stage: StageKind, duration: Duration) {
        {
            let mut state = self.state.lock().unwrap();
            state.durations.observe(stage, duration);
            if let Some(item) = state.items.get_mut(index) {
                if item.completed < item.stages.len() {
                    item.completed += 1;
                }
                item.sub_progress = 0.0;
            }
        }
        debug!(stage = %stage, item = index, ?duration, "stage completed");
        self.publish();
    }

    pub fn item_finished(&self, index: usize, outcome: &ItemOutcome) {
        {
            let mut state = self.state.lock().unwrap();
            let total = state.items.len();
            if let Some(item) = state.items.get_mut(index) {
                item.terminal = true;
                if outcome.is_done() {
                    item.completed = item.stages.len();
                    item.sub_progress = 0.0;
                    item.watermark = 1.0;
                }
            }
            state.message = match outcome {
                ItemOutcome::Done => format!("Finished scan {}/{}", index + 1, total),
                ItemOutcome::Failed { stage, .. } => {
                    format!("Scan {}/{} failed during {}", index + 1, total, stage)
                }
                ItemOutcome::Cancelled => format!("Scan {}/{} cancelled", index + 1, total),
            };
        }
        self.publish();
    }

    /// Recompute and publish the snapshot observers see.
    fn publish(&self) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            let total_items = state.items.len();
            let mean_fraction = if total_items == 0 {
                1.0
            } else {
                let sum: f64 = state.items.iter_mut().map(|i| i.fraction()).sum();
                sum / total_items as f64
            };

            let mut eta_ms = 0.0;
            for item in &state.items {
                if item.terminal {
                    continue;
                }
                for (offset, stage) in item.stages[item.completed..].iter().enumerate() {
                    let mut expected = state.durations.expected_ms(*stage);
                    if offset == 0 {
                        expected *= 1.0 - item.sub_progress;
                    }
                    eta_ms += expected;
                }
            }

            ProgressSnapshot {
                total_items,
                current_item_index: state.current_item,
                overall_progress_percent: mean_fraction * 100.0,
                eta_millis: eta_ms as u64,
                message: state.message.clone(),
                status: state.status,
            }
        };
        self.progress.send_replace(snapshot);
    }
}
