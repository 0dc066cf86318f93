use super::region::BoundingRegion;
use super::stage::StageKind;
use super::verification::VerificationNote;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod raster_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Run-level status as seen by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled | RunStatus::Completed | RunStatus::Failed
        )
    }
}

/// Terminal state of one item. A failed item names the stage that
/// exhausted its retries so the caller can offer a per-item retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "status")]
pub enum ItemOutcome {
    Done,
    Failed { stage: StageKind, reason: String },
    Cancelled,
}

impl ItemOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, ItemOutcome::Done)
    }
}

/// One restored sub-photo extracted from a scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoredPhoto {
    pub id: Uuid,
    pub index: usize,
    #[serde(with = "raster_b64")]
    pub bytes: Vec<u8>,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub improvements: Vec<String>,
    pub provider: String,
    pub source_region: BoundingRegion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReport {
    pub index: usize,
    pub item_id: Uuid,
    pub file_name: Option<String>,
    pub outcome: ItemOutcome,
    /// Photos restored before the item reached its terminal state;
    /// partial on failure or cancellation.
    pub photos: Vec<RestoredPhoto>,
    pub verification_notes: Vec<VerificationNote>,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub items: Vec<ItemReport>,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunReport {
    pub fn tally(run_id: Uuid, status: RunStatus, started_at: DateTime<Utc>, items: Vec<ItemReport>) -> Self {
        let completed = items.iter().filter(|i| matches!(i.outcome, ItemOutcome::Done)).count();
        let failed = items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Failed { .. }))
            .count();
        let cancelled = items
            .iter()
            .filter(|i| matches!(i.outcome, ItemOutcome::Cancelled))
            .count();
        Self {
            run_id,
            status,
            started_at,
            finished_at: Utc::now(),
            items,
            completed,
            failed,
            cancelled,
        }
    }
}
