use super::stage::StageKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Pass,
    Warning,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationCheck {
    pub name: String,
    pub passed: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationIssue {
    pub severity: String,
    pub description: String,
    pub suggestion: Option<String>,
}

/// Advisory QA annotation produced by the verification provider after
/// a stage succeeds. Notes never gate progress; one may arrive after
/// the pipeline has already moved past the stage it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationNote {
    pub id: Uuid,
    pub stage: StageKind,
    pub status: VerificationStatus,
    /// Provider self-reported confidence, 0-100.
    pub confidence: u8,
    pub checks: Vec<VerificationCheck>,
    pub issues: Vec<VerificationIssue>,
    pub recommendations: Vec<String>,
    /// Which cropped photo the note refers to, for crop and
    /// restoration QA.
    pub crop_index: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl VerificationNote {
    pub fn new(stage: StageKind, status: VerificationStatus, confidence: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage,
            status,
            confidence: confidence.min(100),
            checks: Vec::new(),
            issues: Vec::new(),
            recommendations: Vec::new(),
            crop_index: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_crop_index(mut self, index: usize) -> Self {
        self.crop_index = Some(index);
        self
    }
}
