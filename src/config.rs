use crate::error::PipelineError;
use crate::pipeline::types::StageKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-operation timeouts for remote calls. Restoration and outpainting
/// are generative calls measured in tens of seconds; detection and
/// verification are short analysis calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub detect_secs: u64,
    pub outpaint_secs: u64,
    pub restore_secs: u64,
    pub verify_secs: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            detect_secs: 15,
            outpaint_secs: 60,
            restore_secs: 90,
            verify_secs: 20,
        }
    }
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: StageKind) -> Duration {
        let secs = match stage {
            StageKind::Detect | StageKind::Crop => self.detect_secs,
            StageKind::Outpaint => self.outpaint_secs,
            StageKind::Restore => self.restore_secs,
            StageKind::Verify => self.verify_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Seed values for the per-stage duration model used by the ETA
/// estimator, before any observed durations are available.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageDurationPriors {
    pub detect_ms: u64,
    pub crop_ms: u64,
    pub outpaint_ms: u64,
    pub restore_ms: u64,
}

impl Default for StageDurationPriors {
    fn default() -> Self {
        Self {
            detect_ms: 4_000,
            crop_ms: 200,
            outpaint_ms: 8_000,
            restore_ms: 20_000,
        }
    }
}

impl StageDurationPriors {
    pub fn for_stage(&self, stage: StageKind) -> u64 {
        match stage {
            StageKind::Detect => self.detect_ms,
            StageKind::Crop => self.crop_ms,
            StageKind::Outpaint => self.outpaint_ms,
            StageKind::Restore => self.restore_ms,
            StageKind::Verify => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// How many items run their stage sequences simultaneously.
    pub concurrency: usize,
    /// Attempt budget for stages that use the full retry budget.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub enable_outpaint: bool,
    pub enable_verification: bool,
    /// Symmetric crop padding as a fraction of the box's own size.
    pub padding_fraction: f64,
    pub timeouts: StageTimeouts,
    pub duration_priors: StageDurationPriors,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_attempts: 3,
            base_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 8_000,
            enable_outpaint: true,
            enable_verification: true,
            padding_fraction: 0.02,
            timeouts: StageTimeouts::default(),
            duration_priors: StageDurationPriors::default(),
        }
    }
}

impl PipelineSettings {
    /// Load settings from an optional `scanrestore.*` config file plus
    /// `SCANRESTORE_*` environment overrides.
    pub fn load() -> Result<Self, PipelineError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name("scanrestore").required(false))
            .add_source(config::Environment::with_prefix("SCANRESTORE").separator("__"))
            .build()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        let settings: PipelineSettings = cfg
            .try_deserialize()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Configuration errors are the only run-level failures; they must
    /// be caught before any item starts.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.concurrency == 0 {
            return Err(PipelineError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..0.5).contains(&self.padding_fraction) {
            return Err(PipelineError::Config(format!(
                "padding_fraction {} outside [0, 0.5)",
                self.padding_fraction
            )));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(PipelineError::Config(format!(
                "backoff_multiplier {} must be >= 1",
                self.backoff_multiplier
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(PipelineError::Config(
                "max_delay_ms must be >= base_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}
