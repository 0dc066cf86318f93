use crate::config::PipelineSettings;
use crate::pipeline::types::StageKind;
use std::time::Duration;

/// What to do after a failed stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Pure backoff policy: a function of (stage kind, attempt number)
/// with no side effects. The sequencer owns the per-(item, stage)
/// attempt counter; this type only answers whether another attempt is
/// allowed and how long to wait first.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
            max_delay,
        }
    }

    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.base_delay_ms),
            settings.backoff_multiplier,
            Duration::from_millis(settings.max_delay_ms),
        )
    }

    /// Attempt budget per stage kind. Verification is fire-and-forget;
    /// detection and cropping rarely fail transiently, so they get a
    /// single retry; the generative stages see the most transient
    /// provider errors and use the full configured budget.
    pub fn attempt_budget(&self, stage: StageKind) -> u32 {
        match stage {
            StageKind::Verify => 1,
            StageKind::Detect | StageKind::Crop => 2.min(self.max_attempts),
            StageKind::Outpaint | StageKind::Restore => self.max_attempts,
        }
    }

    /// Decide after `attempt` (1-based) failed attempts of `stage`.
    pub fn evaluate(&self, stage: StageKind, attempt: u32) -> RetryDecision {
        if attempt >= self.attempt_budget(stage) {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.delay_for(attempt))
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(500), 2.0, Duration::from_millis(1500))
    }

    #[test]
    fn test_verification_never_retries() {
        assert_eq!(
            policy().evaluate(StageKind::Verify, 1),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_detect_and_crop_get_one_retry() {
        for stage in [StageKind::Detect, StageKind::Crop] {
            assert_eq!(
                policy().evaluate(stage, 1),
                RetryDecision::RetryAfter(Duration::from_millis(500))
            );
            assert_eq!(policy().evaluate(stage, 2), RetryDecision::GiveUp);
        }
    }

    #[test]
    fn test_restore_uses_full_budget_with_capped_backoff() {
        let p = policy();
        assert_eq!(
            p.evaluate(StageKind::Restore, 1),
            RetryDecision::RetryAfter(Duration::from_millis(500))
        );
        assert_eq!(
            p.evaluate(StageKind::Restore, 2),
            RetryDecision::RetryAfter(Duration::from_millis(1000))
        );
        assert_eq!(p.evaluate(StageKind::Restore, 3), RetryDecision::GiveUp);

        // The cap kicks in before the multiplier can exceed it.
        let wide = RetryPolicy::new(5, Duration::from_millis(500), 3.0, Duration::from_millis(1500));
        assert_eq!(
            wide.evaluate(StageKind::Outpaint, 3),
            RetryDecision::RetryAfter(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_single_attempt_budget_respected() {
        let p = RetryPolicy::new(1, Duration::from_millis(100), 2.0, Duration::from_millis(100));
        for stage in [StageKind::Detect, StageKind::Restore] {
            assert_eq!(p.evaluate(stage, 1), RetryDecision::GiveUp);
        }
    }
}
