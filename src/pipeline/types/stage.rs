use serde::{Deserialize, Serialize};

/// One discrete processing step applied to an item. Crop is the only
/// local stage; every other kind is a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Detect,
    Crop,
    Outpaint,
    Restore,
    Verify,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Detect => "detect",
            StageKind::Crop => "crop",
            StageKind::Outpaint => "outpaint",
            StageKind::Restore => "restore",
            StageKind::Verify => "verify",
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, StageKind::Crop)
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
