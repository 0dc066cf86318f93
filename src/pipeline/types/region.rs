use serde::{Deserialize, Serialize};

/// Detected coordinates are normalized to this span regardless of the
/// source scan's pixel resolution: top-left = (0, 0), bottom-right =
/// (1000, 1000).
pub const NORMALIZED_SPAN: u32 = 1000;

/// A point of a detected photo contour, in normalized coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContourPoint {
    pub x: u32,
    pub y: u32,
}

/// One detected sub-photo within a scanned sheet.
///
/// The rotation hint records how far the photo currently appears
/// rotated clockwise from upright, so a hint of 90 means the crop must
/// be rotated 270 degrees clockwise to stand the photo back up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub confidence: f32,
    #[serde(default)]
    pub rotation_deg: f32,
    #[serde(default)]
    pub contour: Option<Vec<ContourPoint>>,
    /// True when the contour leaves empty corners inside the bounding
    /// rectangle that need synthetic fill by the outpaint stage.
    #[serde(default)]
    pub needs_fill: bool,
    #[serde(default)]
    pub label: Option<String>,
}

impl BoundingRegion {
    /// A region covering the whole scan, used when the detector finds
    /// a single photo filling the sheet (or nothing at all).
    pub fn full_scan() -> Self {
        Self {
            x: 0,
            y: 0,
            width: NORMALIZED_SPAN,
            height: NORMALIZED_SPAN,
            confidence: 1.0,
            rotation_deg: 0.0,
            contour: None,
            needs_fill: false,
            label: None,
        }
    }

    /// Rotation hint quantized to the nearest multiple of 90, mod 360.
    pub fn quantized_rotation(&self) -> u32 {
        let steps = (self.rotation_deg / 90.0).round() as i64;
        (steps.rem_euclid(4) * 90) as u32
    }

    /// Clockwise rotation that restores the region to upright.
    pub fn correction_deg(&self) -> u32 {
        (360 - self.quantized_rotation()) % 360
    }

    /// Whether the outpaint stage applies to this region: the fill
    /// flag is set and the contour actually describes an area.
    pub fn wants_outpaint(&self) -> bool {
        self.needs_fill
            && self
                .contour
                .as_ref()
                .is_some_and(|points| points.len() >= 3)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!(
                "degenerate region {}x{} at ({}, {})",
                self.width, self.height, self.x, self.y
            ));
        }
        if self.x > NORMALIZED_SPAN
            || self.y > NORMALIZED_SPAN
            || self.x + self.width > NORMALIZED_SPAN
            || self.y + self.height > NORMALIZED_SPAN
        {
            return Err(format!(
                "region ({}, {}) {}x{} exceeds the normalized {} span",
                self.x, self.y, self.width, self.height, NORMALIZED_SPAN
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!("confidence {} outside [0, 1]", self.confidence));
        }
        Ok(())
    }
}
