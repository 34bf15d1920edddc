use serde::Serialize;

/// Axis-aligned box in source-frame pixel coordinates.
///
/// Always lies within `[0, frame_width) x [0, frame_height)` and has non-zero
/// area; boxes that would not are dropped during decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One labeled detection. Serializes flat: `{label, confidence, x, y, width, height}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionResult {
    pub label: String,
    /// Combined `class_score * objectness`, within `[0, 1]`.
    pub confidence: f32,
    #[serde(flatten)]
    pub bbox: BoundingBox,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_flat_box_fields() -> anyhow::Result<()> {
        let result = DetectionResult {
            label: "person".to_string(),
            confidence: 0.5,
            bbox: BoundingBox {
                x: 1,
                y: 2,
                width: 3,
                height: 4,
            },
        };
        let value = serde_json::to_value(&result)?;
        assert_eq!(
            value,
            serde_json::json!({
                "label": "person",
                "confidence": 0.5,
                "x": 1,
                "y": 2,
                "width": 3,
                "height": 4
            })
        );
        Ok(())
    }
}
