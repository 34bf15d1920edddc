//! Turning raw model rows into labeled, frame-space boxes.
//!
//! Row layout is `[cx, cy, w, h, objectness, score_0 .. score_{C-1}]` with the
//! box expressed in model-input pixels. No overlap suppression is performed:
//! overlapping candidates above threshold are all reported.

use anyhow::{anyhow, Result};

use super::backend::OutputTensor;
use super::labels::label_for;
use super::result::{BoundingBox, DetectionResult};

const BOX_FIELDS: usize = 5;

/// Frame and model-input dimensions used to map boxes back into the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub frame_width: u32,
    pub frame_height: u32,
    pub input_width: u32,
    pub input_height: u32,
}

pub(crate) fn decode_candidates(
    output: &OutputTensor,
    threshold: f32,
    geometry: Geometry,
    labels: &[String],
) -> Result<Vec<DetectionResult>> {
    let (rows, row_len) = match output.shape.as_slice() {
        [rows, row_len] | [1, rows, row_len] => (*rows, *row_len),
        other => return Err(anyhow!("unexpected model output shape {:?}", other)),
    };
    if row_len <= BOX_FIELDS {
        return Err(anyhow!(
            "model output rows have {} values, need at least {}",
            row_len,
            BOX_FIELDS + 1
        ));
    }
    let expected = rows
        .checked_mul(row_len)
        .ok_or_else(|| anyhow!("model output shape overflows"))?;
    if output.data.len() != expected {
        return Err(anyhow!(
            "model output has {} values, shape {:?} needs {}",
            output.data.len(),
            output.shape,
            expected
        ));
    }

    let mut detections = Vec::new();
    for row in output.data.chunks_exact(row_len) {
        if let Some(detection) = decode_row(row, threshold, geometry, labels) {
            detections.push(detection);
        }
    }
    Ok(detections)
}

fn decode_row(
    row: &[f32],
    threshold: f32,
    geometry: Geometry,
    labels: &[String],
) -> Option<DetectionResult> {
    let objectness = row[4];
    if !objectness.is_finite() || objectness < threshold {
        return None;
    }

    let (class_id, class_score) = row[BOX_FIELDS..]
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, score)| score.is_finite())
        .fold(None, |best: Option<(usize, f32)>, (id, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((id, score)),
        })?;

    let confidence = class_score * objectness;
    if !confidence.is_finite() || confidence < threshold {
        return None;
    }

    let bbox = frame_box(&row[..4], geometry)?;
    Some(DetectionResult {
        label: label_for(labels, class_id),
        confidence: confidence.clamp(0.0, 1.0),
        bbox,
    })
}

/// Scale a center/size box from model-input space into the frame and clamp it.
fn frame_box(coords: &[f32], geometry: Geometry) -> Option<BoundingBox> {
    if coords.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let scale_x = geometry.frame_width as f32 / geometry.input_width as f32;
    let scale_y = geometry.frame_height as f32 / geometry.input_height as f32;
    let (cx, cy, w, h) = (coords[0], coords[1], coords[2], coords[3]);

    let (x, width) = clamp_span((cx - w / 2.0) * scale_x, w * scale_x, geometry.frame_width)?;
    let (y, height) = clamp_span((cy - h / 2.0) * scale_y, h * scale_y, geometry.frame_height)?;
    Some(BoundingBox {
        x,
        y,
        width,
        height,
    })
}

fn clamp_span(start: f32, len: f32, limit: u32) -> Option<(u32, u32)> {
    let limit_f = limit as f32;
    let lo = start.clamp(0.0, limit_f).floor();
    let hi = (start + len.max(0.0)).clamp(0.0, limit_f).ceil().min(limit_f);
    let lo = lo as u32;
    let hi = hi as u32;
    if hi <= lo || lo >= limit {
        return None;
    }
    Some((lo, hi - lo))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEOMETRY: Geometry = Geometry {
        frame_width: 640,
        frame_height: 480,
        input_width: 640,
        input_height: 640,
    };

    fn labels() -> Vec<String> {
        vec!["person".to_string(), "car".to_string()]
    }

    fn tensor(rows: &[[f32; 7]]) -> OutputTensor {
        OutputTensor {
            shape: vec![1, rows.len(), 7],
            data: rows.iter().flatten().copied().collect(),
        }
    }

    #[test]
    fn combined_score_gates_acceptance() -> Result<()> {
        let output = tensor(&[
            [320.0, 320.0, 100.0, 100.0, 0.9, 0.6, 0.1],
            [320.0, 320.0, 100.0, 100.0, 0.9, 0.4, 0.1],
        ]);
        let detections = decode_candidates(&output, 0.5, GEOMETRY, &labels())?;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "person");
        assert!((detections[0].confidence - 0.54).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn low_objectness_is_rejected_before_class_scores() -> Result<()> {
        let output = tensor(&[[320.0, 320.0, 50.0, 50.0, 0.4, 1.0, 1.0]]);
        assert!(decode_candidates(&output, 0.5, GEOMETRY, &labels())?.is_empty());
        Ok(())
    }

    #[test]
    fn picks_highest_class_score() -> Result<()> {
        let output = tensor(&[[320.0, 320.0, 50.0, 50.0, 1.0, 0.6, 0.8]]);
        let detections = decode_candidates(&output, 0.5, GEOMETRY, &labels())?;
        assert_eq!(detections[0].label, "car");
        Ok(())
    }

    #[test]
    fn box_is_scaled_into_frame_space() -> Result<()> {
        // 640x640 input, 640x480 frame: y scales by 0.75.
        let output = tensor(&[[320.0, 320.0, 100.0, 200.0, 1.0, 1.0, 0.0]]);
        let detections = decode_candidates(&output, 0.5, GEOMETRY, &labels())?;
        assert_eq!(
            detections[0].bbox,
            BoundingBox {
                x: 270,
                y: 165,
                width: 100,
                height: 150
            }
        );
        Ok(())
    }

    #[test]
    fn boxes_are_clamped_and_degenerate_ones_dropped() -> Result<()> {
        let output = tensor(&[
            [0.0, 0.0, 200.0, 200.0, 1.0, 1.0, 0.0],
            [700.0, 700.0, 20.0, 20.0, 1.0, 1.0, 0.0],
            [320.0, 320.0, 0.0, 0.0, 1.0, 1.0, 0.0],
        ]);
        let detections = decode_candidates(&output, 0.5, GEOMETRY, &labels())?;
        assert_eq!(detections.len(), 1);
        let bbox = detections[0].bbox;
        assert_eq!((bbox.x, bbox.y), (0, 0));
        assert!(bbox.x + bbox.width <= GEOMETRY.frame_width);
        assert!(bbox.y + bbox.height <= GEOMETRY.frame_height);
        Ok(())
    }

    #[test]
    fn non_finite_scores_are_rejected() -> Result<()> {
        let output = tensor(&[
            [320.0, 320.0, 50.0, 50.0, f32::NAN, 1.0, 1.0],
            [320.0, 320.0, 50.0, 50.0, 1.0, f32::NAN, f32::INFINITY],
        ]);
        assert!(decode_candidates(&output, 0.5, GEOMETRY, &labels())?.is_empty());
        Ok(())
    }

    #[test]
    fn unknown_class_id_gets_placeholder_label() -> Result<()> {
        let output = tensor(&[[320.0, 320.0, 50.0, 50.0, 1.0, 0.0, 0.9]]);
        let detections = decode_candidates(&output, 0.5, GEOMETRY, &labels()[..1])?;
        assert_eq!(detections[0].label, "class_1");
        Ok(())
    }

    #[test]
    fn malformed_shapes_are_errors() {
        let labels = labels();
        let bad_rank = OutputTensor {
            shape: vec![2, 1, 1, 7],
            data: vec![0.0; 14],
        };
        let too_narrow = OutputTensor {
            shape: vec![1, 5],
            data: vec![0.0; 5],
        };
        let short_data = OutputTensor {
            shape: vec![2, 7],
            data: vec![0.0; 7],
        };
        for output in [bad_rank, too_narrow, short_data] {
            assert!(decode_candidates(&output, 0.5, GEOMETRY, &labels).is_err());
        }
    }
}
